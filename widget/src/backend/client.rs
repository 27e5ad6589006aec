//! Relay Client
//!
//! Talks to the relay daemon's `/api/chat` endpoint.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use relay_core::ChatMessage;

use super::reader::StreamReader;

/// Relay endpoint used when nothing else is configured
pub const DEFAULT_RELAY_URL: &str = "http://127.0.0.1:3000/api/chat";

/// Wait suggested when a 429 carries no usable `Retry-After`
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Response body of the relay
pub type ByteStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// Errors raised before a reply stream exists
#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection or protocol failure
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The relay answered with a non-success status
    #[error("Relay returned {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// The relay's `error` field, or the raw body
        message: String,
    },

    /// The relay's rate limit rejected the request
    #[error("Rate limit exceeded, retry in {}s", retry_after.as_secs())]
    RateLimited {
        /// Time until a slot frees up
        retry_after: Duration,
    },
}

#[derive(Serialize)]
struct ChatBody<'a> {
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct CompleteBody {
    result: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client for the relay
#[derive(Clone, Debug)]
pub struct RelayClient {
    endpoint: String,
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    http_client: reqwest::Client,
}

impl RelayClient {
    /// Create a client for the given endpoint URL
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ClientError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            model: None,
            temperature: None,
            max_tokens: None,
            http_client,
        })
    }

    /// Request a specific model (the relay's default otherwise)
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the sampling temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Cap the reply length
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Endpoint URL
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn body<'a>(&'a self, messages: &'a [ChatMessage], stream: bool) -> ChatBody<'a> {
        ChatBody {
            messages,
            stream,
            model: self.model.as_deref(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    async fn post(
        &self,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<reqwest::Response, ClientError> {
        debug!(
            endpoint = %self.endpoint,
            messages = messages.len(),
            stream,
            "Sending chat request"
        );

        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&self.body(messages, stream))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(status_error(response).await)
        }
    }

    /// Send the conversation and stream the reply
    ///
    /// # Errors
    ///
    /// Connection failures and non-success statuses. Failures after the
    /// stream started arrive as [`relay_core::StreamEvent::Error`].
    pub async fn stream_chat(
        &self,
        messages: &[ChatMessage],
    ) -> Result<StreamReader<ByteStream>, ClientError> {
        let response = self.post(messages, true).await?;
        Ok(StreamReader::new(response.bytes_stream().boxed()))
    }

    /// Send the conversation and wait for the whole reply
    ///
    /// # Errors
    ///
    /// Connection failures, non-success statuses and unreadable bodies.
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ClientError> {
        let response = self.post(messages, false).await?;
        let body: CompleteBody = response.json().await?;
        Ok(body.result)
    }
}

async fn status_error(response: reqwest::Response) -> ClientError {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs);
        return ClientError::RateLimited { retry_after };
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.error)
        .unwrap_or(text);

    ClientError::Status {
        status: status.as_u16(),
        message,
    }
}
