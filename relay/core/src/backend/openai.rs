//! OpenAI-compatible Backend
//!
//! Streams chat completions from any provider speaking the OpenAI
//! `/chat/completions` SSE dialect. OpenAI itself and Groq are the two
//! configured out of the box.
//!
//! # Wire shape
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//!
//! data: [DONE]
//! ```
//!
//! Frames are split with the relay's own [`SseDecoder`]; payloads go through
//! [`ProviderChunk`] so this file never looks inside a chunk.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};

use super::chunk::ProviderChunk;
use super::traits::{
    event_channel, single_event, BackendError, CompletionBackend, CompletionRequest, Credential,
    EventStream,
};
use crate::messages::StreamEvent;
use crate::transport::SseDecoder;

/// Default time allowed for the provider to start responding
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// OpenAI-compatible streaming backend
#[derive(Clone)]
pub struct OpenAiBackend {
    /// Display name ("OpenAI", "Groq")
    name: String,
    /// API base URL, e.g. `https://api.openai.com/v1`
    base_url: String,
    /// Bearer credential, resolved per request
    credential: Credential,
    /// Time allowed until response headers arrive
    timeout: Duration,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OpenAiBackend {
    /// Create a backend
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Request` if the HTTP client cannot be built.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        credential: Credential,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| BackendError::Request(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into(),
            credential,
            timeout,
            http_client,
        })
    }

    /// Chat completions endpoint URL
    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Build the JSON request body
    fn build_body(request: &CompletionRequest) -> serde_json::Value {
        serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": true,
        })
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_credentials(&self) -> Result<(), BackendError> {
        self.credential.resolve().map(|_| ())
    }

    async fn start_completion(&self, request: &CompletionRequest) -> EventStream {
        let api_key = match self.credential.resolve() {
            Ok(key) => key,
            Err(e) => return single_event(StreamEvent::Error(e.to_string())),
        };

        let http_request = self
            .http_client
            .post(self.chat_url())
            .bearer_auth(api_key)
            .json(&Self::build_body(request));

        let (tx, stream) = event_channel();
        let span = tracing::debug_span!("upstream", backend = %self.name, model = %request.model);
        tokio::spawn(pump_completion(http_request, self.timeout, tx).instrument(span));
        stream
    }
}

/// Drive one upstream call, forwarding normalized events into `tx`
///
/// Returns as soon as a terminal event was sent or the consumer went away;
/// returning drops the response and with it the upstream connection.
async fn pump_completion(
    request: reqwest::RequestBuilder,
    timeout: Duration,
    tx: mpsc::Sender<StreamEvent>,
) {
    let response = tokio::select! {
        () = tx.closed() => {
            debug!("Consumer dropped before upstream responded");
            return;
        }
        result = tokio::time::timeout(timeout, request.send()) => result,
    };

    let response = match response {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(error = %e, "Upstream request failed");
            let _ = tx
                .send(StreamEvent::Error(BackendError::Request(e.to_string()).to_string()))
                .await;
            return;
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "Upstream timed out");
            let reason = BackendError::Request(format!(
                "no response within {}s",
                timeout.as_secs()
            ));
            let _ = tx.send(StreamEvent::Error(reason.to_string())).await;
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(%status, %body, "Upstream rejected completion request");
        let reason = BackendError::Status {
            status: status.as_u16(),
            body,
        };
        let _ = tx.send(StreamEvent::Error(reason.to_string())).await;
        return;
    }

    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    loop {
        let chunk = tokio::select! {
            () = tx.closed() => {
                debug!("Consumer dropped, closing upstream stream");
                return;
            }
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                decoder.push(&bytes);
                while let Some(frame) = decoder.next_frame() {
                    let frame = match frame {
                        Ok(frame) => frame,
                        Err(e) if e.is_fatal() => {
                            warn!(error = %e, "Upstream frame overflow");
                            let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "Skipping undecodable upstream frame");
                            continue;
                        }
                    };

                    let parsed = match ProviderChunk::from_openai_data(&frame.data) {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            warn!(error = %e, "Skipping malformed upstream chunk");
                            continue;
                        }
                    };

                    for event in parsed.into_events() {
                        let terminal = event.is_terminal();
                        if tx.send(event).await.is_err() || terminal {
                            return;
                        }
                    }
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Upstream stream interrupted");
                let reason = BackendError::Request(e.to_string());
                let _ = tx.send(StreamEvent::Error(reason.to_string())).await;
                return;
            }
            None => {
                debug!(pending = decoder.available(), "Upstream closed without [DONE]");
                let _ = tx.send(StreamEvent::Done).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ChatMessage;
    use futures::StreamExt;

    fn backend(credential: Credential) -> OpenAiBackend {
        OpenAiBackend::new(
            "OpenAI",
            "https://api.openai.com/v1/",
            credential,
            DEFAULT_UPSTREAM_TIMEOUT,
        )
        .unwrap()
    }

    #[test]
    fn test_chat_url_trims_slash() {
        let backend = backend(Credential::Static("k".into()));
        assert_eq!(backend.chat_url(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn test_build_body() {
        let request = CompletionRequest::new(
            vec![ChatMessage::system("Be brief"), ChatMessage::user("Hi")],
            "gpt-4-turbo",
        )
        .with_max_tokens(64);

        let body = OpenAiBackend::build_body(&request);
        assert_eq!(body["model"], "gpt-4-turbo");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Hi");
    }

    #[test]
    fn test_check_credentials() {
        assert!(backend(Credential::Static("k".into())).check_credentials().is_ok());
        assert!(matches!(
            backend(Credential::env("RELAY_TEST_SURELY_UNSET_KEY")).check_credentials(),
            Err(BackendError::MissingCredential { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_credential_yields_single_error() {
        let backend = backend(Credential::env("RELAY_TEST_SURELY_UNSET_KEY"));
        let request = CompletionRequest::new(vec![ChatMessage::user("Hi")], "gpt-4");
        let events: Vec<_> = backend.start_completion(&request).await.collect().await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error(reason) if reason.contains("RELAY_TEST_SURELY_UNSET_KEY")));
    }
}
