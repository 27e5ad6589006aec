//! Ollama Backend Implementation
//!
//! Streams chat completions from a local Ollama server.
//!
//! # Ollama API
//!
//! `/api/chat` takes the full message history and, with `"stream": true`,
//! answers with newline-delimited JSON:
//!
//! ```text
//! {"message":{"role":"assistant","content":"Hel"},"done":false}
//! {"message":{"role":"assistant","content":""},"done":true}
//! ```
//!
//! No credential is needed.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};

use super::chunk::ProviderChunk;
use super::traits::{event_channel, BackendError, CompletionBackend, CompletionRequest, EventStream};
use crate::messages::StreamEvent;
use crate::transport::MAX_FRAME_SIZE;

/// Ollama backend client
#[derive(Clone)]
pub struct OllamaBackend {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// Time allowed until response headers arrive
    timeout: Duration,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Request` if the HTTP client cannot be built.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| BackendError::Request(e.to_string()))?;

        Ok(Self {
            host: host.into(),
            port,
            timeout,
            http_client,
        })
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Get chat endpoint URL
    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url())
    }

    /// Build the JSON request body
    fn build_body(request: &CompletionRequest) -> serde_json::Value {
        serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        })
    }
}

#[async_trait]
impl CompletionBackend for OllamaBackend {
    fn name(&self) -> &str {
        "Ollama"
    }

    async fn start_completion(&self, request: &CompletionRequest) -> EventStream {
        let http_request = self
            .http_client
            .post(self.chat_url())
            .json(&Self::build_body(request));

        let (tx, stream) = event_channel();
        let span = tracing::debug_span!("upstream", backend = "Ollama", model = %request.model);
        tokio::spawn(pump_ndjson(http_request, self.timeout, tx).instrument(span));
        stream
    }
}

/// Split complete lines off the front of `buffer`
///
/// Bytes after the last newline stay buffered; lines are only decoded once
/// whole, so multi-byte characters split across reads survive.
fn take_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let Some(last) = buffer.iter().rposition(|&b| b == b'\n') else {
        return Vec::new();
    };
    let rest = buffer.split_off(last + 1);
    let complete = std::mem::replace(buffer, rest);
    complete
        .split(|&b| b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(<[u8]>::to_vec)
        .collect()
}

async fn pump_ndjson(
    request: reqwest::RequestBuilder,
    timeout: Duration,
    tx: mpsc::Sender<StreamEvent>,
) {
    let response = tokio::select! {
        () = tx.closed() => return,
        result = tokio::time::timeout(timeout, request.send()) => result,
    };

    let response = match response {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(error = %e, "Ollama request failed");
            let reason = BackendError::Request(e.to_string());
            let _ = tx.send(StreamEvent::Error(reason.to_string())).await;
            return;
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "Ollama timed out");
            let reason =
                BackendError::Request(format!("no response within {}s", timeout.as_secs()));
            let _ = tx.send(StreamEvent::Error(reason.to_string())).await;
            return;
        }
    };

    // Check for HTTP errors
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(%status, %body, "Ollama rejected completion request");
        let reason = BackendError::Status {
            status: status.as_u16(),
            body,
        };
        let _ = tx.send(StreamEvent::Error(reason.to_string())).await;
        return;
    }

    let mut body = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    loop {
        let chunk = tokio::select! {
            () = tx.closed() => {
                debug!("Consumer dropped, closing Ollama stream");
                return;
            }
            chunk = body.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                buffer.extend_from_slice(&bytes);
                for line in take_lines(&mut buffer) {
                    let parsed = std::str::from_utf8(&line)
                        .map_err(|e| e.to_string())
                        .and_then(|text| {
                            ProviderChunk::from_ollama_line(text.trim()).map_err(|e| e.to_string())
                        });
                    let parsed = match parsed {
                        Ok(parsed) => parsed,
                        Err(e) => {
                            warn!(error = %e, "Skipping malformed Ollama line");
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

                if buffer.len() > MAX_FRAME_SIZE {
                    warn!(size = buffer.len(), "Ollama line exceeds frame limit");
                    let reason = BackendError::Request("upstream line too large".into());
                    let _ = tx.send(StreamEvent::Error(reason.to_string())).await;
                    return;
                }
            }
            Some(Err(e)) => {
                let reason = BackendError::Request(e.to_string());
                let _ = tx.send(StreamEvent::Error(reason.to_string())).await;
                return;
            }
            None => {
                // Stream ended without done signal
                debug!(pending = buffer.len(), "Ollama closed without done");
                let _ = tx.send(StreamEvent::Done).await;
                return;
            }
        }
    }
}
