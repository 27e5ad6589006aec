//! Provider chunk normalization
//!
//! Each provider frames its streaming output differently. This module is the
//! single place where raw provider payloads become [`StreamEvent`]s, so the
//! relay and the wire format never see provider shapes.

use serde::Deserialize;

use crate::messages::StreamEvent;
use crate::transport::DONE_SENTINEL;

/// OpenAI-compatible `chat.completion.chunk` payload
#[derive(Debug, Default, Deserialize)]
pub struct OpenAiChunk {
    /// Completion choices; only the first one is relayed
    #[serde(default)]
    pub choices: Vec<OpenAiChoice>,
    /// Error object some providers send mid-stream
    #[serde(default)]
    pub error: Option<ProviderError>,
}

/// One choice of an OpenAI-compatible chunk
#[derive(Debug, Default, Deserialize)]
pub struct OpenAiChoice {
    /// Incremental message content
    #[serde(default)]
    pub delta: Option<OpenAiDelta>,
}

/// Delta of an OpenAI-compatible choice
#[derive(Debug, Default, Deserialize)]
pub struct OpenAiDelta {
    /// Text fragment (absent on role-only and final chunks)
    #[serde(default)]
    pub content: Option<String>,
}

/// Provider error body, either `{ "message": ... }` or a bare string
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ProviderError {
    /// Structured error object
    Detailed {
        /// Human readable reason
        #[serde(default)]
        message: Option<String>,
    },
    /// Plain error string
    Plain(String),
}

impl ProviderError {
    fn into_reason(self) -> String {
        match self {
            Self::Detailed { message: Some(m) } if !m.is_empty() => m,
            Self::Detailed { .. } => "Provider reported an error".to_string(),
            Self::Plain(m) => m,
        }
    }
}

/// One line of Ollama's `/api/chat` NDJSON stream
#[derive(Debug, Default, Deserialize)]
pub struct OllamaChunk {
    /// Message fragment
    #[serde(default)]
    pub message: Option<OllamaMessage>,
    /// Set on the final line
    #[serde(default)]
    pub done: bool,
    /// Error reported instead of content
    #[serde(default)]
    pub error: Option<String>,
}

/// Message fragment of an Ollama chunk
#[derive(Debug, Default, Deserialize)]
pub struct OllamaMessage {
    /// Text fragment
    #[serde(default)]
    pub content: String,
}

/// A raw provider chunk tagged with the provider that produced it
#[derive(Debug)]
pub enum ProviderChunk {
    /// OpenAI-compatible SSE data payload
    OpenAi(OpenAiChunk),
    /// OpenAI-compatible `[DONE]` sentinel
    OpenAiDone,
    /// Ollama NDJSON line
    Ollama(OllamaChunk),
}

impl ProviderChunk {
    /// Parse the `data` field of an OpenAI-compatible SSE frame
    pub fn from_openai_data(data: &str) -> Result<Self, serde_json::Error> {
        if data.trim() == DONE_SENTINEL {
            return Ok(Self::OpenAiDone);
        }
        serde_json::from_str(data).map(Self::OpenAi)
    }

    /// Parse one line of an Ollama NDJSON stream
    pub fn from_ollama_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line).map(Self::Ollama)
    }

    /// Map the chunk to zero or more events
    ///
    /// Empty content produces no event. An error wins over any content in the
    /// same chunk.
    #[must_use]
    pub fn into_events(self) -> Vec<StreamEvent> {
        match self {
            Self::OpenAiDone => vec![StreamEvent::Done],
            Self::OpenAi(chunk) => {
                if let Some(error) = chunk.error {
                    return vec![StreamEvent::Error(error.into_reason())];
                }
                chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.delta)
                    .and_then(|delta| delta.content)
                    .filter(|text| !text.is_empty())
                    .map(StreamEvent::Delta)
                    .into_iter()
                    .collect()
            }
            Self::Ollama(chunk) => {
                if let Some(error) = chunk.error {
                    return vec![StreamEvent::Error(error)];
                }
                let mut events = Vec::with_capacity(2);
                if let Some(message) = chunk.message {
                    if !message.content.is_empty() {
                        events.push(StreamEvent::Delta(message.content));
                    }
                }
                if chunk.done {
                    events.push(StreamEvent::Done);
                }
                events
            }
        }
    }
}
