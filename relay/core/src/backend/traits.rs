//! Completion Backend Traits
//!
//! Trait definitions for upstream LLM providers. The relay only ever sees a
//! lazy sequence of [`StreamEvent`]s; how a provider frames its output is the
//! backend's business.
//!
//! # Contract
//!
//! [`CompletionBackend::start_completion`] returns an [`EventStream`] that:
//! - yields zero or more `Delta`s followed by exactly one `Done` or `Error`
//! - is single-use and finite
//! - releases the upstream connection when dropped early
//!
//! Backends never retry; a failed call yields a single `Error` event.

use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::messages::{ChatMessage, StreamEvent};

/// Environment variable holding the OpenAI credential
pub const OPENAI_API_KEY_VAR: &str = "OPENAI_API_KEY";

/// Environment variable holding the Groq credential
pub const GROQ_API_KEY_VAR: &str = "GROQ_API_KEY";

/// Default OpenAI API base URL
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default Groq (OpenAI-compatible) API base URL
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// Ollama host used when none is configured
pub const DEFAULT_OLLAMA_HOST: &str = "localhost";

/// Ollama port used when none is configured
pub const DEFAULT_OLLAMA_PORT: u16 = 11434;

/// Buffered events between a backend task and its consumer
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Lazy, single-use sequence of completion events
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'static>>;

/// Create the channel a backend task feeds its [`EventStream`] through
///
/// The consumer dropping the stream closes the channel; producers watch
/// [`mpsc::Sender::closed`] to abandon the upstream call.
#[must_use]
pub fn event_channel() -> (mpsc::Sender<StreamEvent>, EventStream) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (tx, Box::pin(ReceiverStream::new(rx)))
}

/// An [`EventStream`] consisting of one event
#[must_use]
pub fn single_event(event: StreamEvent) -> EventStream {
    Box::pin(futures::stream::iter([event]))
}

/// Errors raised by backends before or while talking to the provider
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Credential not present in the environment
    #[error("{var} environment variable not configured")]
    MissingCredential {
        /// Name of the expected environment variable
        var: String,
    },

    /// Could not reach the provider or build the client
    #[error("Upstream request failed: {0}")]
    Request(String),

    /// Provider answered with a non-success status
    #[error("Upstream returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body (diagnostic only)
        body: String,
    },
}

/// Where a backend gets its API credential from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credential {
    /// Read from an environment variable on every request
    Env(String),
    /// Fixed value (tests, embedding)
    Static(String),
}

impl Credential {
    /// Credential read from `var` at request time
    pub fn env(var: impl Into<String>) -> Self {
        Self::Env(var.into())
    }

    /// Resolve the credential value
    ///
    /// # Errors
    ///
    /// Returns `BackendError::MissingCredential` if the variable is unset or blank.
    pub fn resolve(&self) -> Result<String, BackendError> {
        match self {
            Self::Static(value) => Ok(value.clone()),
            Self::Env(var) => std::env::var(var)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BackendError::MissingCredential { var: var.clone() }),
        }
    }
}

/// Parameters of one completion call
///
/// Values are taken as-is; range checks happen in the relay before a request
/// is built.
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    /// Conversation history, oldest first
    pub messages: Vec<ChatMessage>,
    /// Provider model identifier
    pub model: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum output tokens
    pub max_tokens: u32,
}

impl CompletionRequest {
    /// Create a request with default sampling options
    pub fn new(messages: Vec<ChatMessage>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: model.into(),
            temperature: 0.7,
            max_tokens: 2048,
        }
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Upstream provider trait
///
/// Implement this trait to relay a new provider.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Get the backend name (e.g., "OpenAI", "Ollama")
    fn name(&self) -> &str;

    /// Check that the credentials this backend needs are available
    ///
    /// Called by the relay at request time, before validation and before any
    /// upstream traffic.
    fn check_credentials(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Open a streaming completion
    ///
    /// Failures are reported in-band as a single `Error` event.
    async fn start_completion(&self, request: &CompletionRequest) -> EventStream;
}

/// Supported upstream providers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// api.openai.com
    #[default]
    OpenAi,
    /// api.groq.com (OpenAI-compatible)
    Groq,
    /// Local Ollama server
    Ollama,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "groq" => Ok(Self::Groq),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!(
                "unknown provider '{other}' (expected openai, groq or ollama)"
            )),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenAi => write!(f, "openai"),
            Self::Groq => write!(f, "groq"),
            Self::Ollama => write!(f, "ollama"),
        }
    }
}

/// Backend connection configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendConfig {
    /// OpenAI chat completions API
    OpenAi {
        /// API credential
        credential: Credential,
        /// API base URL
        base_url: String,
    },
    /// Groq chat completions API
    Groq {
        /// API credential
        credential: Credential,
        /// API base URL
        base_url: String,
    },
    /// Direct Ollama connection
    Ollama {
        /// Ollama host address
        host: String,
        /// Ollama port number
        port: u16,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::openai()
    }
}

impl BackendConfig {
    /// OpenAI with the credential from `OPENAI_API_KEY`
    #[must_use]
    pub fn openai() -> Self {
        Self::OpenAi {
            credential: Credential::env(OPENAI_API_KEY_VAR),
            base_url: OPENAI_BASE_URL.to_string(),
        }
    }

    /// Groq with the credential from `GROQ_API_KEY`
    #[must_use]
    pub fn groq() -> Self {
        Self::Groq {
            credential: Credential::env(GROQ_API_KEY_VAR),
            base_url: GROQ_BASE_URL.to_string(),
        }
    }

    /// Create Ollama configuration
    pub fn ollama(host: impl Into<String>, port: u16) -> Self {
        Self::Ollama {
            host: host.into(),
            port,
        }
    }

    /// Default configuration for a provider
    #[must_use]
    pub fn for_provider(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::OpenAi => Self::openai(),
            ProviderKind::Groq => Self::groq(),
            ProviderKind::Ollama => Self::ollama(DEFAULT_OLLAMA_HOST, DEFAULT_OLLAMA_PORT),
        }
    }

    /// Override the API base URL (ignored for Ollama)
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        match &mut self {
            Self::OpenAi { base_url, .. } | Self::Groq { base_url, .. } => *base_url = url.into(),
            Self::Ollama { .. } => {}
        }
        self
    }

    /// Replace the credential (ignored for Ollama)
    #[must_use]
    pub fn with_credential(mut self, value: Credential) -> Self {
        match &mut self {
            Self::OpenAi { credential, .. } | Self::Groq { credential, .. } => *credential = value,
            Self::Ollama { .. } => {}
        }
        self
    }

    /// Which provider this configuration targets
    #[must_use]
    pub fn provider(&self) -> ProviderKind {
        match self {
            Self::OpenAi { .. } => ProviderKind::OpenAi,
            Self::Groq { .. } => ProviderKind::Groq,
            Self::Ollama { .. } => ProviderKind::Ollama,
        }
    }
}
