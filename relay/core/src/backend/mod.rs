//! Upstream LLM Backends
//!
//! This module provides abstracted access to completion providers through a
//! common trait interface. Every backend turns a provider's streaming call
//! into an [`EventStream`].
//!
//! # Available Backends
//!
//! - **OpenAI**: api.openai.com (default)
//! - **Groq**: api.groq.com, OpenAI-compatible
//! - **Ollama**: local LLM server
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{build_backend, BackendConfig, CompletionRequest};
//!
//! let backend = build_backend(&BackendConfig::openai(), DEFAULT_UPSTREAM_TIMEOUT)?;
//! let request = CompletionRequest::new(messages, "gpt-4-turbo");
//! let mut events = backend.start_completion(&request).await;
//! ```

pub mod chunk;
mod ollama;
mod openai;
mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use chunk::ProviderChunk;
pub use ollama::OllamaBackend;
pub use openai::{OpenAiBackend, DEFAULT_UPSTREAM_TIMEOUT};
pub use traits::{
    event_channel, single_event, BackendConfig, BackendError, CompletionBackend,
    CompletionRequest, Credential, EventStream, ProviderKind, DEFAULT_OLLAMA_HOST,
    DEFAULT_OLLAMA_PORT, GROQ_API_KEY_VAR, GROQ_BASE_URL, OPENAI_API_KEY_VAR, OPENAI_BASE_URL,
};

/// Build the backend described by `config`
///
/// # Errors
///
/// Returns `BackendError::Request` if the HTTP client cannot be built.
pub fn build_backend(
    config: &BackendConfig,
    timeout: Duration,
) -> Result<Arc<dyn CompletionBackend>, BackendError> {
    let backend: Arc<dyn CompletionBackend> = match config {
        BackendConfig::OpenAi {
            credential,
            base_url,
        } => Arc::new(OpenAiBackend::new(
            "OpenAI",
            base_url.clone(),
            credential.clone(),
            timeout,
        )?),
        BackendConfig::Groq {
            credential,
            base_url,
        } => Arc::new(OpenAiBackend::new(
            "Groq",
            base_url.clone(),
            credential.clone(),
            timeout,
        )?),
        BackendConfig::Ollama { host, port } => {
            Arc::new(OllamaBackend::new(host.clone(), *port, timeout)?)
        }
    };
    Ok(backend)
}
