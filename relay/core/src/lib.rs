//! Relay Core - Streaming Chat Relay for LLM Providers
//!
//! This crate holds everything of the chat relay that does not depend on an
//! HTTP server: the SSE frame codec shared with the chat widget, the upstream
//! provider adapters, the relay pipeline with its rate limiter, and
//! configuration loading.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  POST /api/chat   ┌────────────────────────────────────┐
//! │ Chat Widget  │ ────────────────► │ relay-daemon (axum)                │
//! │              │                   │   └─ RelayService                  │
//! │ StreamReader │ ◄──── SSE ─────── │        ├─ CooldownLimiter          │
//! │  Transcript  │  data: "Hel"      │        ├─ RequestPolicy            │
//! └──────────────┘  data: [DONE]     │        └─ CompletionBackend ───────┼──► provider
//!                                    └────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`StreamEvent`]: One logical event of a streamed completion
//! - [`RelayService`]: The request pipeline
//! - [`CompletionBackend`]: Upstream provider trait
//! - [`FrameDecoder`]: Incremental decoder for the relay's SSE frames
//!
//! # Module Overview
//!
//! - [`messages`]: Chat messages and stream events
//! - [`transport`]: SSE frame encoding and decoding
//! - [`backend`]: Upstream provider adapters (OpenAI, Groq, Ollama)
//! - [`relay`]: Admission, validation and response writing
//! - [`config`]: TOML + environment configuration

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod messages;
pub mod relay;
pub mod transport;

// Re-exports for convenience
pub use backend::{
    build_backend, BackendConfig, BackendError, CompletionBackend, CompletionRequest, Credential,
    EventStream, OllamaBackend, OpenAiBackend, ProviderKind,
};
pub use messages::{ChatMessage, MessageRole, StreamEvent};
pub use relay::{
    client_identifier, CooldownLimiter, FrameStream, RateLimitConfig, RateLimited, RelayError,
    RelayRequest, RelayResponse, RelayService, RequestPolicy, ValidationDetails,
};
pub use transport::{decode, encode, Decoded, FrameDecoder, FrameError, SseDecoder, SseFrame};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RelayConfig, RelayToml,
};
