//! Relay Service
//!
//! Everything between an accepted HTTP body and the bytes written back:
//!
//! - [`rate_limit`]: per-client cooldown admission
//! - [`validation`]: body checks and request defaults
//! - [`service`]: the request pipeline and the [`FrameStream`] writer
//!
//! The HTTP surface itself (routes, headers, CORS) lives in the daemon.

mod error;
pub mod rate_limit;
pub mod service;
pub mod validation;

pub use error::{RelayError, ValidationDetails, CONFIGURATION_MESSAGE, RATE_LIMIT_MESSAGE};
pub use rate_limit::{CooldownLimiter, RateLimitConfig, RateLimited, RatePermit};
pub use service::{
    client_identifier, FrameStream, RelayRequest, RelayResponse, RelayService, FALLBACK_CLIENT,
    FALLBACK_RESULT,
};
pub use validation::{
    RequestPolicy, ValidatedRequest, GROQ_DEFAULT_MODEL, INVALID_REQUEST, OLLAMA_DEFAULT_MODEL,
};
