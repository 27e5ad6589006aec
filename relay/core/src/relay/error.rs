//! Relay error taxonomy
//!
//! Every failed request ends in exactly one [`RelayError`]. The daemon turns
//! it into an HTTP response; this crate only knows the status code.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::rate_limit::RateLimited;

/// Message returned to clients when the relay itself is misconfigured
pub const CONFIGURATION_MESSAGE: &str = "Server configuration error";

/// Message returned with every rate-limit rejection
pub const RATE_LIMIT_MESSAGE: &str = "Rate limit exceeded";

/// Per-field validation failures
///
/// Serializes as `{ "formErrors": [...], "fieldErrors": { "<field>": [...] } }`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationDetails {
    /// Problems with the body as a whole
    pub form_errors: Vec<String>,
    /// Problems keyed by top-level field name
    pub field_errors: BTreeMap<String, Vec<String>>,
}

impl ValidationDetails {
    /// Record a problem with the body as a whole
    pub fn form(&mut self, message: impl Into<String>) {
        self.form_errors.push(message.into());
    }

    /// Record a problem with `field`
    pub fn field(&mut self, field: &str, message: impl Into<String>) {
        self.field_errors
            .entry(field.to_string())
            .or_default()
            .push(message.into());
    }

    /// Whether nothing was recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.form_errors.is_empty() && self.field_errors.is_empty()
    }
}

/// Terminal failure of one relay request
#[derive(Debug, Error)]
pub enum RelayError {
    /// The request body was rejected (400)
    #[error("{message}")]
    Validation {
        /// Summary shown to the client
        message: String,
        /// Per-field problems, when the body parsed as JSON
        details: Option<ValidationDetails>,
    },

    /// The relay cannot serve requests as configured (500)
    ///
    /// Displays a generic message; `cause` is for logs only.
    #[error("Server configuration error")]
    Configuration {
        /// Underlying reason
        cause: String,
    },

    /// The client used up its slots (429)
    #[error("Rate limit exceeded")]
    RateLimited(#[from] RateLimited),

    /// The provider failed before any bytes were committed (500)
    #[error("{0}")]
    Upstream(String),
}

impl RelayError {
    /// HTTP status code for this error
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::RateLimited(_) => 429,
            Self::Configuration { .. } | Self::Upstream(_) => 500,
        }
    }

    /// Seconds the client should wait, for rate-limit rejections
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited(limited) => Some(limited.retry_after),
            _ => None,
        }
    }
}
