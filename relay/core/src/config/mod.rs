//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay daemon, supporting a TOML
//! configuration file at `~/.config/chat-relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:3000"
//!
//! [upstream]
//! provider = "openai"
//! timeout_secs = 30
//!
//! [request]
//! default_model = "gpt-4-turbo"
//! allowed_models = ["gpt-4-turbo", "gpt-4", "gpt-3.5-turbo"]
//! max_tokens_limit = 4096
//!
//! [rate_limit]
//! enabled = true
//! max_requests = 15
//! cooldown_secs = 60
//! sweep_interval_secs = 30
//! ```
//!
//! Unset `[request]` values follow the provider: switching to Groq or Ollama
//! also switches the default model and allow-list.
//!
//! Credentials never live in this file; they are read from the environment
//! at request time.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{
    BackendConfig, ProviderKind, DEFAULT_OLLAMA_HOST, DEFAULT_OLLAMA_PORT, DEFAULT_UPSTREAM_TIMEOUT,
};
use crate::relay::{RateLimitConfig, RequestPolicy};

/// Default listen address
pub const DEFAULT_BIND: &str = "127.0.0.1:3000";

/// Default interval between rate-limit sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address, e.g. `0.0.0.0:3000`
    pub bind: Option<String>,
}

/// Upstream section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamToml {
    /// Provider to relay to
    pub provider: Option<ProviderKind>,

    /// API base URL override (OpenAI-compatible providers)
    pub base_url: Option<String>,

    /// Seconds to wait for the provider to start responding
    pub timeout_secs: Option<u64>,

    /// Ollama host
    pub ollama_host: Option<String>,

    /// Ollama port
    pub ollama_port: Option<u16>,
}

/// Request validation section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestToml {
    /// Model used when a request names none
    pub default_model: Option<String>,

    /// Accepted models (empty list accepts any)
    pub allowed_models: Option<Vec<String>>,

    /// Temperature used when a request gives none
    pub default_temperature: Option<f32>,

    /// Token limit used when a request gives none
    pub default_max_tokens: Option<u32>,

    /// Largest accepted `max_tokens`
    pub max_tokens_limit: Option<u32>,
}

/// Rate limiting section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitToml {
    /// Whether rate limiting is enabled
    pub enabled: Option<bool>,

    /// Requests per client per cooldown window
    pub max_requests: Option<u32>,

    /// Cooldown window in seconds, measured from request completion
    pub cooldown_secs: Option<u64>,

    /// Seconds between sweeps of idle clients
    pub sweep_interval_secs: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Server configuration section
    pub server: ServerToml,

    /// Upstream configuration section
    pub upstream: UpstreamToml,

    /// Request validation section
    pub request: RequestToml,

    /// Rate limiting configuration section
    pub rate_limit: RateLimitToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the relay
///
/// Use [`load_config`] to load configuration with proper priority handling,
/// then [`ConfigOverrides::apply`] for CLI flags and [`RelayConfig::validate`]
/// before use.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Listen address
    pub bind: SocketAddr,

    /// Upstream provider
    pub provider: ProviderKind,

    /// API base URL override
    pub upstream_url: Option<String>,

    /// Time allowed for the provider to start responding
    pub upstream_timeout: Duration,

    /// Ollama host
    pub ollama_host: String,

    /// Ollama port
    pub ollama_port: u16,

    /// Request settings set explicitly, layered over the provider's defaults
    pub request: RequestToml,

    /// Rate limiter settings
    pub rate_limit: RateLimitConfig,

    /// Interval between rate-limit sweeps
    pub sweep_interval: Duration,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            provider: ProviderKind::OpenAi,
            upstream_url: None,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            ollama_host: DEFAULT_OLLAMA_HOST.to_string(),
            ollama_port: DEFAULT_OLLAMA_PORT,
            request: RequestToml::default(),
            rate_limit: RateLimitConfig::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Request validation rules for the configured provider
    #[must_use]
    pub fn policy(&self) -> RequestPolicy {
        let mut policy = RequestPolicy::for_provider(self.provider);
        let request = &self.request;

        if let Some(ref model) = request.default_model {
            policy.default_model = model.clone();
        }
        if let Some(ref models) = request.allowed_models {
            policy.allowed_models = models.clone();
        }
        if let Some(temperature) = request.default_temperature {
            policy.default_temperature = temperature;
        }
        if let Some(tokens) = request.default_max_tokens {
            policy.default_max_tokens = tokens;
        }
        if let Some(limit) = request.max_tokens_limit {
            policy.max_tokens_limit = limit;
        }
        policy
    }

    /// Backend connection settings for the configured provider
    #[must_use]
    pub fn backend_config(&self) -> BackendConfig {
        let config = match self.provider {
            ProviderKind::Ollama => {
                return BackendConfig::ollama(self.ollama_host.clone(), self.ollama_port)
            }
            kind => BackendConfig::for_provider(kind),
        };
        match &self.upstream_url {
            Some(url) => config.with_base_url(url.clone()),
            None => config,
        }
    }

    /// Check that the values are usable together
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        if self.rate_limit.max_requests == 0 {
            return invalid("rate_limit.max_requests must be at least 1".into());
        }
        if self.rate_limit.cooldown.is_zero() {
            return invalid("rate_limit.cooldown_secs must be at least 1".into());
        }
        if self.sweep_interval.is_zero() {
            return invalid("rate_limit.sweep_interval_secs must be at least 1".into());
        }
        if self.upstream_timeout.is_zero() {
            return invalid("upstream.timeout_secs must be at least 1".into());
        }

        let policy = self.policy();
        if policy.max_tokens_limit == 0 {
            return invalid("request.max_tokens_limit must be at least 1".into());
        }
        if policy.default_max_tokens == 0 || policy.default_max_tokens > policy.max_tokens_limit {
            return invalid(format!(
                "request.default_max_tokens must be between 1 and {}",
                policy.max_tokens_limit
            ));
        }
        if !(0.0..=2.0).contains(&policy.default_temperature) {
            return invalid("request.default_temperature must be between 0 and 2".into());
        }
        if policy.default_model.trim().is_empty() {
            return invalid("request.default_model must not be empty".into());
        }
        if !policy.allowed_models.is_empty()
            && !policy.allowed_models.contains(&policy.default_model)
        {
            return invalid(format!(
                "request.default_model '{}' is not in request.allowed_models",
                policy.default_model
            ));
        }

        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chat-relay/relay.toml` or
/// `~/.config/chat-relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chat-relay").join("relay.toml"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the process environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration, reading environment overrides through `env`
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<RelayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Start with defaults
    let mut config = RelayConfig::default();

    // Try to load from file
    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    // Apply environment variables (overrides file values)
    apply_env_config(&mut config, env);

    Ok(config)
}

fn parse_bind(value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::ValidationError(format!("invalid bind address '{value}': {e}")))
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) -> Result<(), ConfigError> {
    // Server settings
    if let Some(ref bind) = toml.server.bind {
        config.bind = parse_bind(bind)?;
    }

    // Upstream settings
    if let Some(provider) = toml.upstream.provider {
        config.provider = provider;
    }
    if toml.upstream.base_url.is_some() {
        config.upstream_url = toml.upstream.base_url.clone();
    }
    if let Some(secs) = toml.upstream.timeout_secs {
        config.upstream_timeout = Duration::from_secs(secs);
    }
    if let Some(ref host) = toml.upstream.ollama_host {
        config.ollama_host = host.clone();
    }
    if let Some(port) = toml.upstream.ollama_port {
        config.ollama_port = port;
    }

    // Request settings
    config.request = toml.request.clone();

    // Rate limit settings
    if let Some(enabled) = toml.rate_limit.enabled {
        config.rate_limit.enabled = enabled;
    }
    if let Some(max) = toml.rate_limit.max_requests {
        config.rate_limit.max_requests = max;
    }
    if let Some(secs) = toml.rate_limit.cooldown_secs {
        config.rate_limit.cooldown = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.rate_limit.sweep_interval_secs {
        config.sweep_interval = Duration::from_secs(secs);
    }

    Ok(())
}

/// Apply environment variable overrides to the config
///
/// Unparseable values are logged and ignored.
fn apply_env_config<F>(config: &mut RelayConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
        let result = value.trim().parse().ok();
        if result.is_none() {
            tracing::warn!(key, value, "Ignoring unparseable environment override");
        }
        result
    }

    if let Some(bind) = env("RELAY_BIND") {
        if let Some(addr) = parsed::<SocketAddr>("RELAY_BIND", &bind) {
            config.bind = addr;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(provider) = env("RELAY_PROVIDER") {
        if let Some(kind) = parsed::<ProviderKind>("RELAY_PROVIDER", &provider) {
            config.provider = kind;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(url) = env("RELAY_UPSTREAM_URL") {
        config.upstream_url = Some(url);
        config.source = ConfigSource::Env;
    }
    if let Some(host) = env("OLLAMA_HOST") {
        config.ollama_host = host;
        config.source = ConfigSource::Env;
    }
    if let Some(port) = env("OLLAMA_PORT") {
        if let Some(port) = parsed::<u16>("OLLAMA_PORT", &port) {
            config.ollama_port = port;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(model) = env("RELAY_DEFAULT_MODEL") {
        config.request.default_model = Some(model);
        config.source = ConfigSource::Env;
    }
    if let Some(models) = env("RELAY_ALLOWED_MODELS") {
        config.request.allowed_models = Some(split_models(&models));
        config.source = ConfigSource::Env;
    }

    // Rate limit settings from environment
    if let Some(max) = env("RELAY_RATE_LIMIT_MAX") {
        if let Some(max) = parsed::<u32>("RELAY_RATE_LIMIT_MAX", &max) {
            config.rate_limit.max_requests = max;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(secs) = env("RELAY_RATE_LIMIT_COOLDOWN") {
        if let Some(secs) = parsed::<u64>("RELAY_RATE_LIMIT_COOLDOWN", &secs) {
            config.rate_limit.cooldown = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(enabled) = env("RELAY_RATE_LIMIT_ENABLED") {
        config.rate_limit.enabled = enabled != "0" && enabled.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }
}

/// Comma-separated model names; an empty value accepts any model
fn split_models(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|model| !model.is_empty())
        .map(ToString::to_string)
        .collect()
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub bind: Option<SocketAddr>,

    /// Provider override
    pub provider: Option<ProviderKind>,

    /// Upstream base URL override
    pub upstream_url: Option<String>,

    /// Default model override
    pub default_model: Option<String>,

    /// Allowed models override (empty accepts any)
    pub allowed_models: Option<Vec<String>>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = Some(bind);
        self
    }

    /// Set provider override
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderKind) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set upstream base URL override
    #[must_use]
    pub fn with_upstream_url(mut self, url: String) -> Self {
        self.upstream_url = Some(url);
        self
    }

    /// Set default model override
    #[must_use]
    pub fn with_default_model(mut self, model: String) -> Self {
        self.default_model = Some(model);
        self
    }

    /// Set allowed models override
    #[must_use]
    pub fn with_allowed_models(mut self, models: Vec<String>) -> Self {
        self.allowed_models = Some(models);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if self.bind.is_some()
            || self.provider.is_some()
            || self.upstream_url.is_some()
            || self.default_model.is_some()
            || self.allowed_models.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(provider) = self.provider {
            config.provider = provider;
        }
        if let Some(ref url) = self.upstream_url {
            config.upstream_url = Some(url.clone());
        }
        if let Some(ref model) = self.default_model {
            config.request.default_model = Some(model.clone());
        }
        if let Some(ref models) = self.allowed_models {
            config.request.allowed_models = Some(split_models(&models.join(",")));
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
