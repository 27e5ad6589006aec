//! Relay Daemon - Streaming Chat Relay Server
//!
//! Accepts chat requests from browser widgets and terminal clients, forwards
//! them to the configured LLM provider and streams the reply back as
//! server-sent events.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (OpenAI, 127.0.0.1:3000)
//! OPENAI_API_KEY=sk-... relay-daemon
//!
//! # Groq on a public interface (defaults to mixtral-8x7b-32768)
//! GROQ_API_KEY=gsk-... relay-daemon --provider groq --bind 0.0.0.0:8080
//!
//! # Local Ollama, any pulled model
//! relay-daemon --provider ollama --default-model qwen2.5:7b
//!
//! # With config file
//! relay-daemon --config /etc/chat-relay/relay.toml
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (open streams are allowed to finish)

mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use relay_core::{
    build_backend, default_config_path, load_config_from_path, ConfigOverrides, CooldownLimiter,
    ProviderKind, RelayService,
};

use server::AppState;

/// Relay Daemon - SSE chat relay for OpenAI-compatible and Ollama providers
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(short = 'b', long, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Upstream provider (openai, groq, ollama)
    #[arg(short = 'p', long, value_name = "PROVIDER")]
    provider: Option<ProviderKind>,

    /// Base URL of an OpenAI-compatible upstream
    #[arg(long, value_name = "URL")]
    upstream_url: Option<String>,

    /// Model used when a request names none
    #[arg(short = 'm', long, value_name = "MODEL")]
    default_model: Option<String>,

    /// Comma-separated models requests may name (empty accepts any)
    #[arg(long, value_name = "MODELS", value_delimiter = ',')]
    allowed_models: Option<Vec<String>>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(bind) = self.bind {
            overrides = overrides.with_bind(bind);
        }
        if let Some(provider) = self.provider {
            overrides = overrides.with_provider(provider);
        }
        if let Some(ref url) = self.upstream_url {
            overrides = overrides.with_upstream_url(url.clone());
        }
        if let Some(ref model) = self.default_model {
            overrides = overrides.with_default_model(model.clone());
        }
        if let Some(ref models) = self.allowed_models {
            overrides = overrides.with_allowed_models(models.clone());
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "relay_daemon={level},relay_core={level},tower_http={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Periodically drop rate-limit entries whose windows have expired
fn spawn_sweeper(limiter: CooldownLimiter, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = limiter.sweep();
            if removed > 0 {
                debug!(
                    removed,
                    tracked = limiter.tracked_clients(),
                    "Swept idle rate-limit entries"
                );
            }
        }
    })
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install SIGINT handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("Received SIGINT, initiating shutdown"),
        () = terminate => info!("Received SIGTERM, initiating shutdown"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!("Relay daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config =
        load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let policy = config.policy();
    info!(
        source = %config.source(),
        provider = %config.provider,
        default_model = %policy.default_model,
        rate_limit = config.rate_limit.max_requests,
        "Configuration loaded"
    );

    let backend = build_backend(&config.backend_config(), config.upstream_timeout)
        .context("Failed to create upstream backend")?;
    if let Err(e) = backend.check_credentials() {
        // Requests will answer 500 until the variable is set
        error!(error = %e, "Upstream credentials are not configured");
    }

    let relay = RelayService::new(
        backend,
        policy,
        CooldownLimiter::new(config.rate_limit.clone()),
    );
    let sweeper = spawn_sweeper(relay.limiter().clone(), config.sweep_interval);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(addr = %listener.local_addr()?, "Listening");

    let result = axum::serve(listener, server::router(AppState::new(relay)))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    sweeper.abort();

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Relay daemon stopped with error");
            Err(e).context("Server error")
        }
    }
}
