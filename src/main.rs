mod api;
mod config;
mod engine;
mod error;
mod lifecycle;
mod panel;
mod runner;
mod utils;

use crate::api::handler::PanelHandler;
use crate::config::{Config, TransportMode};
use crate::runner::ProcessRunner;
use anyhow::Result;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) -> Result<()> {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("container_panel={}", level)));

    // stdout belongs to the stdio transport.
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::load()?);
    setup_logging(&config.log_level)?;

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting container-panel");
    tracing::debug!("Loaded configuration: {:?}", config);

    if which::which(&config.engine_binary).is_err() {
        tracing::warn!(
            engine = %config.engine_binary,
            "Container engine binary is not in PATH. Every engine action will fail until it is installed."
        );
    }

    let runner = Arc::new(ProcessRunner::detect().await);
    let handler = Arc::new(PanelHandler::new(config.clone(), runner));

    match config.transport_mode {
        #[cfg(feature = "stdio")]
        TransportMode::Stdio => {
            tracing::info!("Using STDIO transport mode.");
            api::stdio::serve_stdio(handler).await?;
        }
        #[cfg(feature = "sse")]
        TransportMode::Sse => {
            tracing::info!(host = %config.sse_host, port = %config.sse_port, "Using SSE transport mode.");
            api::http::serve_sse(handler, &config.sse_host, config.sse_port).await?;
        }
        #[cfg(not(all(feature = "stdio", feature = "sse")))]
        #[allow(unreachable_patterns)]
        _ => {
            let available_feature = if cfg!(feature = "stdio") {
                "stdio"
            } else if cfg!(feature = "sse") {
                "sse"
            } else {
                "none"
            };
            tracing::error!(
                selected_transport = ?config.transport_mode,
                available_feature = %available_feature,
                "Selected transport mode is not available due to compiled features."
            );
            anyhow::bail!(
                "Selected transport mode {:?} is not available. Compiled with {} support only.",
                config.transport_mode,
                available_feature
            );
        }
    }

    tracing::info!("Server shutdown.");
    Ok(())
}
