//! LLM replay proxy
//!
//! A recording reverse proxy for local LLM servers, built with Tokio and Axum.
//!
//! # Architecture Overview
//!
//! ```text
//!                       ┌──────────────────────────────────────────────────┐
//!                       │                  LLM REPLAY PROXY                │
//!     Client Request    │  ┌────────┐   ┌─────────┐   ┌───────────┐        │
//!     ──────────────────┼─▶│ server │──▶│ service │──▶│ forwarder │────────┼──▶ Ollama /
//!                       │  └────────┘   └─────────┘   └─────┬─────┘        │    OpenAI API
//!                       │                                   │ events       │
//!     Client Response   │  ┌──────────────────────┐         ▼              │
//!     ◀─────────────────┼──│ pipeline (two legs)  │◀── head / chunks ──────┼───
//!                       │  └──────────┬───────────┘                        │
//!                       │             │ record                             │
//!                       │             ▼                                    │
//!                       │  ┌──────────────────┐   sealed  ┌────────────┐   │
//!                       │  │     recorder     │──────────▶│  dispatch  │   │
//!                       │  └──────────────────┘           │store/replay│   │
//!                       │                                 └────────────┘   │
//!                       └──────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;

use llm_replay_proxy::config;
use llm_replay_proxy::lifecycle::{signals, Shutdown};
use llm_replay_proxy::observability::{logging, metrics};
use llm_replay_proxy::HttpServer;

#[derive(Parser)]
#[command(name = "llm-replay-proxy")]
#[command(about = "Recording reverse proxy for local LLM servers", long_about = None)]
struct Cli {
    /// TOML configuration file; environment variables override it.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = config::load(cli.config.as_deref())?;

    logging::init_tracing(&config.observability.log_level);
    tracing::info!("llm-replay-proxy v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.base_url,
        record_to_disk = config.recording.persist,
        replay_verify = config.recording.replay_verify,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let drain = Duration::from_secs(config.timeouts.drain_secs);
    let shutdown = Shutdown::new();
    signals::spawn_signal_listener(shutdown.clone());

    let server = HttpServer::new(config)?;
    let mut server_task = tokio::spawn(server.run(listener, shutdown.subscribe()));

    tokio::select! {
        result = &mut server_task => {
            // Server stopped on its own (bind or accept failure).
            result??;
            return Ok(());
        }
        _ = async {
            let mut rx = shutdown.subscribe();
            if !shutdown.is_triggered() {
                let _ = rx.recv().await;
            }
        } => {}
    }

    match Shutdown::drain(server_task, drain).await {
        Some(result) => result??,
        None => tracing::warn!("Exiting with streams still open"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
