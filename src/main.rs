use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::Json;
use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::FloodgateConfig;
use floodgate::http::{AdmissionControl, HttpServer};
use floodgate::ratelimit::{RateLimiter, RuleSelector, SystemClock};
use floodgate::store::{connect_store, spawn_sweeper};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Admission control and rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_thread_ids(true)
            .init(),
    }

    info!("Starting Floodgate Admission Control Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = FloodgateConfig::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        overrides = config.rate_limiting.overrides.len(),
        "Configuration loaded"
    );

    let clock = Arc::new(SystemClock);
    let store = connect_store(&config.store, clock.clone()).await;
    let sweeper = spawn_sweeper(
        store.clone(),
        Duration::from_secs(config.store.sweep_interval_secs),
    );

    let rate_limiter = Arc::new(RateLimiter::with_clock(store, clock));
    let rules = Arc::new(RuleSelector::new(
        config.rate_limiting.overrides.clone(),
        config.rate_limiting.categories,
    ));
    let control = AdmissionControl::new(rate_limiter, rules)
        .with_bypass_paths(config.server.bypass_paths.clone());
    info!("Rate limiter initialized");

    // Stand-in upstream: every admitted request is echoed back.
    let app = axum::Router::new().fallback(echo);
    let server = HttpServer::new(config.server.listen_addr, control, app);

    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!("Floodgate Admission Control Service stopped");
    Ok(())
}

async fn echo(request: Request) -> Json<Value> {
    Json(json!({
        "admitted": true,
        "method": request.method().as_str(),
        "path": request.uri().path(),
    }))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
