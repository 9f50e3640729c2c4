//! spool server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use spool_core::config::AppConfig;
use spool_server::reaper::spawn_reaper;
use spool_server::{AppState, create_router};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// spool - a resumable upload server speaking tus 1.0.0
#[derive(Parser, Debug)]
#[command(name = "spoold")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "SPOOL_CONFIG",
        default_value = "config/spool.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("spool v{}", env!("CARGO_PKG_VERSION"));

    // Configuration file is optional: defaults serve /files on 127.0.0.1:1080
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::info!(
            "No config file found at {}, using defaults and environment",
            args.config
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("SPOOL_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    // Register Prometheus metrics
    spool_server::metrics::register_metrics();

    // Initialize storage backend
    let storage = spool_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend initialized");

    // Fail fast when storage is unreachable
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!("Storage backend connectivity verified");

    // Initialize upload registry
    let registry = spool_registry::from_config(&config.registry)
        .await
        .context("failed to initialize upload registry")?;
    tracing::info!(registry = registry.kind(), "Upload registry initialized");

    let state = AppState::new(config.clone(), storage, registry);

    if config.expiration.enabled {
        let interval = config.expiration.sweep_interval();
        spawn_reaper(state.engine.clone(), interval);
        tracing::info!(
            interval_secs = interval.as_secs(),
            ttl_secs = config.expiration.ttl_secs,
            "Expiration reaper spawned"
        );
    }

    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    tracing::info!(
        "Listening on {} with uploads under {}",
        addr,
        config.protocol.base_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
