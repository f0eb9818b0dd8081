//! HTTP server for the rrd round-robin point store.
//!
//! Serves `PUT /metrics` and `GET /metrics` over a [`Storage`] engine backed
//! by a file store (`STORAGE_PATH`) or, when no path is given, by memory.
//! On Ctrl-C the server stops accepting requests, persists the record
//! counter and closes the backend.

mod api;
mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use rrd::{Backend, Context, FileBackend, MemoryBackend, RrdService, Storage};
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, ServerConfig};

#[tokio::main]
async fn main() {
    let config = ServerConfig::parse();
    init_tracing(&config);

    if let Err(e) = run(config).await {
        tracing::error!("server failed: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|e| {
        eprintln!("invalid LOG_LEVEL {:?} ({e}), using info", config.log_level);
        EnvFilter::new("info")
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = Context::background();

    let backend: Arc<dyn Backend> = match &config.storage_path {
        Some(path) => Arc::new(FileBackend::open(path)?),
        None => {
            tracing::warn!("STORAGE_PATH not set, records are kept in memory only");
            Arc::new(MemoryBackend::new())
        }
    };

    let storage = Arc::new(Storage::open(backend, config.storage(), &ctx).await?);
    tracing::info!(
        count = storage.count(),
        max_records = storage.max_records(),
        path = ?config.storage_path,
        "storage ready"
    );

    let service = Arc::new(RrdService::new(Arc::clone(&storage)));
    let app = api::router(api::AppState::new(
        service.clone(),
        service,
        config.request_timeout(),
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("starting server on {addr}");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Close even if serving failed.
    let closed = storage.close(&ctx).await;
    served?;
    closed?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
