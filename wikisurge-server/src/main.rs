//! WikiSurge server binary.
//!
//! Wires configuration, the Redis store, the search-store sink and the
//! pipeline runtime together, serves the operational endpoints, and turns
//! SIGINT/SIGTERM into a graceful pipeline shutdown.

mod routes;

use anyhow::Context;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wikisurge_config::Config;
use wikisurge_core::Metrics;
use wikisurge_core::consumer::supervisor::PipelineRuntime;
use wikisurge_core::indexer::sink::ElasticSink;
use wikisurge_core::store::{RedisStore, SharedStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let redis_url = config
        .redis_url
        .clone()
        .context("REDIS_URL must be set")?;

    let store: SharedStore = Arc::new(RedisStore::new(&redis_url).await?);
    let sink = Arc::new(ElasticSink::new(
        &config.elastic.url,
        &config.elastic.index_prefix,
    ));
    let metrics = Arc::new(Metrics::default());

    let runtime = Arc::new(PipelineRuntime::new(
        store,
        sink,
        config.clone(),
        Arc::clone(&metrics),
    ));
    runtime.start().await?;
    info!("analytics pipeline started");

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("operational endpoints listening on {addr}");

    let app = routes::router(Arc::clone(&runtime), metrics);
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    shutdown_signal().await;
    info!("shutdown signal received");

    runtime.shutdown().await?;
    server.abort();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => tracing::warn!("failed to install SIGTERM handler: {err}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
