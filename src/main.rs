use anyhow::Result;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod auth;
mod backend;
mod config;
mod engine;
mod errors;
mod handlers;
mod metastore;
mod models;
mod reaper;
mod routes;

use backend::ObjectBackend;
use config::{AppConfig, BackendKind, MetaStoreKind};
use engine::StorageEngine;
use metastore::MetadataStore;
use reaper::{expiry::ExpiryReaper, orphan::OrphanReaper};
use routes::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = Arc::new(AppConfig::from_env_and_args()?);
    tracing::info!(storage_dir = %cfg.storage.base_path, "starting tempcache storage engine");

    let backend: Arc<dyn ObjectBackend> = match cfg.backend {
        BackendKind::Filesystem => Arc::new(backend::FsBackend::new(&cfg.storage.base_path).await?),
        #[cfg(feature = "s3")]
        BackendKind::S3 => {
            let bucket = cfg
                .s3_bucket
                .clone()
                .ok_or_else(|| anyhow::anyhow!("S3_BUCKET is required for the s3 backend"))?;
            Arc::new(backend::S3Backend::new(bucket).await)
        }
    };

    let metastore: Arc<dyn MetadataStore> = match cfg.metastore {
        MetaStoreKind::JsonFile => Arc::new(metastore::JsonFileStore::new(&cfg.storage.base_path)),
        #[cfg(feature = "redis-store")]
        MetaStoreKind::Redis => {
            let url = cfg
                .redis_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("REDIS_URL is required for the redis metadata store"))?;
            Arc::new(metastore::KvStore::new(&url)?)
        }
    };
    metastore.init().await?;

    let engine = Arc::new(StorageEngine::new(backend.clone(), metastore.clone(), cfg.storage.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let expiry_stats = reaper::shared_stats();
    let expiry_reaper = Arc::new(ExpiryReaper::new(engine.clone(), expiry_stats, cfg.cleanup_batch_size));
    let expiry_handle = expiry_reaper.spawn(&cfg.cleanup_cron, shutdown_rx.clone());

    let orphan_stats = reaper::shared_stats();
    let orphan_reaper = Arc::new(OrphanReaper::new(backend.clone(), metastore.clone(), orphan_stats, cfg.orphan_grace_secs));
    let orphan_handle = orphan_reaper.spawn(cfg.orphan_interval_secs, shutdown_rx.clone());

    let state = AppState { engine, config: cfg.clone() };
    let app = routes::routes(state);

    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == ErrorKind::PermissionDenied && matches!(cfg.host.as_str(), "0.0.0.0" | "::") => {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!("permission denied binding to {} ({}). falling back to {}", addr, err, fallback_addr);
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    // Reapers complete their in-flight tick before exiting (spec §5).
    let _ = expiry_handle.await;
    let _ = orphan_handle.await;

    Ok(())
}

/// Waits for Ctrl+C (or SIGTERM on unix), then flips the shutdown flag so
/// both reaper loops wind down after finishing whatever tick is in
/// flight.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
