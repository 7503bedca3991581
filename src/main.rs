// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Server binary: configuration from the environment, JSON logs, the HTTP
//! surface and the background sync loop, with graceful shutdown on Ctrl-C.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use clinic_core::sync::{SqlSyncStore, SyncStore};
use clinic_core::{
    router, AppState, Cache, CoreConfig, Database, IdGenerator, Repositories, SyncEngine, SyncSettings, TenantResolver,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CoreConfig::from_env()?;
    if let Err(e) = serve(config).await {
        error!(error = %e, "server failed");
        return Err(e);
    }
    Ok(())
}

#[tracing::instrument(skip_all)]
async fn serve(config: CoreConfig) -> Result<(), BoxError> {
    let started = Instant::now();
    info!(use_local_db = config.use_local_db, offline_mode = config.offline_mode, "starting clinic core");

    let primary_label = if config.use_local_db { "local" } else { "cloud" };
    let db = Database::connect(primary_label, &config.primary_url()?).await?;

    // The cloud peer is optional: without it every sync table reports unavailable
    let peer: Option<Arc<dyn SyncStore>> = match config.peer_url() {
        Some(url) => match Database::connect("cloud", url).await {
            Ok(cloud) => Some(Arc::new(SqlSyncStore::new(cloud))),
            Err(e) => {
                warn!(error = %e, "cloud store unreachable, sync runs without a peer");
                None
            }
        },
        None => None,
    };

    let cache = Cache::from_url(
        config.redis_url.as_deref(),
        Duration::from_secs(config.cache_ttl_secs),
        Duration::from_secs(config.clinic_cache_ttl_secs),
    )
    .await;
    let ids = IdGenerator::new(db.clone(), config.id_max_attempts);
    let repos = Repositories::new(db.clone(), ids, cache.clone());
    let resolver = TenantResolver::new(db.clone(), &config.jwt_secret, Duration::from_secs(config.token_ttl_secs))
        .with_request_timeout(config.request_timeout());

    let (settings_tx, settings_rx) = watch::channel(SyncSettings::from_config(&config));
    let local: Arc<dyn SyncStore> = Arc::new(SqlSyncStore::new(db.clone()));
    let sync = Arc::new(SyncEngine::new(local, peer, settings_rx).with_cache(cache.clone()));

    let state = AppState { db: db.clone(), repos, sync: Arc::clone(&sync), resolver, cache };
    let app = router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_task = {
        let sync = Arc::clone(&sync);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { sync.run(shutdown).await })
    };
    tokio::spawn(reload_on_hangup(settings_tx));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    clinic_core::metrics::record_startup_phase("startup", started.elapsed());
    info!(addr = %config.bind_addr, peer = sync.has_peer(), "listening");

    let mut http_shutdown = shutdown_rx;
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = http_shutdown.wait_for(|stop| *stop).await;
    });

    tokio::select! {
        result = server => result?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = sync_task.await {
        warn!(error = %e, "sync loop ended abnormally");
    }
    db.close().await;
    info!("clinic core stopped");
    Ok(())
}

/// Re-read sync settings from the environment on SIGHUP.
#[cfg(unix)]
async fn reload_on_hangup(settings_tx: watch::Sender<SyncSettings>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "SIGHUP handler not installed");
            return;
        }
    };
    while hangups.recv().await.is_some() {
        match CoreConfig::from_env() {
            Ok(config) => {
                settings_tx.send_replace(SyncSettings::from_config(&config));
                info!("sync settings reloaded");
            }
            Err(e) => warn!(error = %e, "config reload failed, keeping current settings"),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_settings_tx: watch::Sender<SyncSettings>) {}
