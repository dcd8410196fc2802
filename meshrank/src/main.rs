//! meshrank-server — telemetry and analytics pipeline for a low-power
//! long-range mesh radio network (`spec.md` §5). Wires the ingest worker,
//! the periodic route scorer, the channel-keys file watcher, and the
//! read-only query API onto one `tokio` runtime, all observing a shared
//! shutdown signal, the same overall shape as the teacher's single
//! `#[tokio::main]` that spawns its persist/afad workers before serving.

use meshrank::config::Config;
use meshrank::ingest::{run_ingest_worker, IngestContext};
use meshrank::metrics::{self, IngestMetrics};
use meshrank::query::{self, AppState};
use meshrank::route;
use meshrank::store::Datastore;
use meshrank::{archive::Archive, codec::keystore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "meshrank=info,tower_http=info".into()))
        .json()
        .init();

    let config = Config::from_env().unwrap_or_else(|e| {
        error!(error = %e, "config_load_failed");
        std::process::exit(1);
    });
    info!(mqtt_topic = %config.mqtt_topic, db_path = %config.db_path, "meshrank starting");

    let datastore = Arc::new(Datastore::open(&config.db_path).unwrap_or_else(|e| {
        error!(error = %e, "datastore_open_failed");
        std::process::exit(1);
    }));

    let initial_keys = config
        .keyfile_path
        .as_deref()
        .map(|path| std::fs::read_to_string(path).map(|c| keystore::KeyStore::build_from_json(&c)))
        .transpose()
        .unwrap_or_else(|e: std::io::Error| {
            warn!(error = %e, "channel_keys_initial_read_failed");
            None
        })
        .unwrap_or_default();
    let key_store = Arc::new(RwLock::new(initial_keys));

    let archive = Archive::new(&config.archive_path);
    let metrics = Arc::new(IngestMetrics::new());

    let ctx = Arc::new(IngestContext::new(
        datastore.clone(),
        archive,
        metrics.clone(),
        key_store.clone(),
        config.geoscore.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(run_ingest_worker(config.clone(), ctx.clone(), shutdown_rx.clone()));
    tokio::spawn(run_route_scorer(config.clone(), datastore.clone(), shutdown_rx.clone()));
    tokio::spawn(run_metrics_flush(config.clone(), datastore.clone(), metrics.clone(), shutdown_rx.clone()));
    if config.keyfile_path.is_some() {
        tokio::spawn(run_keyfile_watcher(config.clone(), key_store.clone(), shutdown_rx.clone()));
    }

    let app_state = AppState {
        datastore: datastore.clone(),
    };
    let app = query::router(app_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.query_port));
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap_or_else(|e| {
        error!(%addr, error = %e, "query_listener_bind_failed");
        std::process::exit(1);
    });
    info!(%addr, "query_api_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            let _ = shutdown_tx.send(true);
            info!("shutdown_signal_received");
        })
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "query_api_serve_failed");
            std::process::exit(1);
        });
}

/// Periodic task: scores every message whose path hasn't been resolved
/// since its last update (`spec.md` §4.5/§5 — "the route scorer is a
/// periodic task").
async fn run_route_scorer(config: Config, datastore: Arc<Datastore>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.route_scorer_interval_secs));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let weights = config.geoscore.clone();
                let result = datastore
                    .with_writer(move |conn| route::score_pending_messages(conn, &weights, now_ms()))
                    .await;
                match result {
                    Ok(scored) if scored > 0 => info!(scored, "route_scorer_tick"),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "route_scorer_failed"),
                }
            }
        }
    }
}

/// Periodic task: flushes the in-process ingest counters into
/// `ingest_metrics` (`spec.md` §3/§7), so `/health`'s `ingest_counters`
/// reflects recent activity and counts survive a restart.
async fn run_metrics_flush(
    config: Config,
    datastore: Arc<Datastore>,
    metrics: Arc<IngestMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.metrics_flush_interval_secs));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let metrics = metrics.clone();
                let result = datastore
                    .with_writer(move |conn| metrics::flush_counters(conn, &metrics, now_ms()))
                    .await;
                if let Err(e) = result {
                    warn!(error = %e, "metrics_flush_failed");
                }
            }
        }
    }
}

/// Periodic task: reloads the channel-keys file when its mtime changes
/// (`spec.md` §4.1) and swaps the new immutable `KeyStore` in.
async fn run_keyfile_watcher(config: Config, key_store: Arc<RwLock<keystore::KeyStore>>, mut shutdown: watch::Receiver<bool>) {
    let Some(path) = config.keyfile_path.clone() else {
        return;
    };
    let mut last_mtime: Option<SystemTime> = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
    let mut ticker = tokio::time::interval(Duration::from_secs(config.keyfile_poll_secs));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let current = key_store.read().await.clone();
                let (reloaded, mtime) = keystore::reload_if_changed(&path, last_mtime, &current);
                if mtime != last_mtime {
                    let channel_count = reloaded.len();
                    *key_store.write().await = reloaded;
                    last_mtime = mtime;
                    info!(channel_count, "channel_keys_reloaded");
                }
            }
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
