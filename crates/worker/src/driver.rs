// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level cycle driver: config resolution, legacy database migration,
//! the heartbeat file, signal handling, and the tick loop that runs
//! reconciliation followed by traffic aggregation every interval.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregate::{self, AggregateOptions};
use crate::client::{PanelClient, PanelClientOptions, PanelHandle};
use crate::config::{FleetConfig, WorkerArgs};
use crate::reconcile;
use crate::state::{StateStore, StateStoreOptions};

/// Legacy database locations to check when the configured database file
/// does not exist yet. Mirrors the reference implementation's historical
/// search path for a pre-existing install.
const LEGACY_DB_CANDIDATES: &[&str] = &["./db/traffic_state.db", "./traffic_state.db"];

/// Resolve configuration, open durable state, build panel handles, and run
/// the tick loop until a shutdown signal is observed.
pub async fn run(args: WorkerArgs) -> anyhow::Result<()> {
    let config = FleetConfig::load(&args.config_file)?;

    std::fs::create_dir_all(&args.data_dir)?;
    migrate_db_if_needed(&args.db_path(), LEGACY_DB_CANDIDATES);

    let store = StateStore::open(
        args.db_path(),
        StateStoreOptions {
            wal: config.db.wal,
            synchronous: config.db.sync_mode(),
            cache_size_mb: config.db.cache_size_mb,
        },
    )?;

    let client_options = PanelClientOptions {
        request_timeout: Duration::from_secs(config.net.request_timeout),
        validate_ttl: Duration::from_secs(config.net.validate_ttl_seconds),
        connect_pool_size: config.net.connect_pool_size,
    };
    let central = panel_handle(&config.central_server, client_options)?;
    let nodes = config
        .nodes
        .iter()
        .map(|panel| panel_handle(panel, client_options))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let aggregate_options =
        AggregateOptions { parallel_node_calls: config.net.parallel_node_calls, max_workers: config.net.max_workers };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let heartbeat_path = args.heartbeat_path();
    let mut ticker = tokio::time::interval(Duration::from_secs(u64::from(config.sync_interval_minutes) * 60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown signal observed, exiting after in-flight cycle");
                return Ok(());
            }
            _ = ticker.tick() => {
                write_heartbeat(&heartbeat_path);
                run_cycle(&central, &nodes, &store, aggregate_options).await;
            }
        }
    }
}

async fn run_cycle(central: &PanelHandle, nodes: &[PanelHandle], store: &StateStore, options: AggregateOptions) {
    reconcile::reconcile(central, nodes).await;
    aggregate::aggregate(central, nodes, store, options).await;
}

fn panel_handle(panel: &crate::panel::Panel, options: PanelClientOptions) -> anyhow::Result<PanelHandle> {
    let client = PanelClient::new(panel, options)?;
    Ok(PanelHandle::new(panel.normalized_url(), Arc::new(client)))
}

/// Best-effort, one-time copy of a pre-existing database file (plus its
/// WAL/SHM sidecars) onto the configured path, if the configured path does
/// not already exist.
fn migrate_db_if_needed(new_path: &Path, legacy_candidates: &[&str]) {
    if new_path.exists() {
        return;
    }
    let Some(legacy) = legacy_candidates.iter().map(PathBuf::from).find(|p| p.exists()) else {
        return;
    };
    if let Some(parent) = new_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(err = %e, "failed to create data directory for database migration");
            return;
        }
    }
    if let Err(e) = std::fs::copy(&legacy, new_path) {
        warn!(from = %legacy.display(), to = %new_path.display(), err = %e, "failed to migrate legacy database");
        return;
    }
    info!(from = %legacy.display(), to = %new_path.display(), "migrated legacy database");
    for suffix in ["-wal", "-shm"] {
        let legacy_sidecar = append_to_file_name(&legacy, suffix);
        if legacy_sidecar.exists() {
            let new_sidecar = append_to_file_name(new_path, suffix);
            if let Err(e) = std::fs::copy(&legacy_sidecar, &new_sidecar) {
                warn!(err = %e, suffix, "failed to migrate legacy database sidecar file");
            }
        }
    }
}

fn append_to_file_name(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Write the current unix timestamp to the heartbeat path. Failures are
/// logged, never propagated — a missing heartbeat write should not stop the
/// cycle loop.
fn write_heartbeat(path: &Path) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    if let Err(e) = std::fs::write(path, now.to_string()) {
        warn!(path = %path.display(), err = %e, "failed to write heartbeat file");
    }
}

/// Flip `shutdown` on the first SIGINT/SIGTERM; a second signal forces exit,
/// matching the reference implementation's single-flag-then-still-responsive
/// behavior translated to an idiomatic cancellation token.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => info!("received SIGTERM"),
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => info!("received SIGINT"),
        }
        shutdown.cancel();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => error!("received SIGTERM again, forcing exit"),
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => error!("received SIGINT again, forcing exit"),
        }
        std::process::exit(130);
    });
}

#[cfg(test)]
#[path = "driver_tests.rs"]
mod tests;
