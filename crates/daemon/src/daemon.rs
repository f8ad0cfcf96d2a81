//! Daemon assembly: open the store, acquire the instance lock, start every
//! worker, and supervise shutdown.

use std::sync::Arc;

use anyhow::Context;

use hb_store::Store;

use crate::paths::DataDir;
use crate::pid;
use crate::runtime::{materializer, scheduler};
use crate::state::AppState;

/// Run the daemon until a shutdown signal (SIGINT/SIGTERM or `daemon.stop`).
pub async fn run(data_dir: DataDir) -> anyhow::Result<()> {
    data_dir.ensure_layout().context("creating data directory layout")?;

    // ── Single-instance lock ─────────────────────────────────────────
    let pid_path = data_dir.pid_path();
    let pid_handle = pid::write_pid_file(&pid_path)?;

    // ── Store (schema gate + stale-run reconciliation happen on open) ─
    let store = Arc::new(
        Store::open(&data_dir.db_path())
            .map_err(|e| anyhow::anyhow!("opening store: {e}"))?,
    );
    tracing::info!(path = %data_dir.db_path().display(), "store ready");

    let state = AppState::new(store, data_dir.clone(), AppState::default_drivers());

    // ── Workers ──────────────────────────────────────────────────────
    let scheduler_task = scheduler::spawn(state.clone());
    let materializer_task = materializer::spawn(state.clone());
    let rpc_task = crate::rpc::spawn(state.clone(), &data_dir.socket_path())
        .context("starting RPC server")?;

    // Startup recovery: wake every agent that already has due work.
    scheduler::drain_due(&state).await;

    tracing::info!(data_dir = %data_dir.root().display(), "hibossd running");

    // ── Await shutdown ───────────────────────────────────────────────
    wait_for_shutdown(&state).await;
    state.shutdown.cancel();

    // Give workers a moment to wind down (provider children receive their
    // signals through cancellation of the shared token).
    let drain = async {
        let _ = rpc_task.await;
        let _ = scheduler_task.await;
        let _ = materializer_task.await;
    };
    if tokio::time::timeout(std::time::Duration::from_secs(10), drain)
        .await
        .is_err()
    {
        tracing::warn!("workers did not stop within the grace period");
    }

    let _ = std::fs::remove_file(data_dir.socket_path());
    pid::remove_pid_file(&pid_path, pid_handle);
    tracing::info!("hibossd stopped");
    Ok(())
}

async fn wait_for_shutdown(state: &AppState) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => tracing::info!("SIGINT received"),
                    () = state.shutdown.cancelled() => {}
                }
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
            () = state.shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = ctrl_c => tracing::info!("interrupt received"),
            () = state.shutdown.cancelled() => {}
        }
    }
}
