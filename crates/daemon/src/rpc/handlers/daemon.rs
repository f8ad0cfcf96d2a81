//! `daemon.*` handlers.

use serde_json::{json, Value};

use hb_domain::time::{now_ms, to_local_iso};
use hb_domain::Result;

use crate::state::AppState;

pub(super) fn status(state: &AppState) -> Result<Value> {
    let agents = state.store.list_agents()?;
    Ok(json!({
        "running": true,
        "data-dir": state.data_dir.root().display().to_string(),
        "uptime-ms": now_ms().saturating_sub(state.started_at),
        "agents": agents.len(),
        "pending-envelopes": state.store.count_pending()?,
        "adapters": state.bridge.active_platforms().join(","),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// The answering daemon is by definition running; actual process spawn
/// belongs to the CLI. Reports status so `start` is idempotent.
pub(super) fn start(state: &AppState) -> Result<Value> {
    Ok(json!({
        "running": true,
        "already-running": true,
        "data-dir": state.data_dir.root().display().to_string(),
    }))
}

pub(super) fn stop(state: &AppState) -> Result<Value> {
    tracing::info!("shutdown requested over RPC");
    state.shutdown.cancel();
    Ok(json!({ "stopping": true }))
}

pub(super) fn ping() -> Result<Value> {
    Ok(json!({ "pong": true, "now-ms": now_ms() }))
}

pub(super) fn time(state: &AppState) -> Result<Value> {
    let tz = state.boss_timezone();
    let now = now_ms();
    Ok(json!({
        "now-ms": now,
        "now-iso": to_local_iso(now, tz),
        "timezone": tz.name(),
    }))
}
