//! RPC method handlers, one module per method family.

mod agent;
mod cron;
mod daemon;
mod envelope;
mod setup;

use serde_json::Value;

use hb_domain::time::now_ms;
use hb_domain::{Error, Result};

use crate::rpc::auth::{self, Identity, PermissionPolicy, BOOTSTRAP_METHODS};
use crate::state::AppState;

/// Dispatch one request. Bootstrap methods skip authentication; everything
/// else requires a valid `token` parameter and the policy's minimum level.
pub async fn dispatch(state: &AppState, method: &str, params: &Value) -> Result<Value> {
    if BOOTSTRAP_METHODS.contains(&method) {
        return match method {
            "setup.check" => setup::check(state),
            "setup.execute" => setup::execute(state, params),
            "boss.verify" => setup::verify(state, params),
            _ => unreachable!("bootstrap method list is exhaustive"),
        };
    }

    let token = require_str(params, "token")
        .map_err(|_| Error::Auth("missing token parameter".into()))?;
    let identity = auth::classify(&state.store, &token)?;
    let policy = PermissionPolicy::load(&state.store);
    policy.authorize(&identity, method)?;

    if let Some(name) = identity.agent_name() {
        // Best-effort liveness stamp; failures must not fail the call.
        let _ = state.store.set_agent_last_seen(name, now_ms());
    }

    match method {
        "envelope.send" => envelope::send(state, &identity, params).await,
        "envelope.list" => envelope::list(state, &identity, params),
        "envelope.get" => envelope::get(state, &identity, params),
        "cron.create" => cron::create(state, &identity, params),
        "cron.list" => cron::list(state, &identity, params),
        "cron.get" => cron::get(state, &identity, params),
        "cron.enable" => cron::set_enabled(state, &identity, params, true),
        "cron.disable" => cron::set_enabled(state, &identity, params, false),
        "cron.delete" => cron::delete(state, &identity, params),
        "reaction.set" => envelope::set_reaction(state, &identity, params).await,
        "agent.register" => agent::register(state, params),
        "agent.set" => agent::set(state, &identity, params),
        "agent.list" => agent::list(state),
        "agent.bind" => agent::bind(state, params),
        "agent.unbind" => agent::unbind(state, params),
        "agent.status" => agent::status(state, &identity, params),
        "agent.refresh" => agent::refresh(state, params),
        "agent.abort" => agent::abort(state, params),
        "agent.delete" => agent::delete(state, params).await,
        "agent.self" => agent::self_info(state, &identity),
        "agent.session-policy.set" => agent::session_policy_set(state, &identity, params),
        "daemon.status" => daemon::status(state),
        "daemon.start" => daemon::start(state),
        "daemon.stop" => daemon::stop(state),
        "daemon.ping" => daemon::ping(),
        "daemon.time" => daemon::time(state),
        other => Err(Error::NotFound(format!("method '{other}'"))),
    }
}

// ── Param helpers ─────────────────────────────────────────────────────

pub(crate) fn param_str(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

pub(crate) fn require_str(params: &Value, key: &str) -> Result<String> {
    param_str(params, key).ok_or_else(|| Error::Validation(format!("missing parameter '{key}'")))
}

pub(crate) fn param_bool(params: &Value, key: &str) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(false)
}

pub(crate) fn param_u64(params: &Value, key: &str) -> Option<u64> {
    params.get(key).and_then(Value::as_u64)
}

/// The agent a call operates on: explicit `name`/`agent` param when present
/// (boss required to name other agents), else the caller itself.
pub(crate) fn target_agent(identity: &Identity, params: &Value, key: &str) -> Result<String> {
    match param_str(params, key) {
        Some(name) => {
            if !identity.is_boss() && identity.agent_name() != Some(name.as_str()) {
                return Err(Error::PermissionDenied(format!(
                    "only the boss may target other agents ('{name}')"
                )));
            }
            Ok(name)
        }
        None => identity
            .agent_name()
            .map(str::to_string)
            .ok_or_else(|| Error::Validation(format!("missing parameter '{key}'"))),
    }
}
