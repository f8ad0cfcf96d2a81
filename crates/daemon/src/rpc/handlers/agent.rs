//! `agent.*` handlers.

use serde_json::{json, Value};

use hb_domain::agent::{
    validate_agent_name, Agent, AgentBinding, PermissionLevel, Provider, ReasoningEffort,
    SessionPolicy, META_ROLE, META_SESSION_HANDLE,
};
use hb_domain::id::new_id;
use hb_domain::run::AgentRun;
use hb_domain::time::now_ms;
use hb_domain::{Error, Result};

use crate::rpc::auth::Identity;
use crate::rpc::handlers::{param_bool, param_str, param_u64, require_str, target_agent};
use crate::runtime::executor;
use crate::state::AppState;

fn agent_view(state: &AppState, agent: &Agent) -> Value {
    let pending = state
        .store
        .count_due_pending_for_agent(&agent.name, now_ms())
        .unwrap_or(0);
    json!({
        "name": agent.name,
        "description": agent.description,
        "workspace": agent.workspace,
        "provider": agent.provider.as_str(),
        "model": agent.model,
        "reasoning-effort": agent.reasoning_effort.map(|r| r.as_str()),
        "permission-level": agent.permission_level.as_str(),
        "role": agent.metadata.get(META_ROLE).and_then(Value::as_str).unwrap_or("leader"),
        "session-policy": agent.session_policy,
        "pending-envelopes": pending,
        "created-at": agent.created_at,
        "last-seen-at": agent.last_seen_at,
    })
}

fn run_view(run: &AgentRun) -> Value {
    json!({
        "id": run.id.to_string(),
        "status": run.status.as_str(),
        "started-at": run.started_at,
        "completed-at": run.completed_at,
        "context-length": run.context_length,
        "envelopes": run.envelope_ids.len(),
        "error": run.error,
    })
}

/// Generate an opaque agent bearer token.
fn generate_token() -> String {
    format!("hb_{}{}", new_id().simple(), new_id().simple())
}

pub(super) fn register(state: &AppState, params: &Value) -> Result<Value> {
    let name = require_str(params, "name")?;
    validate_agent_name(&name)?;
    if state.store.get_agent(&name)?.is_some() {
        return Err(Error::Conflict(format!("agent '{name}' already exists")));
    }

    let provider: Provider = require_str(params, "provider")?.parse()?;
    let reasoning_effort = match param_str(params, "reasoning-effort") {
        Some(raw) => Some(raw.parse::<ReasoningEffort>()?),
        None => None,
    };
    let permission_level = match param_str(params, "permission-level") {
        Some(raw) => raw.parse::<PermissionLevel>()?,
        None => PermissionLevel::Standard,
    };

    let mut metadata = params
        .get("metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    metadata.remove(META_SESSION_HANDLE);
    metadata.insert(META_ROLE.into(), json!("leader"));

    let agent = Agent {
        name: name.clone(),
        token: generate_token(),
        description: param_str(params, "description"),
        workspace: param_str(params, "workspace"),
        provider,
        model: param_str(params, "model"),
        reasoning_effort,
        permission_level,
        session_policy: None,
        created_at: now_ms(),
        last_seen_at: None,
        metadata,
        session_opened_at: None,
        refresh_requested: false,
    };
    state.store.create_agent(&agent)?;
    state.data_dir.ensure_agent_layout(&name)?;

    tracing::info!(agent = %name, provider = %agent.provider, "agent registered");
    // The token is returned exactly once, here.
    Ok(json!({
        "name": name,
        "token": agent.token,
        "permission-level": agent.permission_level.as_str(),
        "created-at": agent.created_at,
    }))
}

pub(super) fn set(state: &AppState, identity: &Identity, params: &Value) -> Result<Value> {
    let name = target_agent(identity, params, "name")?;
    let mut agent = state
        .store
        .get_agent(&name)?
        .ok_or_else(|| Error::NotFound(format!("agent '{name}'")))?;

    // Nullable fields: absent = unchanged, JSON null = cleared.
    for key in ["description", "workspace", "model"] {
        match params.get(key) {
            None => {}
            Some(Value::Null) => match key {
                "description" => agent.description = None,
                "workspace" => agent.workspace = None,
                _ => agent.model = None,
            },
            Some(Value::String(s)) => match key {
                "description" => agent.description = Some(s.clone()),
                "workspace" => agent.workspace = Some(s.clone()),
                _ => agent.model = Some(s.clone()),
            },
            Some(_) => {
                return Err(Error::Validation(format!("'{key}' must be a string or null")));
            }
        }
    }
    match params.get("reasoning-effort") {
        None => {}
        Some(Value::Null) => agent.reasoning_effort = None,
        Some(Value::String(s)) => agent.reasoning_effort = Some(s.parse()?),
        Some(_) => {
            return Err(Error::Validation(
                "'reasoning-effort' must be a string or null".into(),
            ))
        }
    }
    if let Some(raw) = param_str(params, "provider") {
        agent.provider = raw.parse()?;
    }
    if let Some(raw) = param_str(params, "permission-level") {
        let level: PermissionLevel = raw.parse()?;
        if level == PermissionLevel::Boss && !identity.is_boss() {
            return Err(Error::PermissionDenied(
                "only the boss may grant boss level".into(),
            ));
        }
        agent.permission_level = level;
    }
    state.store.update_agent(&agent)?;

    // Metadata handling is separate so reserved keys survive.
    if param_bool(params, "clear-metadata") {
        state.store.replace_agent_metadata(&name, None)?;
    } else if let Some(metadata) = params.get("metadata").and_then(Value::as_object) {
        state.store.replace_agent_metadata(&name, Some(metadata))?;
    }

    let stored = state
        .store
        .get_agent(&name)?
        .ok_or_else(|| Error::Internal("agent vanished after update".into()))?;
    Ok(agent_view(state, &stored))
}

pub(super) fn list(state: &AppState) -> Result<Value> {
    let agents = state.store.list_agents()?;
    Ok(json!({
        "agents": agents.iter().map(|a| agent_view(state, a)).collect::<Vec<_>>(),
        "count": agents.len(),
    }))
}

pub(super) fn bind(state: &AppState, params: &Value) -> Result<Value> {
    let name = require_str(params, "name")?;
    if state.store.get_agent(&name)?.is_none() {
        return Err(Error::NotFound(format!("agent '{name}'")));
    }
    let binding = AgentBinding {
        id: new_id(),
        agent_name: name.clone(),
        adapter_type: require_str(params, "adapter-type")?,
        adapter_token: require_str(params, "adapter-token")?,
        created_at: now_ms(),
    };
    state.store.create_binding(&binding)?;
    tracing::info!(agent = %name, adapter = %binding.adapter_type, "adapter bound");
    Ok(json!({
        "binding-id": binding.id.to_string(),
        "agent": name,
        "adapter-type": binding.adapter_type,
    }))
}

pub(super) fn unbind(state: &AppState, params: &Value) -> Result<Value> {
    let name = require_str(params, "name")?;
    let adapter_type = require_str(params, "adapter-type")?;
    let removed = state.store.delete_binding(&name, &adapter_type)?;
    if !removed {
        return Err(Error::NotFound(format!(
            "no {adapter_type} binding for agent '{name}'"
        )));
    }
    Ok(json!({ "agent": name, "adapter-type": adapter_type, "unbound": true }))
}

pub(super) fn status(state: &AppState, identity: &Identity, params: &Value) -> Result<Value> {
    let name = target_agent(identity, params, "name")?;
    let agent = state
        .store
        .get_agent(&name)?
        .ok_or_else(|| Error::NotFound(format!("agent '{name}'")))?;

    let running = executor::is_running(state, &name);
    let last_run = state.store.last_terminal_run(&name)?;
    Ok(json!({
        "name": name,
        "state": if running { "running" } else { "idle" },
        "pending-envelopes": state.store.count_due_pending_for_agent(&name, now_ms())?,
        "session-active": agent.session_handle().is_some(),
        "session-opened-at": agent.session_opened_at,
        "refresh-requested": agent.refresh_requested,
        "last-run": last_run.as_ref().map(run_view),
    }))
}

/// Queue a manual session refresh; applied at the next safe point.
pub(super) fn refresh(state: &AppState, params: &Value) -> Result<Value> {
    let name = require_str(params, "name")?;
    state.store.set_refresh_requested(&name, true)?;
    Ok(json!({ "agent": name, "refresh-queued": true }))
}

pub(super) fn abort(state: &AppState, params: &Value) -> Result<Value> {
    let name = require_str(params, "name")?;
    if state.store.get_agent(&name)?.is_none() {
        return Err(Error::NotFound(format!("agent '{name}'")));
    }
    let clear_pending = param_bool(params, "clear-pending");
    let aborted = executor::abort(state, &name, clear_pending);

    // With no turn in flight the clear happens here instead of in the
    // cancellation transaction.
    let mut cleared = 0u64;
    if clear_pending && !aborted {
        cleared = state.store.clear_due_pending_for_agent(&name, now_ms())?;
    }
    Ok(json!({
        "agent": name,
        "aborted": aborted,
        "cleared-pending": if aborted { Value::Null } else { json!(cleared) },
    }))
}

pub(super) async fn delete(state: &AppState, params: &Value) -> Result<Value> {
    let name = require_str(params, "name")?;
    executor::stop(state, &name).await;
    let deleted = state.store.delete_agent(&name)?;
    if !deleted {
        return Err(Error::NotFound(format!("agent '{name}'")));
    }
    state.scheduler.notify_one();
    tracing::info!(agent = %name, "agent deleted");
    Ok(json!({ "agent": name, "deleted": true }))
}

pub(super) fn self_info(state: &AppState, identity: &Identity) -> Result<Value> {
    match identity {
        Identity::Boss => Ok(json!({
            "boss": true,
            "name": state.boss_name(),
            "timezone": state.boss_timezone().name(),
        })),
        Identity::Agent(agent) => {
            let stored = state
                .store
                .get_agent(&agent.name)?
                .ok_or_else(|| Error::NotFound(format!("agent '{}'", agent.name)))?;
            Ok(agent_view(state, &stored))
        }
    }
}

pub(super) fn session_policy_set(
    state: &AppState,
    identity: &Identity,
    params: &Value,
) -> Result<Value> {
    let name = target_agent(identity, params, "name")?;
    let mut agent = state
        .store
        .get_agent(&name)?
        .ok_or_else(|| Error::NotFound(format!("agent '{name}'")))?;

    if param_bool(params, "clear") {
        agent.session_policy = None;
    } else {
        let daily_reset_at = match param_str(params, "daily-reset-at") {
            Some(raw) => Some(raw.parse::<hb_domain::time::ClockTime>()?),
            None => None,
        };
        let policy = SessionPolicy {
            daily_reset_at,
            idle_timeout: param_str(params, "idle-timeout"),
            max_context_length: param_u64(params, "max-context-length"),
        };
        policy.validate()?;
        if policy.is_empty() {
            return Err(Error::Validation(
                "session policy needs at least one of daily-reset-at, idle-timeout, max-context-length".into(),
            ));
        }
        agent.session_policy = Some(policy);
    }
    state.store.update_agent(&agent)?;
    Ok(json!({
        "agent": name,
        "session-policy": agent.session_policy,
    }))
}
