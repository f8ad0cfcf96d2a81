//! `cron.*` handlers.

use chrono::Utc;
use serde_json::{json, Value};

use hb_domain::cron::CronSchedule;
use hb_domain::envelope::EnvelopeContent;
use hb_domain::id::{new_id, short_id};
use hb_domain::time::{now_ms, parse_tz, validate_tz};
use hb_domain::{Address, Error, Result};

use crate::rpc::auth::Identity;
use crate::rpc::handlers::{param_str, require_str};
use crate::runtime::cron::CronExpr;
use crate::state::AppState;

fn cron_view(state: &AppState, schedule: &CronSchedule) -> Value {
    let tz = schedule
        .timezone
        .as_deref()
        .map(parse_tz)
        .unwrap_or_else(|| state.boss_timezone());
    let next = CronExpr::parse(&schedule.cron)
        .ok()
        .and_then(|expr| expr.next_occurrence(&Utc::now(), tz))
        .map(|dt| dt.timestamp_millis().max(0) as u64);
    json!({
        "id": schedule.id.to_string(),
        "short-id": short_id(&schedule.id),
        "agent": schedule.agent_name,
        "cron": schedule.cron,
        "timezone": schedule.timezone,
        "enabled": schedule.enabled,
        "to": schedule.to.to_string(),
        "text": schedule.content.text,
        "next-occurrence": next,
        "pending-envelope-id": schedule.pending_envelope_id.map(|id| id.to_string()),
        "created-at": schedule.created_at,
        "updated-at": schedule.updated_at,
    })
}

/// Agents manage only their own schedules; the boss manages all.
fn check_owner(identity: &Identity, schedule: &CronSchedule) -> Result<()> {
    if identity.is_boss() || identity.agent_name() == Some(schedule.agent_name.as_str()) {
        Ok(())
    } else {
        Err(Error::PermissionDenied(format!(
            "cron schedule {} belongs to '{}'",
            short_id(&schedule.id),
            schedule.agent_name
        )))
    }
}

pub(super) fn create(state: &AppState, identity: &Identity, params: &Value) -> Result<Value> {
    let cron = require_str(params, "cron")?;
    CronExpr::parse(&cron)?;

    let to: Address = require_str(params, "to")?.parse()?;
    let timezone = match param_str(params, "timezone") {
        Some(tz) => {
            validate_tz(&tz)?;
            Some(tz)
        }
        None => None,
    };

    // Owner: explicit param (boss), the caller (agent), else inferred from
    // an agent destination.
    let agent_name = match param_str(params, "agent") {
        Some(name) => {
            if !identity.is_boss() && identity.agent_name() != Some(name.as_str()) {
                return Err(Error::PermissionDenied(
                    "only the boss may create schedules for other agents".into(),
                ));
            }
            name
        }
        None => match identity.agent_name() {
            Some(name) => name.to_string(),
            None => to
                .agent_name()
                .map(str::to_string)
                .ok_or_else(|| Error::Validation("missing parameter 'agent'".into()))?,
        },
    };
    if state.store.get_agent(&agent_name)?.is_none() {
        return Err(Error::NotFound(format!("agent '{agent_name}'")));
    }

    let content = EnvelopeContent {
        text: param_str(params, "text"),
        attachments: super::envelope::parse_attachments(params)?,
    };
    if content.is_empty() {
        return Err(Error::Validation(
            "cron content needs text or attachments".into(),
        ));
    }
    let metadata = params
        .get("metadata")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let now = now_ms();
    let schedule = CronSchedule {
        id: new_id(),
        agent_name,
        cron,
        timezone,
        enabled: params
            .get("enabled")
            .and_then(Value::as_bool)
            .unwrap_or(true),
        to,
        content,
        metadata,
        pending_envelope_id: None,
        created_at: now,
        updated_at: now,
    };
    state.store.insert_cron(&schedule)?;
    state.materializer.notify_one();

    let stored = state
        .store
        .get_cron(&schedule.id)?
        .ok_or_else(|| Error::Internal("schedule vanished after insert".into()))?;
    Ok(cron_view(state, &stored))
}

pub(super) fn list(state: &AppState, identity: &Identity, params: &Value) -> Result<Value> {
    let agent_filter = match param_str(params, "agent") {
        Some(name) => {
            if !identity.is_boss() && identity.agent_name() != Some(name.as_str()) {
                return Err(Error::PermissionDenied(
                    "only the boss may list another agent's schedules".into(),
                ));
            }
            Some(name)
        }
        None => identity.agent_name().map(str::to_string),
    };
    let schedules = state.store.list_crons(agent_filter.as_deref())?;
    Ok(json!({
        "crons": schedules.iter().map(|s| cron_view(state, s)).collect::<Vec<_>>(),
        "count": schedules.len(),
    }))
}

pub(super) fn get(state: &AppState, identity: &Identity, params: &Value) -> Result<Value> {
    let raw = require_str(params, "id")?;
    let schedule = state.store.find_cron_by_prefix(&raw)?;
    check_owner(identity, &schedule)?;
    Ok(cron_view(state, &schedule))
}

pub(super) fn set_enabled(
    state: &AppState,
    identity: &Identity,
    params: &Value,
    enabled: bool,
) -> Result<Value> {
    let raw = require_str(params, "id")?;
    let schedule = state.store.find_cron_by_prefix(&raw)?;
    check_owner(identity, &schedule)?;
    state.store.set_cron_enabled(&schedule.id, enabled, now_ms())?;
    if enabled {
        state.materializer.notify_one();
    } else {
        state.scheduler.notify_one();
    }
    Ok(json!({ "id": schedule.id.to_string(), "enabled": enabled }))
}

pub(super) fn delete(state: &AppState, identity: &Identity, params: &Value) -> Result<Value> {
    let raw = require_str(params, "id")?;
    let schedule = state.store.find_cron_by_prefix(&raw)?;
    check_owner(identity, &schedule)?;
    let deleted = state.store.delete_cron(&schedule.id)?;
    state.scheduler.notify_one();
    Ok(json!({ "id": schedule.id.to_string(), "deleted": deleted }))
}
