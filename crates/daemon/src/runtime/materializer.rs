//! Cron materializer: keeps exactly one pending envelope per enabled
//! schedule, aimed at the schedule's next occurrence.
//!
//! Re-evaluation triggers: schedule create/enable (poke), completion of the
//! previously materialized envelope (poke from the ack paths), and a
//! periodic tick. Schedules are walked in creation order, so equal
//! occurrences materialize earliest-created first.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use hb_domain::cron::CronSchedule;
use hb_domain::envelope::{meta, Envelope, EnvelopeStatus};
use hb_domain::id::new_id;
use hb_domain::time::{now_ms, parse_tz};
use hb_domain::{Address, Result};

use crate::runtime::cron::CronExpr;
use crate::state::AppState;

const TICK: Duration = Duration::from_secs(60);

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("cron materializer started");
        loop {
            if let Err(e) = evaluate_all(&state) {
                tracing::error!(error = %e, "cron materialization pass failed");
            }
            tokio::select! {
                () = tokio::time::sleep(TICK) => {}
                () = state.materializer.notified() => {}
                () = state.shutdown.cancelled() => {
                    tracing::info!("cron materializer stopped");
                    return;
                }
            }
        }
    })
}

/// One materialization pass over every enabled schedule.
pub fn evaluate_all(state: &AppState) -> Result<()> {
    let schedules = state.store.list_enabled_crons()?;
    let mut armed_any = false;
    for schedule in schedules {
        match materialize_if_needed(state, &schedule) {
            Ok(true) => armed_any = true,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(cron_id = %schedule.id, error = %e, "failed to materialize schedule");
            }
        }
    }
    if armed_any {
        state.scheduler.notify_one();
    }
    Ok(())
}

/// Materialize the next occurrence unless a pending envelope is already
/// armed. Returns whether a new envelope was created.
fn materialize_if_needed(state: &AppState, schedule: &CronSchedule) -> Result<bool> {
    if let Some(pending_id) = &schedule.pending_envelope_id {
        if let Some(envelope) = state.store.get_envelope(pending_id)? {
            if envelope.status == EnvelopeStatus::Pending {
                return Ok(false); // still armed
            }
        }
    }

    let tz = schedule
        .timezone
        .as_deref()
        .map(parse_tz)
        .unwrap_or_else(|| state.boss_timezone());
    let expr = CronExpr::parse(&schedule.cron)?;
    let now = now_ms();
    let after: DateTime<Utc> = Utc
        .timestamp_millis_opt(now as i64)
        .single()
        .unwrap_or_else(Utc::now);
    let Some(next) = expr.next_occurrence(&after, tz) else {
        tracing::warn!(cron_id = %schedule.id, cron = %schedule.cron, "no next occurrence within a year");
        return Ok(false);
    };
    let deliver_at = next.timestamp_millis().max(0) as u64;

    // Template metadata was stripped of reply keys on write; carry it over
    // and stamp the owning schedule.
    let mut metadata = schedule.metadata.clone();
    for key in meta::REPLY_KEYS {
        metadata.remove(*key);
    }
    metadata.insert(
        meta::CRON_SCHEDULE_ID.into(),
        serde_json::json!(schedule.id.to_string()),
    );

    let envelope = Envelope {
        id: new_id(),
        from: Address::agent(&schedule.agent_name),
        to: schedule.to.clone(),
        from_boss: false,
        content: schedule.content.clone(),
        deliver_at: Some(deliver_at),
        status: EnvelopeStatus::Pending,
        created_at: now,
        metadata,
    };

    state
        .store
        .materialize_cron_envelope(&schedule.id, &envelope, now)?;
    tracing::info!(
        cron_id = %schedule.id,
        envelope_id = %envelope.id,
        deliver_at,
        "materialized next cron occurrence"
    );
    Ok(true)
}
