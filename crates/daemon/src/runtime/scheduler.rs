//! The delivery scheduler: one cancellable sleep aimed at the earliest
//! future `deliver_at`.
//!
//! Any write that can lower that minimum pokes the notify handle; a 60 s
//! safety tick covers clock jumps and missed signals. The scheduler never
//! mutates envelopes — on wake it re-queries the store and hands due work to
//! the router and the per-agent executors.

use std::time::Duration;

use hb_domain::time::now_ms;

use crate::state::AppState;

/// Safety tick: upper bound on how long the scheduler sleeps without
/// re-deriving its timer from the store.
const SAFETY_TICK: Duration = Duration::from_secs(60);

/// Max channel envelopes drained per wake; the loop re-runs immediately
/// while more are due.
const CHANNEL_DRAIN_BATCH: usize = 32;

pub fn spawn(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("scheduler started");
        loop {
            let now = now_ms();

            // Aim the single timer at the earliest future deliver_at,
            // clamped by the safety tick.
            let sleep_ms = match state.store.next_scheduled_envelope(now) {
                Ok(Some(envelope)) => {
                    let target = envelope.deliver_at.unwrap_or(now);
                    (target.saturating_sub(now)).min(SAFETY_TICK.as_millis() as u64)
                }
                Ok(None) => SAFETY_TICK.as_millis() as u64,
                Err(e) => {
                    tracing::error!(error = %e, "scheduler failed to query next envelope");
                    SAFETY_TICK.as_millis() as u64
                }
            };

            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                () = state.scheduler.notified() => {
                    // An earlier deliver_at may exist now; recompute.
                }
                () = state.shutdown.cancelled() => {
                    tracing::info!("scheduler stopped");
                    return;
                }
            }

            drain_due(&state).await;
        }
    })
}

/// Deliver everything that has become due: channel envelopes through the
/// router, agent queues via executor signals.
pub async fn drain_due(state: &AppState) {
    loop {
        let now = now_ms();
        let batch = match state.store.due_channel_envelopes(now, CHANNEL_DRAIN_BATCH) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!(error = %e, "scheduler failed to load due channel envelopes");
                return;
            }
        };
        let drained = batch.len();
        for envelope in batch {
            crate::runtime::router::deliver_channel(state, envelope).await;
        }
        if drained < CHANNEL_DRAIN_BATCH {
            break;
        }
    }

    match state.store.due_agent_names(now_ms()) {
        Ok(names) => {
            for name in names {
                crate::runtime::executor::signal(state, &name);
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "scheduler failed to load due agents");
        }
    }
}
