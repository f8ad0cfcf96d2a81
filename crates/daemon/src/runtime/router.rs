//! Envelope routing: resolve destinations, enforce send authorization, and
//! terminalize channel deliveries.
//!
//! Channel delivery outcomes are terminal either way (at-most-once): success
//! stamps the platform message id, failure records the post-mortem. Agent
//! destinations are persisted and signalled to the executor; the router
//! never terminalizes those.

use hb_domain::envelope::Envelope;
use hb_domain::time::now_ms;
use hb_domain::{Address, Error, Result};

use crate::runtime::bridge;
use crate::state::AppState;

/// Persist a new envelope and dispatch it when due. Future `deliver_at`
/// envelopes just re-aim the scheduler.
pub async fn submit(state: &AppState, envelope: Envelope) -> Result<()> {
    authorize_send(state, &envelope)?;
    state.store.insert_envelope(&envelope)?;
    tracing::debug!(
        envelope_id = %envelope.id,
        from = %envelope.from,
        to = %envelope.to,
        "envelope accepted"
    );

    let now = now_ms();
    if envelope.deliver_at.is_some_and(|at| at > now) {
        state.scheduler.notify_one();
        return Ok(());
    }
    dispatch_due(state, envelope).await
}

/// Dispatch an envelope that is due now.
pub async fn dispatch_due(state: &AppState, envelope: Envelope) -> Result<()> {
    match &envelope.to {
        Address::Agent(name) => {
            crate::runtime::executor::signal(state, name);
            Ok(())
        }
        Address::Channel { .. } => {
            deliver_channel(state, envelope).await;
            Ok(())
        }
    }
}

/// A channel send from an agent requires a binding of the destination's
/// adapter type. Checked before the envelope is accepted.
fn authorize_send(state: &AppState, envelope: &Envelope) -> Result<()> {
    let (Some(sender), Address::Channel { adapter_type, .. }) =
        (envelope.from.agent_name(), &envelope.to)
    else {
        return Ok(());
    };
    if state.store.agent_has_binding(sender, adapter_type)? {
        Ok(())
    } else {
        Err(Error::PermissionDenied(format!(
            "agent '{sender}' has no {adapter_type} binding"
        )))
    }
}

/// Deliver a channel-destined envelope through the bridge and terminalize
/// it. Failures are recorded on the envelope and are not retried.
pub async fn deliver_channel(state: &AppState, envelope: Envelope) {
    let result = bridge::dispatch_outbound(state, &envelope).await;
    let now = now_ms();
    let outcome = match result {
        Ok(platform_message_id) => state
            .store
            .complete_channel_delivery(&envelope.id, platform_message_id.as_deref()),
        Err(err) => {
            tracing::warn!(
                envelope_id = %envelope.id,
                to = %envelope.to,
                error = %err,
                "channel delivery failed, terminalizing"
            );
            state
                .store
                .record_delivery_failure(&envelope.id, now, err.kind(), &err.to_string())
        }
    };
    if let Err(store_err) = outcome {
        tracing::error!(envelope_id = %envelope.id, error = %store_err, "failed to terminalize envelope");
    }
    // A completed cron materialization re-arms its schedule.
    if envelope.cron_schedule_id().is_some() {
        state.materializer.notify_one();
    }
}
