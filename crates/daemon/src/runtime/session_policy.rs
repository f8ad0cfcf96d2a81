//! Pre-run session-policy evaluation.
//!
//! Decides whether the executor should discard the persisted session handle
//! and open a fresh provider session. Never consulted mid-turn; the executor
//! calls this only at the pre-run safe point.

use chrono_tz::Tz;

use hb_domain::agent::SessionPolicy;
use hb_domain::time::{parse_duration_ms, TimestampMs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// Queued `agent.refresh` request.
    Manual,
    DailyReset,
    IdleTimeout,
    ContextLength,
}

impl RefreshReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshReason::Manual => "manual",
            RefreshReason::DailyReset => "daily-reset",
            RefreshReason::IdleTimeout => "idle-timeout",
            RefreshReason::ContextLength => "context-length",
        }
    }
}

/// Facts the evaluation runs against.
#[derive(Debug, Clone, Copy)]
pub struct PolicyInputs {
    pub now: TimestampMs,
    pub tz: Tz,
    /// Whether a session handle is currently persisted.
    pub handle_present: bool,
    pub session_opened_at: Option<TimestampMs>,
    /// Completion time of the last terminal run.
    pub last_run_completed_at: Option<TimestampMs>,
    /// Context length of the last completed run.
    pub last_context_length: Option<u64>,
    /// Queued manual refresh flag.
    pub refresh_requested: bool,
}

/// First trigger wins: manual, then `dailyResetAt`, `idleTimeout`,
/// `maxContextLength`.
pub fn evaluate(policy: Option<&SessionPolicy>, inputs: &PolicyInputs) -> Option<RefreshReason> {
    if inputs.refresh_requested {
        return Some(RefreshReason::Manual);
    }
    if !inputs.handle_present {
        return None; // nothing to discard
    }
    let policy = policy?;

    if let Some(reset_at) = &policy.daily_reset_at {
        let last_reset = reset_at.last_occurrence(inputs.now, inputs.tz);
        // A session with no recorded open time is treated as stale.
        if inputs.session_opened_at.unwrap_or(0) < last_reset {
            return Some(RefreshReason::DailyReset);
        }
    }

    if let Some(timeout) = &policy.idle_timeout {
        if let Ok(timeout_ms) = parse_duration_ms(timeout) {
            let anchor = inputs
                .last_run_completed_at
                .or(inputs.session_opened_at)
                .unwrap_or(0);
            if inputs.now.saturating_sub(anchor) > timeout_ms {
                return Some(RefreshReason::IdleTimeout);
            }
        }
    }

    if let Some(max) = policy.max_context_length {
        if inputs.last_context_length.is_some_and(|len| len > max) {
            return Some(RefreshReason::ContextLength);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3_600_000;

    fn inputs(now: TimestampMs) -> PolicyInputs {
        PolicyInputs {
            now,
            tz: chrono_tz::UTC,
            handle_present: true,
            session_opened_at: Some(now),
            last_run_completed_at: Some(now),
            last_context_length: None,
            refresh_requested: false,
        }
    }

    fn policy() -> SessionPolicy {
        SessionPolicy {
            daily_reset_at: None,
            idle_timeout: None,
            max_context_length: None,
        }
    }

    #[test]
    fn manual_refresh_wins_over_everything() {
        let mut i = inputs(1_000_000);
        i.refresh_requested = true;
        i.handle_present = false;
        assert_eq!(evaluate(None, &i), Some(RefreshReason::Manual));
    }

    #[test]
    fn no_handle_means_no_refresh() {
        let mut i = inputs(1_000_000);
        i.handle_present = false;
        let p = SessionPolicy {
            idle_timeout: Some("1s".into()),
            ..policy()
        };
        i.last_run_completed_at = Some(0);
        assert_eq!(evaluate(Some(&p), &i), None);
    }

    #[test]
    fn daily_reset_triggers_for_sessions_opened_before_boundary() {
        // now = 2025-06-15T15:06:40Z; boundary 09:00 same day.
        let now: TimestampMs = 1_750_000_000_000;
        let boundary_ms: TimestampMs = 1_749_978_000_000; // 09:00:00Z
        let p = SessionPolicy {
            daily_reset_at: Some("09:00".parse().unwrap()),
            ..policy()
        };

        let mut i = inputs(now);
        i.session_opened_at = Some(boundary_ms - HOUR);
        assert_eq!(evaluate(Some(&p), &i), Some(RefreshReason::DailyReset));

        i.session_opened_at = Some(boundary_ms + HOUR);
        assert_eq!(evaluate(Some(&p), &i), None);
    }

    #[test]
    fn idle_timeout_measured_from_last_run() {
        let now: TimestampMs = 10 * HOUR;
        let p = SessionPolicy {
            idle_timeout: Some("1h30m".into()),
            ..policy()
        };

        let mut i = inputs(now);
        i.session_opened_at = Some(0);
        i.last_run_completed_at = Some(now - HOUR);
        assert_eq!(evaluate(Some(&p), &i), None);

        i.last_run_completed_at = Some(now - 2 * HOUR);
        assert_eq!(evaluate(Some(&p), &i), Some(RefreshReason::IdleTimeout));
    }

    #[test]
    fn idle_timeout_falls_back_to_session_open() {
        let now: TimestampMs = 10 * HOUR;
        let p = SessionPolicy {
            idle_timeout: Some("2s".into()),
            ..policy()
        };
        let mut i = inputs(now);
        i.last_run_completed_at = None;
        i.session_opened_at = Some(now - 3_000);
        assert_eq!(evaluate(Some(&p), &i), Some(RefreshReason::IdleTimeout));
    }

    #[test]
    fn context_length_threshold() {
        let p = SessionPolicy {
            max_context_length: Some(100_000),
            ..policy()
        };
        let mut i = inputs(1_000_000);
        i.last_context_length = Some(99_000);
        assert_eq!(evaluate(Some(&p), &i), None);
        i.last_context_length = Some(100_001);
        assert_eq!(evaluate(Some(&p), &i), Some(RefreshReason::ContextLength));
    }

    #[test]
    fn evaluation_order_daily_reset_first() {
        let now: TimestampMs = 1_750_000_000_000;
        let p = SessionPolicy {
            daily_reset_at: Some("09:00".parse().unwrap()),
            idle_timeout: Some("1s".into()),
            max_context_length: Some(1),
        };
        let mut i = inputs(now);
        i.session_opened_at = Some(0);
        i.last_run_completed_at = Some(0);
        i.last_context_length = Some(100);
        assert_eq!(evaluate(Some(&p), &i), Some(RefreshReason::DailyReset));
    }
}
