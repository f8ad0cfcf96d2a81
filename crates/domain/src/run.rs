//! Agent run audit records: one row per provider turn.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time::TimestampMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(crate::Error::Validation(format!("unknown run status '{other}'"))),
        }
    }
}

/// Error string recorded when startup reconciliation finds a run that was
/// still `running` when the previous daemon died.
pub const ERROR_DAEMON_STOPPED: &str = "daemon-stopped";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRun {
    pub id: Uuid,
    pub agent_name: String,
    pub started_at: TimestampMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<TimestampMs>,
    /// Envelopes processed by this turn, in consumption order.
    #[serde(default)]
    pub envelope_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_response: Option<String>,
    /// Token size of the turn's final model call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u64>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentRun {
    pub fn started(agent_name: impl Into<String>, envelope_ids: Vec<Uuid>, now: TimestampMs) -> Self {
        AgentRun {
            id: crate::id::new_id(),
            agent_name: agent_name.into(),
            started_at: now,
            completed_at: None,
            envelope_ids,
            final_response: None,
            context_length: None,
            status: RunStatus::Running,
            error: None,
        }
    }
}
