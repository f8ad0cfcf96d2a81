//! Agents, their provider/permission attributes, session policy, and adapter
//! bindings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::time::{ClockTime, TimestampMs};

/// The one agent name the daemon reserves for itself.
pub const RESERVED_AGENT_NAME: &str = "background";

/// Reserved agent metadata key: the persisted provider session-resume handle.
/// Owned by the daemon; user metadata writes must preserve it.
pub const META_SESSION_HANDLE: &str = "sessionHandle";

/// Reserved agent metadata key: `speaker` when the agent has at least one
/// adapter binding, else `leader`.
pub const META_ROLE: &str = "role";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Codex,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Codex => "codex",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "claude" => Ok(Provider::Claude),
            "codex" => Ok(Provider::Codex),
            other => Err(Error::Validation(format!(
                "unknown provider '{other}' (expected claude or codex)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    None,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::None => "none",
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
            ReasoningEffort::Xhigh => "xhigh",
        }
    }
}

impl FromStr for ReasoningEffort {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(ReasoningEffort::None),
            "low" => Ok(ReasoningEffort::Low),
            "medium" => Ok(ReasoningEffort::Medium),
            "high" => Ok(ReasoningEffort::High),
            "xhigh" => Ok(ReasoningEffort::Xhigh),
            other => Err(Error::Validation(format!("unknown reasoning effort '{other}'"))),
        }
    }
}

/// Permission levels, totally ordered. The boss token satisfies every level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Restricted,
    Standard,
    Privileged,
    Boss,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Restricted => "restricted",
            PermissionLevel::Standard => "standard",
            PermissionLevel::Privileged => "privileged",
            PermissionLevel::Boss => "boss",
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "restricted" => Ok(PermissionLevel::Restricted),
            "standard" => Ok(PermissionLevel::Standard),
            "privileged" => Ok(PermissionLevel::Privileged),
            "boss" => Ok(PermissionLevel::Boss),
            other => Err(Error::Validation(format!("unknown permission level '{other}'"))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// When to discard the persisted session handle and open a fresh provider
/// session. Fields are evaluated in declaration order; first trigger wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPolicy {
    /// Local clock time; sessions opened before its most recent occurrence
    /// are refreshed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_reset_at: Option<ClockTime>,
    /// Duration string (`1h30m`); refresh when idle longer than this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<String>,
    /// Refresh when the previous run's final context length exceeded this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_length: Option<u64>,
}

impl SessionPolicy {
    pub fn is_empty(&self) -> bool {
        self.daily_reset_at.is_none()
            && self.idle_timeout.is_none()
            && self.max_context_length.is_none()
    }

    /// Validate field formats (duration string syntax).
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = &self.idle_timeout {
            crate::time::parse_duration_ms(t)?;
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent & bindings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Primary key. Case-insensitively unique.
    pub name: String,
    /// Opaque bearer credential, plaintext at rest, case-sensitive.
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    pub provider: Provider,
    /// `None` = provider default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    pub permission_level: PermissionLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_policy: Option<SessionPolicy>,
    pub created_at: TimestampMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<TimestampMs>,
    /// Free-form map. `sessionHandle` and `role` are reserved (see the
    /// `META_*` constants); the store preserves them around user writes.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// When the current provider session was opened. Daemon-owned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_opened_at: Option<TimestampMs>,
    /// Manual refresh queued via `agent.refresh`, applied at the next safe
    /// point.
    #[serde(default)]
    pub refresh_requested: bool,
}

impl Agent {
    pub fn session_handle(&self) -> Option<&str> {
        self.metadata.get(META_SESSION_HANDLE).and_then(|v| v.as_str())
    }
}

/// A persistent association between an agent and one adapter credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentBinding {
    pub id: Uuid,
    pub agent_name: String,
    pub adapter_type: String,
    /// Bot credential for the platform. One credential binds one agent.
    pub adapter_token: String,
    pub created_at: TimestampMs,
}

/// Validate an agent name: `^[A-Za-z0-9]+(?:-[A-Za-z0-9]+)*$`, 1..=64 chars,
/// and not the reserved name.
pub fn validate_agent_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(Error::Validation(format!(
            "agent name must be 1..=64 characters, got {}",
            name.len()
        )));
    }
    if name.eq_ignore_ascii_case(RESERVED_AGENT_NAME) {
        return Err(Error::Validation(format!(
            "agent name '{RESERVED_AGENT_NAME}' is reserved"
        )));
    }
    let ok = name
        .split('-')
        .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric()));
    if !ok {
        return Err(Error::Validation(format!(
            "agent name '{name}' must match [A-Za-z0-9]+(-[A-Za-z0-9]+)*"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_agent_names() {
        for name in ["nex", "Nex-2", "a", "agent-one-two", "X9"] {
            assert!(validate_agent_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn invalid_agent_names() {
        for name in ["", "-nex", "nex-", "ne--x", "n ex", "nex_1", "背景"] {
            assert!(validate_agent_name(name).is_err(), "{name} should be invalid");
        }
        let long = "a".repeat(65);
        assert!(validate_agent_name(&long).is_err());
    }

    #[test]
    fn reserved_name_rejected_case_insensitively() {
        assert!(validate_agent_name("background").is_err());
        assert!(validate_agent_name("Background").is_err());
    }

    #[test]
    fn permission_levels_are_ordered() {
        use PermissionLevel::*;
        assert!(Restricted < Standard);
        assert!(Standard < Privileged);
        assert!(Privileged < Boss);
    }

    #[test]
    fn session_policy_serde_round_trip() {
        let policy = SessionPolicy {
            daily_reset_at: Some("04:00".parse().unwrap()),
            idle_timeout: Some("1h30m".to_string()),
            max_context_length: Some(150_000),
        };
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["dailyResetAt"], "04:00");
        assert_eq!(json["idleTimeout"], "1h30m");
        let back: SessionPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }

    #[test]
    fn session_policy_validates_idle_timeout() {
        let policy = SessionPolicy {
            idle_timeout: Some("90x".into()),
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }
}
