//! Cron schedule records. Expression parsing and occurrence math live in the
//! daemon's runtime (`hb-daemon`); this is the persisted shape.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::envelope::EnvelopeContent;
use crate::time::TimestampMs;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronSchedule {
    pub id: Uuid,
    pub agent_name: String,
    /// 5- or 6-field expression, or an `@hourly`-style alias.
    pub cron: String,
    /// IANA timezone; `None` inherits the boss timezone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub enabled: bool,
    pub to: Address,
    /// Content template for materialized envelopes. Reply/quote metadata is
    /// stripped on write.
    pub content: EnvelopeContent,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// The materialized next-occurrence envelope, when one is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_envelope_id: Option<Uuid>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}
