//! Envelopes: the durable, addressed message record.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;
use crate::time::TimestampMs;

/// Reserved envelope metadata keys.
pub mod meta {
    /// The schedule that materialized this envelope.
    pub const CRON_SCHEDULE_ID: &str = "cronScheduleId";
    /// Reply/quote pointer to an earlier envelope.
    pub const REPLY_TO_ENVELOPE_ID: &str = "replyToEnvelopeId";
    /// Platform-native message id assigned on channel delivery or receipt.
    pub const PLATFORM_MESSAGE_ID: &str = "platformMessageId";
    pub const SENDER_ID: &str = "senderId";
    pub const SENDER_USERNAME: &str = "senderUsername";
    pub const SENDER_DISPLAY_NAME: &str = "senderDisplayName";
    pub const LAST_DELIVERY_ERROR_AT: &str = "lastDeliveryErrorAt";
    pub const LAST_DELIVERY_ERROR_KIND: &str = "lastDeliveryErrorKind";
    pub const LAST_DELIVERY_ERROR_MESSAGE: &str = "lastDeliveryErrorMessage";

    /// Keys stripped from cron content templates so scheduled messages never
    /// inherit quoting semantics.
    pub const REPLY_KEYS: &[&str] = &[REPLY_TO_ENVELOPE_ID, PLATFORM_MESSAGE_ID];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Pending,
    /// Terminal. No envelope ever leaves `done`.
    Done,
}

impl EnvelopeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeStatus::Pending => "pending",
            EnvelopeStatus::Done => "done",
        }
    }
}

impl std::str::FromStr for EnvelopeStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(EnvelopeStatus::Pending),
            "done" => Ok(EnvelopeStatus::Done),
            other => Err(crate::Error::Validation(format!(
                "unknown envelope status '{other}'"
            ))),
        }
    }
}

/// A file carried by an envelope. `source` is a filesystem path, a URL, or an
/// opaque adapter file id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_file_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl EnvelopeContent {
    pub fn text(text: impl Into<String>) -> Self {
        EnvelopeContent {
            text: Some(text.into()),
            attachments: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(str::is_empty) && self.attachments.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: Uuid,
    pub from: Address,
    pub to: Address,
    #[serde(default)]
    pub from_boss: bool,
    pub content: EnvelopeContent,
    /// Not-before delivery lower bound; never a deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_at: Option<TimestampMs>,
    pub status: EnvelopeStatus,
    pub created_at: TimestampMs,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Envelope {
    /// Delivery-eligibility sort key: `min(deliver_at, created_at)`.
    pub fn order_key(&self) -> TimestampMs {
        match self.deliver_at {
            Some(d) => d.min(self.created_at),
            None => self.created_at,
        }
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn reply_to(&self) -> Option<Uuid> {
        self.meta_str(meta::REPLY_TO_ENVELOPE_ID)
            .and_then(|s| s.parse().ok())
    }

    pub fn cron_schedule_id(&self) -> Option<Uuid> {
        self.meta_str(meta::CRON_SCHEDULE_ID)
            .and_then(|s| s.parse().ok())
    }
}
