//! Envelope addresses: `agent:<name>` or `channel:<adapter-type>:<chat-id>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Destination or origin of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// A named agent's input queue.
    Agent(String),
    /// A chat on an adapter platform.
    Channel {
        adapter_type: String,
        chat_id: String,
    },
}

impl Address {
    pub fn agent(name: impl Into<String>) -> Self {
        Address::Agent(name.into())
    }

    pub fn channel(adapter_type: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Address::Channel {
            adapter_type: adapter_type.into(),
            chat_id: chat_id.into(),
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, Address::Agent(_))
    }

    pub fn agent_name(&self) -> Option<&str> {
        match self {
            Address::Agent(name) => Some(name),
            Address::Channel { .. } => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Agent(name) => write!(f, "agent:{name}"),
            Address::Channel {
                adapter_type,
                chat_id,
            } => write!(f, "channel:{adapter_type}:{chat_id}"),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(name) = s.strip_prefix("agent:") {
            if name.is_empty() {
                return Err(Error::Validation("empty agent name in address".into()));
            }
            return Ok(Address::Agent(name.to_string()));
        }
        if let Some(rest) = s.strip_prefix("channel:") {
            // Chat IDs may themselves contain ':' on some platforms, so only
            // the first separator splits adapter type from chat id.
            let (adapter_type, chat_id) = rest
                .split_once(':')
                .ok_or_else(|| Error::Validation(format!("malformed channel address '{s}'")))?;
            if adapter_type.is_empty() || chat_id.is_empty() {
                return Err(Error::Validation(format!("malformed channel address '{s}'")));
            }
            return Ok(Address::Channel {
                adapter_type: adapter_type.to_string(),
                chat_id: chat_id.to_string(),
            });
        }
        Err(Error::Validation(format!(
            "address '{s}' must be 'agent:<name>' or 'channel:<adapter-type>:<chat-id>'"
        )))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
        ser.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(de)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
