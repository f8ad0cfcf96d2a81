//! `envelope.*` and `reaction.set` handlers.

use serde_json::{json, Value};

use hb_domain::envelope::{
    meta, Attachment, Envelope, EnvelopeContent, EnvelopeStatus,
};
use hb_domain::id::{new_id, short_id};
use hb_domain::time::{now_ms, parse_deliver_at};
use hb_domain::{Address, Error, Result};
use hb_store::EnvelopeFilter;

use crate::rpc::auth::Identity;
use crate::rpc::handlers::{param_str, param_u64, require_str};
use crate::runtime::{bridge, router};
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

fn envelope_view(envelope: &Envelope) -> Value {
    json!({
        "id": envelope.id.to_string(),
        "short-id": short_id(&envelope.id),
        "from": envelope.from.to_string(),
        "to": envelope.to.to_string(),
        "from-boss": envelope.from_boss,
        "text": envelope.content.text,
        "attachments": envelope.content.attachments,
        "deliver-at": envelope.deliver_at,
        "status": envelope.status.as_str(),
        "created-at": envelope.created_at,
        "metadata": envelope.metadata,
    })
}

pub(super) fn parse_attachments(params: &Value) -> Result<Vec<Attachment>> {
    let Some(raw) = params.get("attachments") else {
        return Ok(Vec::new());
    };
    let items = raw
        .as_array()
        .ok_or_else(|| Error::Validation("attachments must be an array".into()))?;
    items
        .iter()
        .map(|item| match item {
            Value::String(source) => Ok(Attachment {
                source: source.clone(),
                filename: None,
                adapter_file_id: None,
            }),
            Value::Object(_) => serde_json::from_value(item.clone())
                .map_err(|e| Error::Validation(format!("bad attachment: {e}"))),
            _ => Err(Error::Validation(
                "attachment must be a source string or an object".into(),
            )),
        })
        .collect()
}

pub(super) async fn send(state: &AppState, identity: &Identity, params: &Value) -> Result<Value> {
    let to: Address = require_str(params, "to")?.parse()?;
    let content = EnvelopeContent {
        text: param_str(params, "text"),
        attachments: parse_attachments(params)?,
    };
    if content.is_empty() {
        return Err(Error::Validation(
            "envelope needs text or attachments".into(),
        ));
    }

    let now = now_ms();
    let deliver_at = match param_str(params, "deliver-at") {
        Some(raw) => Some(parse_deliver_at(&raw, now)?),
        None => None,
    };

    let (from, from_boss) = match identity {
        Identity::Boss => (Address::channel("cli", state.boss_name()), true),
        Identity::Agent(agent) => (Address::agent(&agent.name), false),
    };

    let mut metadata = serde_json::Map::new();
    if let Some(reply_raw) = param_str(params, "reply-to-envelope-id") {
        let replied = state.store.find_envelope_by_prefix(&reply_raw)?;
        metadata.insert(
            meta::REPLY_TO_ENVELOPE_ID.into(),
            json!(replied.id.to_string()),
        );
    }

    let envelope = Envelope {
        id: new_id(),
        from,
        to,
        from_boss,
        content,
        deliver_at,
        status: EnvelopeStatus::Pending,
        created_at: now,
        metadata,
    };
    let id = envelope.id;
    router::submit(state, envelope).await?;

    Ok(json!({
        "envelope-id": id.to_string(),
        "short-id": short_id(&id),
        "deliver-at": deliver_at,
        "status": "pending",
    }))
}

pub(super) fn list(state: &AppState, identity: &Identity, params: &Value) -> Result<Value> {
    let subject = match param_str(params, "agent") {
        Some(name) => {
            if !identity.is_boss() && identity.agent_name() != Some(name.as_str()) {
                return Err(Error::PermissionDenied(
                    "only the boss may list another agent's envelopes".into(),
                ));
            }
            Some(name)
        }
        None => identity.agent_name().map(str::to_string),
    };

    let status = match param_str(params, "status") {
        Some(raw) => Some(raw.parse::<EnvelopeStatus>()?),
        None => None,
    };
    let limit = param_u64(params, "limit")
        .map(|v| (v as usize).min(MAX_LIST_LIMIT))
        .unwrap_or(DEFAULT_LIST_LIMIT);

    let boxed = param_str(params, "box").unwrap_or_else(|| "inbox".to_string());
    let mut filter = EnvelopeFilter {
        status,
        limit,
        ..Default::default()
    };
    if let Some(name) = &subject {
        let addr = Address::agent(name).to_string();
        match boxed.as_str() {
            "inbox" => filter.to = Some(addr),
            "outbox" => filter.from = Some(addr),
            other => {
                return Err(Error::Validation(format!(
                    "box must be 'inbox' or 'outbox', got '{other}'"
                )))
            }
        }
    }

    let envelopes = state.store.list_envelopes(&filter)?;
    Ok(json!({
        "envelopes": envelopes.iter().map(envelope_view).collect::<Vec<_>>(),
        "count": envelopes.len(),
    }))
}

pub(super) fn get(state: &AppState, _identity: &Identity, params: &Value) -> Result<Value> {
    let raw = require_str(params, "id")?;
    let envelope = state.store.find_envelope_by_prefix(&raw)?;
    Ok(envelope_view(&envelope))
}

/// Set an emoji reaction on the channel message an envelope corresponds to.
pub(super) async fn set_reaction(
    state: &AppState,
    identity: &Identity,
    params: &Value,
) -> Result<Value> {
    let raw = require_str(params, "envelope-id")?;
    let emoji = require_str(params, "emoji")?;
    let envelope = state.store.find_envelope_by_prefix(&raw)?;

    // The channel side of the envelope, whichever direction it travelled.
    let channel = match (&envelope.from, &envelope.to) {
        (Address::Channel { adapter_type, chat_id }, _)
        | (_, Address::Channel { adapter_type, chat_id }) => (adapter_type.clone(), chat_id.clone()),
        _ => {
            return Err(Error::Validation(format!(
                "envelope {} has no channel side",
                short_id(&envelope.id)
            )))
        }
    };
    let platform_message_id = envelope
        .meta_str(meta::PLATFORM_MESSAGE_ID)
        .ok_or_else(|| {
            Error::Validation(format!(
                "envelope {} has no platform message id",
                short_id(&envelope.id)
            ))
        })?
        .to_string();

    if let Some(agent_name) = identity.agent_name() {
        if !state.store.agent_has_binding(agent_name, &channel.0)? {
            return Err(Error::PermissionDenied(format!(
                "agent '{agent_name}' has no {} binding",
                channel.0
            )));
        }
    }

    bridge::dispatch_reaction(state, &channel.0, &channel.1, &platform_message_id, &emoji).await?;
    Ok(json!({ "ok": true }))
}
