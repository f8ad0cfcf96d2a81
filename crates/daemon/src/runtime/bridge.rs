//! Adapter bridge: the seam between channel platforms and the envelope
//! world.
//!
//! Adapter protocol implementations live outside the daemon; they register
//! here through the [`ChannelAdapter`] trait. The bridge translates inbound
//! platform messages into agent-destined envelopes and outbound envelopes
//! into adapter calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use hb_domain::envelope::{meta, Attachment, Envelope, EnvelopeContent, EnvelopeStatus};
use hb_domain::id::new_id;
use hb_domain::time::now_ms;
use hb_domain::{Address, Error, Result};

use crate::state::AppState;

/// Per-call ceiling on adapter operations.
const ADAPTER_CALL_TIMEOUT: Duration = Duration::from_secs(15);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
    pub parse_mode: Option<String>,
    /// Platform-native message id to quote.
    pub reply_to_channel_message_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InboundAuthor {
    pub id: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub chat_id: String,
    pub author: InboundAuthor,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
    /// Platform-native id of the quoted message, when the user replied.
    pub in_reply_to: Option<String>,
    pub platform_message_id: String,
}

/// Slash-command style out-of-band instruction from a channel.
#[derive(Debug, Clone)]
pub struct InboundCommand {
    pub chat_id: String,
    pub author: InboundAuthor,
    pub command: String,
    pub args: Vec<String>,
}

/// The contract a channel adapter implementation fulfils.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn platform(&self) -> &str;

    /// The bot credential this adapter connection authenticates with; the
    /// bridge uses it to resolve the owning binding.
    fn adapter_token(&self) -> &str;

    /// Send a message; returns the platform-native message id.
    async fn send_message(&self, chat_id: &str, message: &OutboundMessage) -> Result<String>;

    async fn set_reaction(
        &self,
        chat_id: &str,
        channel_message_id: &str,
        emoji: &str,
    ) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bridge
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registry of live adapter connections, keyed by `(platform, token)`.
#[derive(Default)]
pub struct Bridge {
    adapters: RwLock<HashMap<(String, String), Arc<dyn ChannelAdapter>>>,
}

impl Bridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, adapter: Arc<dyn ChannelAdapter>) {
        let key = (
            adapter.platform().to_string(),
            adapter.adapter_token().to_string(),
        );
        tracing::info!(platform = %key.0, "adapter registered");
        self.adapters.write().insert(key, adapter);
    }

    pub fn unregister(&self, platform: &str, adapter_token: &str) {
        self.adapters
            .write()
            .remove(&(platform.to_string(), adapter_token.to_string()));
    }

    pub fn active_platforms(&self) -> Vec<String> {
        let mut platforms: Vec<String> = self
            .adapters
            .read()
            .keys()
            .map(|(p, _)| p.clone())
            .collect();
        platforms.sort();
        platforms.dedup();
        platforms
    }

    fn adapter_for(
        &self,
        platform: &str,
        adapter_token: Option<&str>,
    ) -> Option<Arc<dyn ChannelAdapter>> {
        let adapters = self.adapters.read();
        match adapter_token {
            Some(token) => adapters
                .get(&(platform.to_string(), token.to_string()))
                .cloned(),
            // No specific credential: any live connection on the platform.
            None => adapters
                .iter()
                .find(|((p, _), _)| p == platform)
                .map(|(_, a)| a.clone()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dispatch an envelope to its destination channel. Returns the
/// platform-native message id on success.
pub async fn dispatch_outbound(state: &AppState, envelope: &Envelope) -> Result<Option<String>> {
    let Address::Channel {
        adapter_type,
        chat_id,
    } = &envelope.to
    else {
        return Err(Error::Internal(format!(
            "envelope {} is not channel-destined",
            envelope.id
        )));
    };

    // When the sender is an agent, deliver through that agent's own
    // credential so the message appears from the right bot identity.
    let sender_token = match envelope.from.agent_name() {
        Some(name) => state
            .store
            .list_bindings(Some(name))?
            .into_iter()
            .find(|b| &b.adapter_type == adapter_type)
            .map(|b| b.adapter_token),
        None => None,
    };

    let adapter = state
        .bridge
        .adapter_for(adapter_type, sender_token.as_deref())
        .ok_or_else(|| Error::Adapter {
            platform: adapter_type.clone(),
            message: "no live adapter connection".into(),
            detail: None,
        })?;

    // Translate the reply pointer into a native quote when the referenced
    // envelope carries a platform message id in this channel.
    let reply_to_channel_message_id = envelope.reply_to().and_then(|reply_id| {
        state
            .store
            .get_envelope(&reply_id)
            .ok()
            .flatten()
            .and_then(|replied| {
                replied
                    .meta_str(meta::PLATFORM_MESSAGE_ID)
                    .map(str::to_string)
            })
    });

    let message = OutboundMessage {
        text: envelope.content.text.clone(),
        attachments: envelope.content.attachments.clone(),
        parse_mode: None,
        reply_to_channel_message_id,
    };

    let sent = tokio::time::timeout(
        ADAPTER_CALL_TIMEOUT,
        adapter.send_message(chat_id, &message),
    )
    .await
    .map_err(|_| Error::Adapter {
        platform: adapter_type.clone(),
        message: format!("send timed out after {}s", ADAPTER_CALL_TIMEOUT.as_secs()),
        detail: None,
    })??;

    Ok(Some(sent))
}

/// Set a reaction on a delivered channel message.
pub async fn dispatch_reaction(
    state: &AppState,
    platform: &str,
    chat_id: &str,
    channel_message_id: &str,
    emoji: &str,
) -> Result<()> {
    let adapter = state
        .bridge
        .adapter_for(platform, None)
        .ok_or_else(|| Error::Adapter {
            platform: platform.to_string(),
            message: "no live adapter connection".into(),
            detail: None,
        })?;
    tokio::time::timeout(
        ADAPTER_CALL_TIMEOUT,
        adapter.set_reaction(chat_id, channel_message_id, emoji),
    )
    .await
    .map_err(|_| Error::Adapter {
        platform: platform.to_string(),
        message: format!(
            "reaction timed out after {}s",
            ADAPTER_CALL_TIMEOUT.as_secs()
        ),
        detail: None,
    })?
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Handle an inbound platform message: resolve the binding, stamp boss
/// identity, translate quotes, and route an envelope to the bound agent.
///
/// Messages on unbound credentials are dropped; the boss gets a one-line
/// warning on that platform when reachable.
pub async fn handle_inbound(
    state: &AppState,
    platform: &str,
    adapter_token: &str,
    inbound: InboundMessage,
) -> Result<()> {
    let Some(binding) = state.store.find_binding(platform, adapter_token)? else {
        tracing::warn!(platform, chat_id = %inbound.chat_id, "message on unbound adapter credential, dropping");
        warn_boss_unbound(state, platform, adapter_token).await;
        return Ok(());
    };

    let boss_id = state
        .store
        .get_config(&hb_store::config_keys::adapter_boss_id(platform))?;
    let from_boss = boss_id
        .as_deref()
        .is_some_and(|id| id.eq_ignore_ascii_case(&inbound.author.id));

    let channel = Address::channel(platform, inbound.chat_id.clone());

    let mut metadata = serde_json::Map::new();
    metadata.insert(
        meta::PLATFORM_MESSAGE_ID.into(),
        serde_json::json!(inbound.platform_message_id),
    );
    metadata.insert(meta::SENDER_ID.into(), serde_json::json!(inbound.author.id));
    if let Some(username) = &inbound.author.username {
        metadata.insert(meta::SENDER_USERNAME.into(), serde_json::json!(username));
    }
    if let Some(display) = &inbound.author.display_name {
        metadata.insert(meta::SENDER_DISPLAY_NAME.into(), serde_json::json!(display));
    }
    if let Some(quoted_mid) = &inbound.in_reply_to {
        if let Some(replied) = state
            .store
            .find_envelope_by_platform_message_id(&channel.to_string(), quoted_mid)?
        {
            metadata.insert(
                meta::REPLY_TO_ENVELOPE_ID.into(),
                serde_json::json!(replied.id.to_string()),
            );
        }
    }

    let envelope = Envelope {
        id: new_id(),
        from: channel,
        to: Address::agent(&binding.agent_name),
        from_boss,
        content: EnvelopeContent {
            text: inbound.text,
            attachments: inbound.attachments,
        },
        deliver_at: None,
        status: EnvelopeStatus::Pending,
        created_at: now_ms(),
        metadata,
    };

    super::router::submit(state, envelope).await
}

/// Out-of-band adapter commands. `/refresh` queues a manual session refresh
/// for the bound agent; anything else is logged and dropped.
pub async fn handle_inbound_command(
    state: &AppState,
    platform: &str,
    adapter_token: &str,
    command: InboundCommand,
) -> Result<()> {
    let Some(binding) = state.store.find_binding(platform, adapter_token)? else {
        tracing::warn!(platform, command = %command.command, "command on unbound adapter credential, dropping");
        return Ok(());
    };
    match command.command.as_str() {
        "refresh" => {
            state.store.set_refresh_requested(&binding.agent_name, true)?;
            tracing::info!(agent = %binding.agent_name, "manual session refresh queued");
            Ok(())
        }
        other => {
            tracing::debug!(platform, command = other, "unhandled adapter command");
            Ok(())
        }
    }
}

async fn warn_boss_unbound(state: &AppState, platform: &str, adapter_token: &str) {
    let Ok(Some(boss_id)) = state
        .store
        .get_config(&hb_store::config_keys::adapter_boss_id(platform))
    else {
        return;
    };
    let Some(adapter) = state.bridge.adapter_for(platform, Some(adapter_token)) else {
        return;
    };
    let warning = OutboundMessage {
        text: Some(format!(
            "unbound-adapter: a message arrived on a {platform} credential with no agent binding"
        )),
        ..Default::default()
    };
    if let Err(e) = tokio::time::timeout(
        ADAPTER_CALL_TIMEOUT,
        adapter.send_message(&boss_id, &warning),
    )
    .await
    .unwrap_or_else(|_| Err(Error::Internal("warning send timed out".into())))
    {
        tracing::debug!(platform, error = %e, "failed to warn boss about unbound adapter");
    }
}

