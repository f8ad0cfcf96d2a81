//! Agent-facing turn input rendering.
//!
//! The format is plain text with stable kebab-case keys: a header block
//! (`now:`, `pending-envelopes:`), then one block per envelope. Consecutive
//! group-chat envelopes sharing the same `from:` collapse into a single
//! block with one `message:` line each.

use chrono_tz::Tz;
use uuid::Uuid;

use hb_domain::envelope::{meta, Envelope};
use hb_domain::id::short_id;
use hb_domain::time::{to_local_iso, TimestampMs};
use hb_domain::Address;

/// Looks up quoted text for a reply pointer. Returns the replied-to
/// envelope's text when known.
pub type QuoteLookup<'a> = &'a dyn Fn(&Uuid) -> Option<String>;

fn sender_label(envelope: &Envelope) -> Option<String> {
    let name = envelope
        .meta_str(meta::SENDER_DISPLAY_NAME)
        .or_else(|| envelope.meta_str(meta::SENDER_USERNAME))
        .or_else(|| envelope.meta_str(meta::SENDER_ID))?;
    Some(if envelope.from_boss {
        format!("{name} [boss]")
    } else {
        name.to_string()
    })
}

/// A groupable envelope carries nothing but text from a channel: no
/// schedule fields, no reply pointer, no attachments.
fn groupable(envelope: &Envelope) -> bool {
    matches!(envelope.from, Address::Channel { .. })
        && envelope.deliver_at.is_none()
        && envelope.cron_schedule_id().is_none()
        && envelope.reply_to().is_none()
        && envelope.content.attachments.is_empty()
}

fn push_single_block(out: &mut String, envelope: &Envelope, tz: Tz, quotes: QuoteLookup<'_>) {
    out.push_str(&format!("envelope-id: {}\n", short_id(&envelope.id)));
    out.push_str(&format!("from: {}\n", envelope.from));
    out.push_str(&format!("to: {}\n", envelope.to));
    if let Some(sender) = sender_label(envelope) {
        out.push_str(&format!("sender: {sender}\n"));
    }
    out.push_str(&format!(
        "created-at: {}\n",
        to_local_iso(envelope.created_at, tz)
    ));
    if let Some(deliver_at) = envelope.deliver_at {
        out.push_str(&format!("deliver-at: {}\n", to_local_iso(deliver_at, tz)));
    }
    if let Some(cron_id) = envelope.cron_schedule_id() {
        out.push_str(&format!("cron-id: {}\n", short_id(&cron_id)));
    }
    if let Some(reply_to) = envelope.reply_to() {
        out.push_str(&format!("in-reply-to: {}\n", short_id(&reply_to)));
        if let Some(quoted) = quotes(&reply_to) {
            out.push_str(&format!("quoted: {}\n", quoted.replace('\n', " ")));
        }
    }
    if let Some(text) = envelope.content.text.as_deref() {
        out.push_str(&format!("message: {text}\n"));
    }
    if !envelope.content.attachments.is_empty() {
        let sources: Vec<&str> = envelope
            .content
            .attachments
            .iter()
            .map(|a| a.source.as_str())
            .collect();
        out.push_str(&format!("attachments: {}\n", sources.join(", ")));
    }
}

fn push_group_block(out: &mut String, group: &[&Envelope], tz: Tz) {
    let first = group[0];
    out.push_str(&format!("from: {}\n", first.from));
    out.push_str(&format!("to: {}\n", first.to));
    out.push_str(&format!(
        "created-at: {}\n",
        to_local_iso(first.created_at, tz)
    ));
    for envelope in group {
        let text = envelope.content.text.as_deref().unwrap_or("");
        match sender_label(envelope) {
            Some(sender) => out.push_str(&format!("message: {sender}: {text}\n")),
            None => out.push_str(&format!("message: {text}\n")),
        }
    }
}

/// Render the full turn input for a batch of envelopes.
pub fn render(
    envelopes: &[Envelope],
    now: TimestampMs,
    tz: Tz,
    quotes: QuoteLookup<'_>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("now: {}\n", to_local_iso(now, tz)));
    out.push_str(&format!("pending-envelopes: {}\n", envelopes.len()));

    let mut i = 0;
    while i < envelopes.len() {
        out.push('\n');
        let envelope = &envelopes[i];
        if groupable(envelope) {
            // Extend the group with consecutive groupable same-`from`.
            let mut group: Vec<&Envelope> = vec![envelope];
            let mut j = i + 1;
            while j < envelopes.len()
                && groupable(&envelopes[j])
                && envelopes[j].from == envelope.from
            {
                group.push(&envelopes[j]);
                j += 1;
            }
            if group.len() > 1 {
                push_group_block(&mut out, &group, tz);
                i = j;
                continue;
            }
        }
        push_single_block(&mut out, envelope, tz, quotes);
        i += 1;
    }
    out
}
