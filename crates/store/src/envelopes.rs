//! Envelope persistence and the scheduler/executor queries.

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use hb_domain::envelope::{meta, Envelope, EnvelopeStatus};
use hb_domain::error::PrefixCandidate;
use hb_domain::time::TimestampMs;
use hb_domain::{Error, Result};

use crate::{storage, Store};

const ENVELOPE_COLS: &str =
    "id, from_addr, to_addr, from_boss, content, deliver_at, status, created_at, metadata";

fn row_to_envelope(row: &Row<'_>) -> rusqlite::Result<Envelope> {
    let id: String = row.get(0)?;
    let from: String = row.get(1)?;
    let to: String = row.get(2)?;
    let content: String = row.get(4)?;
    let status: String = row.get(6)?;
    let metadata: String = row.get(8)?;
    let bad = |idx: usize, v: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unparseable stored value '{v}'").into(),
        )
    };
    Ok(Envelope {
        id: id.parse::<Uuid>().map_err(|_| bad(0, &id))?,
        from: from.parse().map_err(|_| bad(1, &from))?,
        to: to.parse().map_err(|_| bad(2, &to))?,
        from_boss: row.get::<_, i64>(3)? != 0,
        content: serde_json::from_str(&content).map_err(|_| bad(4, &content))?,
        deliver_at: row.get::<_, Option<i64>>(5)?.map(|v| v as TimestampMs),
        status: status.parse().map_err(|_| bad(6, &status))?,
        created_at: row.get::<_, i64>(7)? as TimestampMs,
        metadata: serde_json::from_str(&metadata).map_err(|_| bad(8, &metadata))?,
    })
}

/// Filters for `envelope.list`.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeFilter {
    /// Match the destination address exactly.
    pub to: Option<String>,
    /// Match the origin address exactly.
    pub from: Option<String>,
    pub status: Option<EnvelopeStatus>,
    pub limit: usize,
}

impl Store {
    pub fn insert_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO envelopes ({ENVELOPE_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    envelope.id.to_string(),
                    envelope.from.to_string(),
                    envelope.to.to_string(),
                    envelope.from_boss as i64,
                    serde_json::to_string(&envelope.content)?,
                    envelope.deliver_at.map(|v| v as i64),
                    envelope.status.as_str(),
                    envelope.created_at as i64,
                    serde_json::to_string(&envelope.metadata)?,
                ],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    pub fn get_envelope(&self, id: &Uuid) -> Result<Option<Envelope>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {ENVELOPE_COLS} FROM envelopes WHERE id = ?1"),
                params![id.to_string()],
                row_to_envelope,
            )
            .optional()
            .map_err(storage)
        })
    }

    /// Resolve a short-ID prefix. Zero matches is `not-found`; more than one
    /// is `ambiguous-prefix` carrying every candidate.
    pub fn find_envelope_by_prefix(&self, prefix: &str) -> Result<Envelope> {
        let normalized = hb_domain::id::normalize_prefix(prefix)
            .ok_or_else(|| Error::Validation(format!("'{prefix}' is not a hex id prefix")))?;
        let mut matches = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ENVELOPE_COLS} FROM envelopes \
                     WHERE replace(id, '-', '') LIKE ?1 || '%' ORDER BY created_at"
                ))
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![normalized], row_to_envelope)
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;
            Ok(rows)
        })?;
        match matches.len() {
            0 => Err(Error::NotFound(format!("envelope '{prefix}'"))),
            1 => Ok(matches.remove(0)),
            _ => Err(Error::AmbiguousPrefix {
                prefix: prefix.to_string(),
                candidates: matches
                    .iter()
                    .map(|e| PrefixCandidate {
                        id: e.id,
                        created_at: e.created_at,
                    })
                    .collect(),
            }),
        }
    }

    pub fn list_envelopes(&self, filter: &EnvelopeFilter) -> Result<Vec<Envelope>> {
        let mut sql = format!("SELECT {ENVELOPE_COLS} FROM envelopes WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(to) = &filter.to {
            sql.push_str(&format!(" AND to_addr = ?{}", args.len() + 1));
            args.push(Box::new(to.clone()));
        }
        if let Some(from) = &filter.from {
            sql.push_str(&format!(" AND from_addr = ?{}", args.len() + 1));
            args.push(Box::new(from.clone()));
        }
        if let Some(status) = filter.status {
            sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(Box::new(status.as_str().to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC");
        if filter.limit > 0 {
            sql.push_str(&format!(" LIMIT {}", filter.limit));
        }
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql).map_err(storage)?;
            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
                    row_to_envelope,
                )
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;
            Ok(rows)
        })
    }

    /// Earliest pending envelope with a future `deliver_at`, if any. Drives
    /// the scheduler's single wake timer.
    pub fn next_scheduled_envelope(&self, now: TimestampMs) -> Result<Option<Envelope>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {ENVELOPE_COLS} FROM envelopes \
                     WHERE status = 'pending' AND deliver_at IS NOT NULL AND deliver_at > ?1 \
                     ORDER BY deliver_at LIMIT 1"
                ),
                params![now as i64],
                row_to_envelope,
            )
            .optional()
            .map_err(storage)
        })
    }

    /// Due pending envelopes destined to channels, oldest first.
    pub fn due_channel_envelopes(&self, now: TimestampMs, limit: usize) -> Result<Vec<Envelope>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ENVELOPE_COLS} FROM envelopes \
                     WHERE status = 'pending' AND to_addr LIKE 'channel:%' \
                       AND (deliver_at IS NULL OR deliver_at <= ?1) \
                     ORDER BY created_at LIMIT ?2"
                ))
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![now as i64, limit as i64], row_to_envelope)
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;
            Ok(rows)
        })
    }

    /// Names of agents that currently have due pending envelopes.
    pub fn due_agent_names(&self, now: TimestampMs) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT substr(to_addr, 7) FROM envelopes \
                     WHERE status = 'pending' AND to_addr LIKE 'agent:%' \
                       AND (deliver_at IS NULL OR deliver_at <= ?1)",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![now as i64], |row| row.get::<_, String>(0))
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;
            Ok(rows)
        })
    }

    /// Due pending envelopes for one agent, ordered by
    /// `(min(deliver_at, created_at), created_at)` ascending.
    pub fn pending_envelopes_for_agent(
        &self,
        name: &str,
        now: TimestampMs,
        limit: usize,
    ) -> Result<Vec<Envelope>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ENVELOPE_COLS} FROM envelopes \
                     WHERE status = 'pending' AND to_addr = ?1 \
                       AND (deliver_at IS NULL OR deliver_at <= ?2) \
                     ORDER BY MIN(COALESCE(deliver_at, created_at), created_at), created_at \
                     LIMIT ?3"
                ))
                .map_err(storage)?;
            let rows = stmt
                .query_map(
                    params![format!("agent:{name}"), now as i64, limit as i64],
                    row_to_envelope,
                )
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;
            Ok(rows)
        })
    }

    pub fn count_due_pending_for_agent(&self, name: &str, now: TimestampMs) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM envelopes \
                     WHERE status = 'pending' AND to_addr = ?1 \
                       AND (deliver_at IS NULL OR deliver_at <= ?2)",
                    params![format!("agent:{name}"), now as i64],
                    |row| row.get(0),
                )
                .map_err(storage)?;
            Ok(n.max(0) as u64)
        })
    }

    pub fn count_pending(&self) -> Result<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM envelopes WHERE status = 'pending'",
                    [],
                    |row| row.get(0),
                )
                .map_err(storage)?;
            Ok(n.max(0) as u64)
        })
    }

    /// Find the envelope carrying a platform-native message id within one
    /// channel, used to translate inbound quotes into reply pointers.
    pub fn find_envelope_by_platform_message_id(
        &self,
        channel_addr: &str,
        platform_message_id: &str,
    ) -> Result<Option<Envelope>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {ENVELOPE_COLS} FROM envelopes \
                     WHERE (from_addr = ?1 OR to_addr = ?1) \
                       AND json_extract(metadata, '$.platformMessageId') = ?2 \
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![channel_addr, platform_message_id],
                row_to_envelope,
            )
            .optional()
            .map_err(storage)
        })
    }

    /// Batch transition `pending -> done` in one transaction.
    pub fn mark_envelopes_done(&self, ids: &[Uuid]) -> Result<()> {
        self.with_tx(|tx| {
            for id in ids {
                tx.execute(
                    "UPDATE envelopes SET status = 'done' \
                     WHERE id = ?1 AND status = 'pending'",
                    params![id.to_string()],
                )
                .map_err(storage)?;
            }
            Ok(())
        })
    }

    /// Terminalize the due non-cron pending envelopes of an agent (operator
    /// "clear pending" without a running turn). Returns the cleared count.
    pub fn clear_due_pending_for_agent(&self, name: &str, now: TimestampMs) -> Result<u64> {
        self.with_conn(|conn| {
            let n = conn
                .execute(
                    "UPDATE envelopes SET status = 'done' \
                     WHERE status = 'pending' AND to_addr = ?1 \
                       AND (deliver_at IS NULL OR deliver_at <= ?2) \
                       AND json_extract(metadata, '$.cronScheduleId') IS NULL",
                    params![format!("agent:{name}"), now as i64],
                )
                .map_err(storage)?;
            Ok(n as u64)
        })
    }

    /// Terminalize a channel envelope after a successful delivery, recording
    /// the platform-native message id.
    pub fn complete_channel_delivery(
        &self,
        id: &Uuid,
        platform_message_id: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            match platform_message_id {
                Some(mid) => conn.execute(
                    "UPDATE envelopes SET status = 'done', \
                     metadata = json_set(metadata, '$.platformMessageId', ?2) WHERE id = ?1",
                    params![id.to_string(), mid],
                ),
                None => conn.execute(
                    "UPDATE envelopes SET status = 'done' WHERE id = ?1",
                    params![id.to_string()],
                ),
            }
            .map_err(storage)?;
            Ok(())
        })
    }

    /// Terminalize a channel envelope after a failed delivery, recording the
    /// post-mortem. Delivery failures are terminal (at-most-once).
    pub fn record_delivery_failure(
        &self,
        id: &Uuid,
        at: TimestampMs,
        kind: &str,
        message: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!(
                    "UPDATE envelopes SET status = 'done', metadata = json_set(metadata, \
                     '$.{}', ?2, '$.{}', ?3, '$.{}', ?4) WHERE id = ?1",
                    meta::LAST_DELIVERY_ERROR_AT,
                    meta::LAST_DELIVERY_ERROR_KIND,
                    meta::LAST_DELIVERY_ERROR_MESSAGE,
                ),
                params![id.to_string(), at as i64, kind, message],
            )
            .map_err(storage)?;
            Ok(())
        })
    }
}
