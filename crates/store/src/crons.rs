//! Cron schedule persistence. Reply/quote metadata keys are stripped at this
//! layer so scheduled messages never inherit quoting semantics.

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use hb_domain::cron::CronSchedule;
use hb_domain::envelope::meta;
use hb_domain::error::PrefixCandidate;
use hb_domain::time::TimestampMs;
use hb_domain::{Error, Result};

use crate::{storage, Store};

const CRON_COLS: &str = "id, agent_name, cron, timezone, enabled, to_addr, content, \
     metadata, pending_envelope_id, created_at, updated_at";

fn row_to_cron(row: &Row<'_>) -> rusqlite::Result<CronSchedule> {
    let id: String = row.get(0)?;
    let to: String = row.get(5)?;
    let content: String = row.get(6)?;
    let metadata: String = row.get(7)?;
    let pending: Option<String> = row.get(8)?;
    let bad = |idx: usize, v: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unparseable stored value '{v}'").into(),
        )
    };
    Ok(CronSchedule {
        id: id.parse::<Uuid>().map_err(|_| bad(0, &id))?,
        agent_name: row.get(1)?,
        cron: row.get(2)?,
        timezone: row.get(3)?,
        enabled: row.get::<_, i64>(4)? != 0,
        to: to.parse().map_err(|_| bad(5, &to))?,
        content: serde_json::from_str(&content).map_err(|_| bad(6, &content))?,
        metadata: serde_json::from_str(&metadata).map_err(|_| bad(7, &metadata))?,
        pending_envelope_id: match pending {
            Some(p) => Some(p.parse::<Uuid>().map_err(|_| bad(8, &p))?),
            None => None,
        },
        created_at: row.get::<_, i64>(9)? as TimestampMs,
        updated_at: row.get::<_, i64>(10)? as TimestampMs,
    })
}

fn strip_reply_keys(
    metadata: &serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut out = metadata.clone();
    for key in meta::REPLY_KEYS {
        out.remove(*key);
    }
    out
}

impl Store {
    pub fn insert_cron(&self, schedule: &CronSchedule) -> Result<()> {
        let metadata = strip_reply_keys(&schedule.metadata);
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO cron_schedules ({CRON_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
                params![
                    schedule.id.to_string(),
                    schedule.agent_name,
                    schedule.cron,
                    schedule.timezone,
                    schedule.enabled as i64,
                    schedule.to.to_string(),
                    serde_json::to_string(&schedule.content)?,
                    serde_json::to_string(&metadata)?,
                    schedule.pending_envelope_id.map(|v| v.to_string()),
                    schedule.created_at as i64,
                    schedule.updated_at as i64,
                ],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    pub fn get_cron(&self, id: &Uuid) -> Result<Option<CronSchedule>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {CRON_COLS} FROM cron_schedules WHERE id = ?1"),
                params![id.to_string()],
                row_to_cron,
            )
            .optional()
            .map_err(storage)
        })
    }

    pub fn find_cron_by_prefix(&self, prefix: &str) -> Result<CronSchedule> {
        let normalized = hb_domain::id::normalize_prefix(prefix)
            .ok_or_else(|| Error::Validation(format!("'{prefix}' is not a hex id prefix")))?;
        let mut matches = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {CRON_COLS} FROM cron_schedules \
                     WHERE replace(id, '-', '') LIKE ?1 || '%' ORDER BY created_at"
                ))
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![normalized], row_to_cron)
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;
            Ok(rows)
        })?;
        match matches.len() {
            0 => Err(Error::NotFound(format!("cron schedule '{prefix}'"))),
            1 => Ok(matches.remove(0)),
            _ => Err(Error::AmbiguousPrefix {
                prefix: prefix.to_string(),
                candidates: matches
                    .iter()
                    .map(|s| PrefixCandidate {
                        id: s.id,
                        created_at: s.created_at,
                    })
                    .collect(),
            }),
        }
    }

    /// All schedules, or one agent's, in creation order (the materializer
    /// tie-break).
    pub fn list_crons(&self, agent_name: Option<&str>) -> Result<Vec<CronSchedule>> {
        self.with_conn(|conn| {
            let rows = match agent_name {
                Some(name) => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "SELECT {CRON_COLS} FROM cron_schedules \
                             WHERE agent_name = ?1 ORDER BY created_at"
                        ))
                        .map_err(storage)?;
                    let rows = stmt
                        .query_map(params![name], row_to_cron)
                        .map_err(storage)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                        .map_err(storage)?;
                    rows
                }
                None => {
                    let mut stmt = conn
                        .prepare(&format!(
                            "SELECT {CRON_COLS} FROM cron_schedules ORDER BY created_at"
                        ))
                        .map_err(storage)?;
                    let rows = stmt
                        .query_map([], row_to_cron)
                        .map_err(storage)?
                        .collect::<rusqlite::Result<Vec<_>>>()
                        .map_err(storage)?;
                    rows
                }
            };
            Ok(rows)
        })
    }

    pub fn list_enabled_crons(&self) -> Result<Vec<CronSchedule>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {CRON_COLS} FROM cron_schedules WHERE enabled = 1 ORDER BY created_at"
                ))
                .map_err(storage)?;
            let rows = stmt
                .query_map([], row_to_cron)
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;
            Ok(rows)
        })
    }

    /// Enable or disable a schedule. Disabling terminalizes the materialized
    /// pending envelope (if any) and clears the pointer, in one transaction.
    pub fn set_cron_enabled(&self, id: &Uuid, enabled: bool, now: TimestampMs) -> Result<()> {
        self.with_tx(|tx| {
            let pending: Option<String> = tx
                .query_row(
                    "SELECT pending_envelope_id FROM cron_schedules WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage)?
                .ok_or_else(|| Error::NotFound(format!("cron schedule '{id}'")))?;

            tx.execute(
                "UPDATE cron_schedules SET enabled = ?2, updated_at = ?3, \
                 pending_envelope_id = CASE WHEN ?2 = 0 THEN NULL ELSE pending_envelope_id END \
                 WHERE id = ?1",
                params![id.to_string(), enabled as i64, now as i64],
            )
            .map_err(storage)?;

            if !enabled {
                if let Some(pending_id) = pending {
                    tx.execute(
                        "UPDATE envelopes SET status = 'done' \
                         WHERE id = ?1 AND status = 'pending'",
                        params![pending_id],
                    )
                    .map_err(storage)?;
                }
            }
            Ok(())
        })
    }

    /// Point the schedule at its freshly materialized envelope (or clear it).
    pub fn set_cron_pending_envelope(
        &self,
        id: &Uuid,
        envelope_id: Option<&Uuid>,
        now: TimestampMs,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let n = conn
                .execute(
                    "UPDATE cron_schedules SET pending_envelope_id = ?2, updated_at = ?3 \
                     WHERE id = ?1",
                    params![
                        id.to_string(),
                        envelope_id.map(|v| v.to_string()),
                        now as i64
                    ],
                )
                .map_err(storage)?;
            if n == 0 {
                return Err(Error::NotFound(format!("cron schedule '{id}'")));
            }
            Ok(())
        })
    }

    /// Insert a freshly materialized envelope and point the schedule at it,
    /// in one transaction.
    pub fn materialize_cron_envelope(
        &self,
        schedule_id: &Uuid,
        envelope: &hb_domain::envelope::Envelope,
        now: TimestampMs,
    ) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO envelopes (id, from_addr, to_addr, from_boss, content, \
                 deliver_at, status, created_at, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
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
            let n = tx
                .execute(
                    "UPDATE cron_schedules SET pending_envelope_id = ?2, updated_at = ?3 \
                     WHERE id = ?1",
                    params![schedule_id.to_string(), envelope.id.to_string(), now as i64],
                )
                .map_err(storage)?;
            if n == 0 {
                return Err(Error::NotFound(format!("cron schedule '{schedule_id}'")));
            }
            Ok(())
        })
    }

    /// Delete a schedule; its materialized pending envelope is terminalized
    /// in the same transaction.
    pub fn delete_cron(&self, id: &Uuid) -> Result<bool> {
        self.with_tx(|tx| {
            let pending: Option<Option<String>> = tx
                .query_row(
                    "SELECT pending_envelope_id FROM cron_schedules WHERE id = ?1",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage)?;
            let Some(pending) = pending else {
                return Ok(false);
            };
            if let Some(pending_id) = pending {
                tx.execute(
                    "UPDATE envelopes SET status = 'done' WHERE id = ?1 AND status = 'pending'",
                    params![pending_id],
                )
                .map_err(storage)?;
            }
            tx.execute(
                "DELETE FROM cron_schedules WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(storage)?;
            Ok(true)
        })
    }
}
