//! Schema creation and compatibility gating.

use rusqlite::Connection;

use hb_domain::{Error, Result};

use crate::storage;

/// Bumped on any incompatible schema change. The store refuses to run
/// against a mismatched on-disk version; operators reset the data directory.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS config (
  key   TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
  name              TEXT PRIMARY KEY COLLATE NOCASE,
  token             TEXT NOT NULL UNIQUE,
  description       TEXT,
  workspace         TEXT,
  provider          TEXT NOT NULL,
  model             TEXT,
  reasoning_effort  TEXT,
  permission_level  TEXT NOT NULL DEFAULT 'standard',
  session_policy    TEXT,
  created_at        INTEGER NOT NULL,
  last_seen_at      INTEGER,
  metadata          TEXT NOT NULL DEFAULT '{}',
  session_opened_at INTEGER,
  refresh_requested INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS agent_bindings (
  id            TEXT PRIMARY KEY,
  agent_name    TEXT NOT NULL COLLATE NOCASE REFERENCES agents(name) ON DELETE CASCADE,
  adapter_type  TEXT NOT NULL,
  adapter_token TEXT NOT NULL,
  created_at    INTEGER NOT NULL,
  UNIQUE (adapter_type, adapter_token),
  UNIQUE (agent_name, adapter_type)
);

CREATE TABLE IF NOT EXISTS envelopes (
  id         TEXT PRIMARY KEY,
  from_addr  TEXT NOT NULL,
  to_addr    TEXT NOT NULL,
  from_boss  INTEGER NOT NULL DEFAULT 0,
  content    TEXT NOT NULL DEFAULT '{}',
  deliver_at INTEGER,
  status     TEXT NOT NULL DEFAULT 'pending',
  created_at INTEGER NOT NULL,
  metadata   TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_envelopes_status_deliver ON envelopes (status, deliver_at);
CREATE INDEX IF NOT EXISTS idx_envelopes_to   ON envelopes (to_addr, status);
CREATE INDEX IF NOT EXISTS idx_envelopes_from ON envelopes (from_addr, status);

CREATE TABLE IF NOT EXISTS cron_schedules (
  id                  TEXT PRIMARY KEY,
  agent_name          TEXT NOT NULL COLLATE NOCASE REFERENCES agents(name) ON DELETE CASCADE,
  cron                TEXT NOT NULL,
  timezone            TEXT,
  enabled             INTEGER NOT NULL DEFAULT 1,
  to_addr             TEXT NOT NULL,
  content             TEXT NOT NULL DEFAULT '{}',
  metadata            TEXT NOT NULL DEFAULT '{}',
  pending_envelope_id TEXT,
  created_at          INTEGER NOT NULL,
  updated_at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_crons_agent ON cron_schedules (agent_name);

CREATE TABLE IF NOT EXISTS agent_runs (
  id             TEXT PRIMARY KEY,
  agent_name     TEXT NOT NULL COLLATE NOCASE,
  started_at     INTEGER NOT NULL,
  completed_at   INTEGER,
  envelope_ids   TEXT NOT NULL DEFAULT '[]',
  final_response TEXT,
  context_length INTEGER,
  status         TEXT NOT NULL,
  error          TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_agent_status  ON agent_runs (agent_name, status);
CREATE INDEX IF NOT EXISTS idx_runs_agent_started ON agent_runs (agent_name, started_at);
"#;

pub(crate) fn prepare(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(storage)?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(storage)?;

    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(storage)?;

    match version {
        0 => {
            conn.execute_batch(SCHEMA).map_err(storage)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(storage)?;
            Ok(())
        }
        v if v == SCHEMA_VERSION => Ok(()),
        v => Err(Error::Storage(format!(
            "incompatible data directory: schema version {v}, this daemon supports \
             {SCHEMA_VERSION}; reset the data directory to continue"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use crate::Store;

    #[test]
    fn open_creates_schema_and_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hiboss.db");
        drop(Store::open(&path).unwrap());
        drop(Store::open(&path).unwrap());
    }

    #[test]
    fn refuses_unknown_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hiboss.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.pragma_update(None, "user_version", 99).unwrap();
        }
        assert!(Store::open(&path).is_err());
    }
}
