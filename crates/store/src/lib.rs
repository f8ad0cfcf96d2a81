//! Durable persistence for Hi-Boss: agents, bindings, envelopes, cron
//! schedules, run audit, and key/value config, on SQLite (WAL).
//!
//! The store is the sole owner of on-disk state. One connection behind a
//! mutex serializes all access; every multi-step write runs inside a single
//! transaction, so a crash never leaves state partially updated.

mod agents;
pub mod config;
mod crons;
mod envelopes;
mod runs;
mod schema;

pub use config::keys as config_keys;
pub use envelopes::EnvelopeFilter;

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;

use hb_domain::{Error, Result};

pub struct Store {
    conn: Mutex<Connection>,
}

/// Map a rusqlite failure into the shared storage error kind.
pub(crate) fn storage(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

impl Store {
    /// Open (or create) the database at `path`, validate schema
    /// compatibility, and reconcile stale `running` runs to `failed`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        schema::prepare(&conn)?;
        let store = Store {
            conn: Mutex::new(conn),
        };
        let reconciled = store.reconcile_stale_runs()?;
        if reconciled > 0 {
            tracing::warn!(count = reconciled, "reconciled stale running runs to failed");
        }
        Ok(store)
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(storage)?;
        let out = f(&tx)?;
        tx.commit().map_err(storage)?;
        Ok(out)
    }
}
