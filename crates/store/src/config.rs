//! Key/value config persisted alongside the entity tables.

use rusqlite::{params, OptionalExtension};

use hb_domain::Result;

use crate::{storage, Store};

/// Reserved config keys.
pub mod keys {
    pub const SETUP_COMPLETED: &str = "setup_completed";
    pub const BOSS_TOKEN_HASH: &str = "boss_token_hash";
    pub const BOSS_NAME: &str = "boss_name";
    pub const BOSS_TIMEZONE: &str = "boss_timezone";
    pub const PERMISSION_POLICY: &str = "permission_policy";

    /// Per-platform boss identity: `adapter_boss_id_<type>`.
    pub fn adapter_boss_id(platform: &str) -> String {
        format!("adapter_boss_id_{platform}")
    }
}

impl Store {
    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)
        })
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO config (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    pub fn setup_completed(&self) -> Result<bool> {
        Ok(self
            .get_config(keys::SETUP_COMPLETED)?
            .is_some_and(|v| v == "true"))
    }
}
