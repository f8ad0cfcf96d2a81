//! Agent and binding persistence, including the reserved-metadata surgery
//! (`sessionHandle`, `role`) that user writes must never disturb.

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use hb_domain::agent::{Agent, AgentBinding, META_ROLE, META_SESSION_HANDLE};
use hb_domain::time::TimestampMs;
use hb_domain::{Error, Result};

use crate::{storage, Store};

const AGENT_COLS: &str = "name, token, description, workspace, provider, model, \
     reasoning_effort, permission_level, session_policy, created_at, last_seen_at, \
     metadata, session_opened_at, refresh_requested";

fn row_to_agent(row: &Row<'_>) -> rusqlite::Result<Agent> {
    let provider: String = row.get(4)?;
    let reasoning: Option<String> = row.get(6)?;
    let level: String = row.get(7)?;
    let policy: Option<String> = row.get(8)?;
    let metadata: String = row.get(11)?;
    Ok(Agent {
        name: row.get(0)?,
        token: row.get(1)?,
        description: row.get(2)?,
        workspace: row.get(3)?,
        provider: provider.parse().map_err(|_| bad_column(4, &provider))?,
        model: row.get(5)?,
        reasoning_effort: match reasoning {
            Some(r) => Some(r.parse().map_err(|_| bad_column(6, &r))?),
            None => None,
        },
        permission_level: level.parse().map_err(|_| bad_column(7, &level))?,
        session_policy: match policy {
            Some(p) => serde_json::from_str(&p).map_err(|_| bad_column(8, &p))?,
            None => None,
        },
        created_at: row.get::<_, i64>(9)? as TimestampMs,
        last_seen_at: row.get::<_, Option<i64>>(10)?.map(|v| v as TimestampMs),
        metadata: serde_json::from_str(&metadata).map_err(|_| bad_column(11, &metadata))?,
        session_opened_at: row.get::<_, Option<i64>>(12)?.map(|v| v as TimestampMs),
        refresh_requested: row.get::<_, i64>(13)? != 0,
    })
}

fn bad_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unparseable stored value '{value}'").into(),
    )
}

/// Map a unique-constraint failure to `conflict`, anything else to `storage`.
fn conflict_or_storage(e: rusqlite::Error, what: &str) -> Error {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::Conflict(what.to_string());
        }
    }
    storage(e)
}

impl Store {
    pub fn create_agent(&self, agent: &Agent) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO agents ({AGENT_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
                params![
                    agent.name,
                    agent.token,
                    agent.description,
                    agent.workspace,
                    agent.provider.as_str(),
                    agent.model,
                    agent.reasoning_effort.map(|r| r.as_str()),
                    agent.permission_level.as_str(),
                    agent
                        .session_policy
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    agent.created_at as i64,
                    agent.last_seen_at.map(|v| v as i64),
                    serde_json::to_string(&agent.metadata)?,
                    agent.session_opened_at.map(|v| v as i64),
                    agent.refresh_requested as i64,
                ],
            )
            .map_err(|e| conflict_or_storage(e, &format!("agent '{}' already exists", agent.name)))?;
            Ok(())
        })
    }

    pub fn get_agent(&self, name: &str) -> Result<Option<Agent>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {AGENT_COLS} FROM agents WHERE name = ?1"),
                params![name],
                row_to_agent,
            )
            .optional()
            .map_err(storage)
        })
    }

    /// Token lookup is case-sensitive (BINARY collation on the column).
    pub fn get_agent_by_token(&self, token: &str) -> Result<Option<Agent>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {AGENT_COLS} FROM agents WHERE token = ?1"),
                params![token],
                row_to_agent,
            )
            .optional()
            .map_err(storage)
        })
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {AGENT_COLS} FROM agents ORDER BY created_at"))
                .map_err(storage)?;
            let rows = stmt
                .query_map([], row_to_agent)
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;
            Ok(rows)
        })
    }

    /// Update the mutable agent attributes. Name, token, metadata and the
    /// daemon-owned session columns are not touched here.
    pub fn update_agent(&self, agent: &Agent) -> Result<()> {
        self.with_conn(|conn| {
            let n = conn
                .execute(
                    "UPDATE agents SET description = ?2, workspace = ?3, provider = ?4, \
                     model = ?5, reasoning_effort = ?6, permission_level = ?7, \
                     session_policy = ?8 WHERE name = ?1",
                    params![
                        agent.name,
                        agent.description,
                        agent.workspace,
                        agent.provider.as_str(),
                        agent.model,
                        agent.reasoning_effort.map(|r| r.as_str()),
                        agent.permission_level.as_str(),
                        agent
                            .session_policy
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()?,
                    ],
                )
                .map_err(storage)?;
            if n == 0 {
                return Err(Error::NotFound(format!("agent '{}'", agent.name)));
            }
            Ok(())
        })
    }

    /// Replace user metadata while preserving the reserved keys
    /// (`sessionHandle`, `role`) whatever the caller sent.
    pub fn replace_agent_metadata(
        &self,
        name: &str,
        metadata: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<()> {
        self.with_tx(|tx| {
            let current: Option<String> = tx
                .query_row(
                    "SELECT metadata FROM agents WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage)?;
            let current = current.ok_or_else(|| Error::NotFound(format!("agent '{name}'")))?;
            let current: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&current)?;

            let mut next = metadata.cloned().unwrap_or_default();
            for key in [META_SESSION_HANDLE, META_ROLE] {
                next.remove(key);
                if let Some(v) = current.get(key) {
                    next.insert(key.to_string(), v.clone());
                }
            }
            tx.execute(
                "UPDATE agents SET metadata = ?2 WHERE name = ?1",
                params![name, serde_json::to_string(&next)?],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    /// Surgical update of `metadata.sessionHandle`; user keys are untouched.
    pub fn set_session_handle(&self, name: &str, handle: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            let n = match handle {
                Some(h) => conn.execute(
                    "UPDATE agents SET metadata = json_set(metadata, '$.sessionHandle', ?2) \
                     WHERE name = ?1",
                    params![name, h],
                ),
                None => conn.execute(
                    "UPDATE agents SET metadata = json_remove(metadata, '$.sessionHandle') \
                     WHERE name = ?1",
                    params![name],
                ),
            }
            .map_err(storage)?;
            if n == 0 {
                return Err(Error::NotFound(format!("agent '{name}'")));
            }
            Ok(())
        })
    }

    pub fn set_session_opened_at(&self, name: &str, at: Option<TimestampMs>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE agents SET session_opened_at = ?2 WHERE name = ?1",
                params![name, at.map(|v| v as i64)],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    pub fn set_refresh_requested(&self, name: &str, requested: bool) -> Result<()> {
        self.with_conn(|conn| {
            let n = conn
                .execute(
                    "UPDATE agents SET refresh_requested = ?2 WHERE name = ?1",
                    params![name, requested as i64],
                )
                .map_err(storage)?;
            if n == 0 {
                return Err(Error::NotFound(format!("agent '{name}'")));
            }
            Ok(())
        })
    }

    pub fn set_agent_last_seen(&self, name: &str, at: TimestampMs) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE agents SET last_seen_at = ?2 WHERE name = ?1",
                params![name, at as i64],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    /// Delete an agent; bindings and cron schedules cascade.
    pub fn delete_agent(&self, name: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn
                .execute("DELETE FROM agents WHERE name = ?1", params![name])
                .map_err(storage)?;
            Ok(n > 0)
        })
    }

    // ── Bindings ──────────────────────────────────────────────────────

    /// Insert a binding and flip the agent's `role` metadata to `speaker`,
    /// in one transaction.
    pub fn create_binding(&self, binding: &AgentBinding) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO agent_bindings (id, agent_name, adapter_type, adapter_token, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    binding.id.to_string(),
                    binding.agent_name,
                    binding.adapter_type,
                    binding.adapter_token,
                    binding.created_at as i64,
                ],
            )
            .map_err(|e| {
                conflict_or_storage(
                    e,
                    &format!(
                        "adapter credential already bound or agent '{}' already has a '{}' binding",
                        binding.agent_name, binding.adapter_type
                    ),
                )
            })?;
            set_role(tx, &binding.agent_name, "speaker")?;
            Ok(())
        })
    }

    /// Remove a binding; the agent's `role` falls back to `leader` when no
    /// bindings remain.
    pub fn delete_binding(&self, agent_name: &str, adapter_type: &str) -> Result<bool> {
        self.with_tx(|tx| {
            let n = tx
                .execute(
                    "DELETE FROM agent_bindings WHERE agent_name = ?1 AND adapter_type = ?2",
                    params![agent_name, adapter_type],
                )
                .map_err(storage)?;
            if n == 0 {
                return Ok(false);
            }
            let remaining: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM agent_bindings WHERE agent_name = ?1",
                    params![agent_name],
                    |row| row.get(0),
                )
                .map_err(storage)?;
            if remaining == 0 {
                set_role(tx, agent_name, "leader")?;
            }
            Ok(true)
        })
    }

    pub fn list_bindings(&self, agent_name: Option<&str>) -> Result<Vec<AgentBinding>> {
        self.with_conn(|conn| {
            let mut out = Vec::new();
            let mut push = |row: &Row<'_>| -> rusqlite::Result<()> {
                out.push(row_to_binding(row)?);
                Ok(())
            };
            match agent_name {
                Some(name) => {
                    let mut stmt = conn
                        .prepare(
                            "SELECT id, agent_name, adapter_type, adapter_token, created_at \
                             FROM agent_bindings WHERE agent_name = ?1 ORDER BY created_at",
                        )
                        .map_err(storage)?;
                    let mut rows = stmt.query(params![name]).map_err(storage)?;
                    while let Some(row) = rows.next().map_err(storage)? {
                        push(row).map_err(storage)?;
                    }
                }
                None => {
                    let mut stmt = conn
                        .prepare(
                            "SELECT id, agent_name, adapter_type, adapter_token, created_at \
                             FROM agent_bindings ORDER BY created_at",
                        )
                        .map_err(storage)?;
                    let mut rows = stmt.query([]).map_err(storage)?;
                    while let Some(row) = rows.next().map_err(storage)? {
                        push(row).map_err(storage)?;
                    }
                }
            }
            Ok(out)
        })
    }

    pub fn find_binding(
        &self,
        adapter_type: &str,
        adapter_token: &str,
    ) -> Result<Option<AgentBinding>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, agent_name, adapter_type, adapter_token, created_at \
                 FROM agent_bindings WHERE adapter_type = ?1 AND adapter_token = ?2",
                params![adapter_type, adapter_token],
                row_to_binding,
            )
            .optional()
            .map_err(storage)
        })
    }

    pub fn agent_has_binding(&self, agent_name: &str, adapter_type: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM agent_bindings \
                     WHERE agent_name = ?1 AND adapter_type = ?2",
                    params![agent_name, adapter_type],
                    |row| row.get(0),
                )
                .map_err(storage)?;
            Ok(n > 0)
        })
    }
}

fn set_role(tx: &rusqlite::Transaction<'_>, agent_name: &str, role: &str) -> Result<()> {
    tx.execute(
        "UPDATE agents SET metadata = json_set(metadata, '$.role', ?2) WHERE name = ?1",
        params![agent_name, role],
    )
    .map_err(storage)?;
    Ok(())
}

fn row_to_binding(row: &Row<'_>) -> rusqlite::Result<AgentBinding> {
    let id: String = row.get(0)?;
    Ok(AgentBinding {
        id: id.parse::<Uuid>().map_err(|_| bad_column(0, &id))?,
        agent_name: row.get(1)?,
        adapter_type: row.get(2)?,
        adapter_token: row.get(3)?,
        created_at: row.get::<_, i64>(4)? as TimestampMs,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hb_domain::agent::{PermissionLevel, Provider};
    use hb_domain::id::new_id;

    pub(crate) fn test_agent(name: &str) -> Agent {
        Agent {
            name: name.to_string(),
            token: format!("tok-{name}"),
            description: None,
            workspace: None,
            provider: Provider::Claude,
            model: None,
            reasoning_effort: None,
            permission_level: PermissionLevel::Standard,
            session_policy: None,
            created_at: 1_000,
            last_seen_at: None,
            metadata: serde_json::Map::new(),
            session_opened_at: None,
            refresh_requested: false,
        }
    }

    fn binding(agent: &str, adapter: &str, token: &str) -> AgentBinding {
        AgentBinding {
            id: new_id(),
            agent_name: agent.to_string(),
            adapter_type: adapter.to_string(),
            adapter_token: token.to_string(),
            created_at: 1_000,
        }
    }

    #[test]
    fn create_and_fetch_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.create_agent(&test_agent("nex")).unwrap();
        let got = store.get_agent("nex").unwrap().unwrap();
        assert_eq!(got.token, "tok-nex");
        assert_eq!(got.provider, Provider::Claude);
    }

    #[test]
    fn name_uniqueness_is_case_insensitive() {
        let store = Store::open_in_memory().unwrap();
        store.create_agent(&test_agent("nex")).unwrap();
        let mut dup = test_agent("NEX");
        dup.token = "other-token".into();
        let err = store.create_agent(&dup).unwrap_err();
        assert_eq!(err.kind(), "conflict");
        // Lookup also matches case-insensitively.
        assert!(store.get_agent("NeX").unwrap().is_some());
    }

    #[test]
    fn token_lookup_is_case_sensitive() {
        let store = Store::open_in_memory().unwrap();
        store.create_agent(&test_agent("nex")).unwrap();
        assert!(store.get_agent_by_token("tok-nex").unwrap().is_some());
        assert!(store.get_agent_by_token("TOK-NEX").unwrap().is_none());
    }

    #[test]
    fn metadata_replacement_preserves_session_handle() {
        let store = Store::open_in_memory().unwrap();
        store.create_agent(&test_agent("nex")).unwrap();
        store.set_session_handle("nex", Some("sess-123")).unwrap();

        let mut user = serde_json::Map::new();
        user.insert("color".into(), serde_json::json!("green"));
        // A colliding user write of sessionHandle is discarded.
        user.insert("sessionHandle".into(), serde_json::json!("evil"));
        store.replace_agent_metadata("nex", Some(&user)).unwrap();

        let agent = store.get_agent("nex").unwrap().unwrap();
        assert_eq!(agent.session_handle(), Some("sess-123"));
        assert_eq!(agent.metadata.get("color").unwrap(), "green");

        // Clearing metadata also keeps the handle.
        store.replace_agent_metadata("nex", None).unwrap();
        let agent = store.get_agent("nex").unwrap().unwrap();
        assert_eq!(agent.session_handle(), Some("sess-123"));
        assert!(agent.metadata.get("color").is_none());
    }

    #[test]
    fn session_handle_surgery_leaves_user_keys() {
        let store = Store::open_in_memory().unwrap();
        store.create_agent(&test_agent("nex")).unwrap();
        let mut user = serde_json::Map::new();
        user.insert("note".into(), serde_json::json!("keep me"));
        store.replace_agent_metadata("nex", Some(&user)).unwrap();

        store.set_session_handle("nex", Some("s1")).unwrap();
        store.set_session_handle("nex", Some("s2")).unwrap();
        store.set_session_handle("nex", None).unwrap();

        let agent = store.get_agent("nex").unwrap().unwrap();
        assert!(agent.session_handle().is_none());
        assert_eq!(agent.metadata.get("note").unwrap(), "keep me");
    }

    #[test]
    fn binding_uniqueness_constraints() {
        let store = Store::open_in_memory().unwrap();
        store.create_agent(&test_agent("nex")).unwrap();
        store.create_agent(&test_agent("zed")).unwrap();

        store.create_binding(&binding("nex", "telegram", "T1")).unwrap();

        // Same credential on another agent: conflict.
        let err = store
            .create_binding(&binding("zed", "telegram", "T1"))
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        // Second binding of the same type on one agent: conflict.
        let err = store
            .create_binding(&binding("nex", "telegram", "T2"))
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        // Different adapter type on the same agent is fine.
        store.create_binding(&binding("nex", "discord", "D1")).unwrap();
    }

    #[test]
    fn bind_unbind_maintains_role_metadata() {
        let store = Store::open_in_memory().unwrap();
        store.create_agent(&test_agent("nex")).unwrap();

        store.create_binding(&binding("nex", "telegram", "T1")).unwrap();
        let agent = store.get_agent("nex").unwrap().unwrap();
        assert_eq!(agent.metadata.get("role").unwrap(), "speaker");

        assert!(store.delete_binding("nex", "telegram").unwrap());
        let agent = store.get_agent("nex").unwrap().unwrap();
        assert_eq!(agent.metadata.get("role").unwrap(), "leader");

        assert!(!store.delete_binding("nex", "telegram").unwrap());
    }

    #[test]
    fn delete_agent_cascades_bindings() {
        let store = Store::open_in_memory().unwrap();
        store.create_agent(&test_agent("nex")).unwrap();
        store.create_binding(&binding("nex", "telegram", "T1")).unwrap();

        assert!(store.delete_agent("nex").unwrap());
        assert!(store.find_binding("telegram", "T1").unwrap().is_none());
        // Credential is reusable afterwards.
        store.create_agent(&test_agent("zed")).unwrap();
        store.create_binding(&binding("zed", "telegram", "T1")).unwrap();
    }
}
