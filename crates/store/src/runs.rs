//! Run audit persistence. The success path commits the run record and the
//! turn's envelope acknowledgements in one transaction — this is where the
//! at-most-once guarantee lives.

use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use hb_domain::run::{AgentRun, RunStatus, ERROR_DAEMON_STOPPED};
use hb_domain::time::TimestampMs;
use hb_domain::{Error, Result};

use crate::{storage, Store};

const RUN_COLS: &str = "id, agent_name, started_at, completed_at, envelope_ids, \
     final_response, context_length, status, error";

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<AgentRun> {
    let id: String = row.get(0)?;
    let ids: String = row.get(4)?;
    let status: String = row.get(7)?;
    let bad = |idx: usize, v: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unparseable stored value '{v}'").into(),
        )
    };
    let envelope_ids: Vec<String> = serde_json::from_str(&ids).map_err(|_| bad(4, &ids))?;
    Ok(AgentRun {
        id: id.parse::<Uuid>().map_err(|_| bad(0, &id))?,
        agent_name: row.get(1)?,
        started_at: row.get::<_, i64>(2)? as TimestampMs,
        completed_at: row.get::<_, Option<i64>>(3)?.map(|v| v as TimestampMs),
        envelope_ids: envelope_ids
            .iter()
            .map(|s| s.parse::<Uuid>().map_err(|_| bad(4, s)))
            .collect::<rusqlite::Result<_>>()?,
        final_response: row.get(5)?,
        context_length: row.get::<_, Option<i64>>(6)?.map(|v| v.max(0) as u64),
        status: status.parse().map_err(|_| bad(7, &status))?,
        error: row.get(8)?,
    })
}

fn ids_json(ids: &[Uuid]) -> Result<String> {
    Ok(serde_json::to_string(
        &ids.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
    )?)
}

impl Store {
    pub fn insert_run(&self, run: &AgentRun) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                &format!("INSERT INTO agent_runs ({RUN_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    run.id.to_string(),
                    run.agent_name,
                    run.started_at as i64,
                    run.completed_at.map(|v| v as i64),
                    ids_json(&run.envelope_ids)?,
                    run.final_response,
                    run.context_length.map(|v| v as i64),
                    run.status.as_str(),
                    run.error,
                ],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    pub fn get_run(&self, id: &Uuid) -> Result<Option<AgentRun>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RUN_COLS} FROM agent_runs WHERE id = ?1"),
                params![id.to_string()],
                row_to_run,
            )
            .optional()
            .map_err(storage)
        })
    }

    /// Commit a successful turn: finalize the run row and acknowledge its
    /// envelopes (`pending -> done`) atomically.
    pub fn complete_run(
        &self,
        run_id: &Uuid,
        completed_at: TimestampMs,
        final_response: Option<&str>,
        context_length: Option<u64>,
    ) -> Result<()> {
        self.with_tx(|tx| {
            let ids: String = tx
                .query_row(
                    "SELECT envelope_ids FROM agent_runs WHERE id = ?1",
                    params![run_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(storage)?
                .ok_or_else(|| Error::NotFound(format!("run '{run_id}'")))?;
            let envelope_ids: Vec<String> = serde_json::from_str(&ids)?;

            tx.execute(
                "UPDATE agent_runs SET status = 'completed', completed_at = ?2, \
                 final_response = ?3, context_length = ?4 WHERE id = ?1",
                params![
                    run_id.to_string(),
                    completed_at as i64,
                    final_response,
                    context_length.map(|v| v as i64),
                ],
            )
            .map_err(storage)?;

            for envelope_id in &envelope_ids {
                tx.execute(
                    "UPDATE envelopes SET status = 'done' WHERE id = ?1 AND status = 'pending'",
                    params![envelope_id],
                )
                .map_err(storage)?;
            }
            Ok(())
        })
    }

    /// Record a failed turn. Envelopes stay pending for the next trigger.
    pub fn fail_run(&self, run_id: &Uuid, completed_at: TimestampMs, error: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE agent_runs SET status = 'failed', completed_at = ?2, error = ?3 \
                 WHERE id = ?1",
                params![run_id.to_string(), completed_at as i64, error],
            )
            .map_err(storage)?;
            Ok(())
        })
    }

    /// Record a cancelled turn. When `clear_agent` is set, due non-cron
    /// pending envelopes for that agent are terminalized in the same
    /// transaction.
    pub fn cancel_run(
        &self,
        run_id: &Uuid,
        completed_at: TimestampMs,
        clear_agent: Option<(&str, TimestampMs)>,
    ) -> Result<u64> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE agent_runs SET status = 'cancelled', completed_at = ?2 WHERE id = ?1",
                params![run_id.to_string(), completed_at as i64],
            )
            .map_err(storage)?;

            let mut cleared = 0u64;
            if let Some((agent, now)) = clear_agent {
                cleared = tx
                    .execute(
                        "UPDATE envelopes SET status = 'done' \
                         WHERE status = 'pending' AND to_addr = ?1 \
                           AND (deliver_at IS NULL OR deliver_at <= ?2) \
                           AND json_extract(metadata, '$.cronScheduleId') IS NULL",
                        params![format!("agent:{agent}"), now as i64],
                    )
                    .map_err(storage)? as u64;
            }
            Ok(cleared)
        })
    }

    /// The most recent run that reached a terminal state, for session-policy
    /// evaluation.
    pub fn last_terminal_run(&self, agent_name: &str) -> Result<Option<AgentRun>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {RUN_COLS} FROM agent_runs \
                     WHERE agent_name = ?1 AND status != 'running' \
                     ORDER BY started_at DESC LIMIT 1"
                ),
                params![agent_name],
                row_to_run,
            )
            .optional()
            .map_err(storage)
        })
    }

    pub fn running_run(&self, agent_name: &str) -> Result<Option<AgentRun>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {RUN_COLS} FROM agent_runs \
                     WHERE agent_name = ?1 AND status = 'running' LIMIT 1"
                ),
                params![agent_name],
                row_to_run,
            )
            .optional()
            .map_err(storage)
        })
    }

    pub fn list_runs(&self, agent_name: &str, limit: usize) -> Result<Vec<AgentRun>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {RUN_COLS} FROM agent_runs WHERE agent_name = ?1 \
                     ORDER BY started_at DESC LIMIT ?2"
                ))
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![agent_name, limit as i64], row_to_run)
                .map_err(storage)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage)?;
            Ok(rows)
        })
    }

    /// Reconcile runs left `running` by a dead daemon. Called on open.
    pub fn reconcile_stale_runs(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn
                .execute(
                    "UPDATE agent_runs SET status = 'failed', error = ?1 \
                     WHERE status = 'running'",
                    params![ERROR_DAEMON_STOPPED],
                )
                .map_err(storage)?;
            Ok(n)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hb_domain::address::Address;
    use hb_domain::envelope::EnvelopeStatus;

    fn seed(store: &Store, agent: &str, n: usize) -> Vec<Uuid> {
        store
            .create_agent(&crate::agents::tests::test_agent(agent))
            .unwrap();
        (0..n)
            .map(|i| {
                let e = crate::envelopes::tests::pending(Address::agent(agent), 1_000 + i as u64);
                store.insert_envelope(&e).unwrap();
                e.id
            })
            .collect()
    }

    #[test]
    fn complete_run_acks_envelopes_atomically() {
        let store = Store::open_in_memory().unwrap();
        let ids = seed(&store, "nex", 3);
        let run = AgentRun::started("nex", ids.clone(), 2_000);
        store.insert_run(&run).unwrap();

        store
            .complete_run(&run.id, 3_000, Some("done!"), Some(42_000))
            .unwrap();

        let got = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(got.status, RunStatus::Completed);
        assert_eq!(got.context_length, Some(42_000));
        assert_eq!(got.envelope_ids, ids);
        for id in &ids {
            let e = store.get_envelope(id).unwrap().unwrap();
            assert_eq!(e.status, EnvelopeStatus::Done);
        }
    }

    #[test]
    fn failed_run_leaves_envelopes_pending() {
        let store = Store::open_in_memory().unwrap();
        let ids = seed(&store, "nex", 2);
        let run = AgentRun::started("nex", ids.clone(), 2_000);
        store.insert_run(&run).unwrap();

        store.fail_run(&run.id, 3_000, "provider exited 1").unwrap();

        let got = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(got.status, RunStatus::Failed);
        for id in &ids {
            let e = store.get_envelope(id).unwrap().unwrap();
            assert_eq!(e.status, EnvelopeStatus::Pending);
        }
    }

    #[test]
    fn cancel_run_optionally_clears_non_cron_pending() {
        let store = Store::open_in_memory().unwrap();
        let ids = seed(&store, "nex", 2);
        // A cron-materialized envelope must survive the clear.
        let mut cron_env =
            crate::envelopes::tests::pending(Address::agent("nex"), 1_500);
        cron_env
            .metadata
            .insert("cronScheduleId".into(), serde_json::json!("some-cron"));
        store.insert_envelope(&cron_env).unwrap();

        let run = AgentRun::started("nex", ids.clone(), 2_000);
        store.insert_run(&run).unwrap();

        let cleared = store
            .cancel_run(&run.id, 3_000, Some(("nex", 10_000)))
            .unwrap();
        assert_eq!(cleared, 2);

        assert_eq!(
            store.get_run(&run.id).unwrap().unwrap().status,
            RunStatus::Cancelled
        );
        let kept = store.get_envelope(&cron_env.id).unwrap().unwrap();
        assert_eq!(kept.status, EnvelopeStatus::Pending);
    }

    #[test]
    fn stale_running_runs_reconcile_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hiboss.db");
        let run_id;
        {
            let store = Store::open(&path).unwrap();
            seed(&store, "nex", 1);
            let run = AgentRun::started("nex", vec![], 2_000);
            run_id = run.id;
            store.insert_run(&run).unwrap();
        }
        let store = Store::open(&path).unwrap();
        let got = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(got.status, RunStatus::Failed);
        assert_eq!(got.error.as_deref(), Some(ERROR_DAEMON_STOPPED));
    }

    #[test]
    fn last_terminal_run_skips_running() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, "nex", 0);
        let old = AgentRun::started("nex", vec![], 1_000);
        store.insert_run(&old).unwrap();
        store.complete_run(&old.id, 1_500, None, Some(10)).unwrap();

        let current = AgentRun::started("nex", vec![], 2_000);
        store.insert_run(&current).unwrap();

        let last = store.last_terminal_run("nex").unwrap().unwrap();
        assert_eq!(last.id, old.id);
        let running = store.running_run("nex").unwrap().unwrap();
        assert_eq!(running.id, current.id);
    }
}
