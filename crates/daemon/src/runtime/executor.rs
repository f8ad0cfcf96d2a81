//! Per-agent serialized execution.
//!
//! Exactly one worker task per agent, created lazily on first trigger and
//! stopped when the agent is deleted. The worker drains due envelopes in
//! turns of at most [`MAX_ENVELOPES_PER_TURN`], spawning the agent's
//! provider CLI once per turn. A successful turn commits its run record and
//! envelope acknowledgements in one transaction; a failed turn leaves the
//! envelopes pending for the next trigger.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use hb_domain::agent::Agent;
use hb_domain::run::AgentRun;
use hb_domain::time::now_ms;
use hb_domain::{Error, Result};
use hb_providers::SpawnSpec;

use crate::runtime::{session_policy, turn_input};
use crate::state::AppState;

/// Upper bound on envelopes batched into one provider turn.
pub const MAX_ENVELOPES_PER_TURN: usize = 10;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor map
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Signal {
    Check,
    Stop,
}

struct RunningTurn {
    cancel: CancellationToken,
    clear_pending_on_cancel: bool,
}

struct ExecutorHandle {
    tx: mpsc::Sender<Signal>,
    current: Arc<Mutex<Option<RunningTurn>>>,
}

/// Registry of live per-agent workers.
#[derive(Default)]
pub struct ExecutorMap {
    inner: Mutex<HashMap<String, ExecutorHandle>>,
}

impl ExecutorMap {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Wake (lazily creating) the agent's worker. Safe to call for unknown
/// agents — the worker exits on its first empty check.
pub fn signal(state: &AppState, agent_name: &str) {
    let mut map = state.executors.inner.lock();
    let handle = map.entry(agent_name.to_string()).or_insert_with(|| {
        let (tx, rx) = mpsc::channel(8);
        let current = Arc::new(Mutex::new(None));
        let worker_state = state.clone();
        let worker_current = current.clone();
        let name = agent_name.to_string();
        tokio::spawn(async move {
            worker(worker_state, name, rx, worker_current).await;
        });
        ExecutorHandle { tx, current }
    });
    // A full mailbox already guarantees a pending check.
    let _ = handle.tx.try_send(Signal::Check);
}

/// Stop and remove the agent's worker (agent deletion). Any in-flight turn
/// is cancelled.
pub async fn stop(state: &AppState, agent_name: &str) {
    let handle = state.executors.inner.lock().remove(agent_name);
    if let Some(handle) = handle {
        if let Some(turn) = handle.current.lock().as_ref() {
            turn.cancel.cancel();
        }
        let _ = handle.tx.send(Signal::Stop).await;
    }
}

/// Cancel the agent's in-flight turn. Returns `true` when a turn was
/// running. `clear_pending` asks the cancellation path to terminalize due
/// non-cron pending envelopes in the same transaction.
pub fn abort(state: &AppState, agent_name: &str, clear_pending: bool) -> bool {
    let map = state.executors.inner.lock();
    let Some(handle) = map.get(agent_name) else {
        return false;
    };
    let mut current = handle.current.lock();
    match current.as_mut() {
        Some(turn) => {
            turn.clear_pending_on_cancel = clear_pending;
            turn.cancel.cancel();
            true
        }
        None => false,
    }
}

pub fn is_running(state: &AppState, agent_name: &str) -> bool {
    let map = state.executors.inner.lock();
    map.get(agent_name)
        .is_some_and(|h| h.current.lock().is_some())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum TurnFlow {
    /// No due envelopes; back to idle.
    NoWork,
    /// Turn completed; check again for more.
    Continue,
    /// Turn failed or was cancelled; wait for the next trigger.
    Halt,
}

async fn worker(
    state: AppState,
    agent_name: String,
    mut rx: mpsc::Receiver<Signal>,
    current: Arc<Mutex<Option<RunningTurn>>>,
) {
    tracing::debug!(agent = %agent_name, "executor worker started");
    loop {
        tokio::select! {
            signal = rx.recv() => match signal {
                None | Some(Signal::Stop) => break,
                Some(Signal::Check) => {}
            },
            () = state.shutdown.cancelled() => break,
        }

        loop {
            match run_one_turn(&state, &agent_name, &current).await {
                Ok(TurnFlow::NoWork) => break,
                Ok(TurnFlow::Continue) => {
                    // Give other agents and the RPC loop air between turns.
                    tokio::task::yield_now().await;
                }
                Ok(TurnFlow::Halt) => break,
                Err(e) => {
                    tracing::error!(agent = %agent_name, error = %e, "turn pipeline error");
                    break;
                }
            }
            if state.shutdown.is_cancelled() {
                break;
            }
        }
    }
    tracing::debug!(agent = %agent_name, "executor worker stopped");
}

/// CHECK → PREP → READY → RUNNING → ACK/FAIL/CANCELLED for one turn.
async fn run_one_turn(
    state: &AppState,
    agent_name: &str,
    current: &Arc<Mutex<Option<RunningTurn>>>,
) -> Result<TurnFlow> {
    let now = now_ms();

    // ── CHECK ────────────────────────────────────────────────────────
    let Some(agent) = state.store.get_agent(agent_name)? else {
        return Ok(TurnFlow::NoWork); // agent deleted under us
    };
    let envelopes = state
        .store
        .pending_envelopes_for_agent(agent_name, now, MAX_ENVELOPES_PER_TURN)?;
    if envelopes.is_empty() {
        return Ok(TurnFlow::NoWork);
    }

    // ── PREP: session policy at the safe point ───────────────────────
    let session_handle = evaluate_session(state, &agent, now)?;
    let fresh_session = session_handle.is_none();

    // ── READY: render the turn input ─────────────────────────────────
    let tz = state.boss_timezone();
    let store = state.store.clone();
    let quotes = move |id: &Uuid| {
        store
            .get_envelope(id)
            .ok()
            .flatten()
            .and_then(|e| e.content.text)
    };
    let input = turn_input::render(&envelopes, now, tz, &quotes);

    let run = AgentRun::started(agent_name, envelopes.iter().map(|e| e.id).collect(), now);
    let run_id = run.id;
    state.store.insert_run(&run)?;

    let cancel = state.shutdown.child_token();
    *current.lock() = Some(RunningTurn {
        cancel: cancel.clone(),
        clear_pending_on_cancel: false,
    });

    // ── RUNNING ──────────────────────────────────────────────────────
    let spec = build_spawn_spec(state, &agent, session_handle)?;
    if fresh_session {
        state.store.set_session_opened_at(agent_name, Some(now))?;
    }
    let driver = (state.drivers)(agent.provider);
    tracing::info!(
        agent = %agent_name,
        run_id = %run_id,
        envelopes = envelopes.len(),
        provider = %agent.provider,
        resume = !fresh_session,
        "turn started"
    );
    let result = driver.run(&spec, &input, &cancel).await;

    let clear_pending = current
        .lock()
        .take()
        .map(|t| t.clear_pending_on_cancel)
        .unwrap_or(false);
    let finished = now_ms();

    // ── ACK / FAIL / CANCELLED ───────────────────────────────────────
    match result {
        Ok(outcome) => {
            if let Some(handle) = &outcome.new_session_handle {
                state.store.set_session_handle(agent_name, Some(handle))?;
            }
            state.store.complete_run(
                &run_id,
                finished,
                outcome.final_response.as_deref(),
                outcome.context_length,
            )?;
            state.store.set_agent_last_seen(agent_name, finished)?;
            tracing::info!(
                agent = %agent_name,
                run_id = %run_id,
                context_length = outcome.context_length,
                "turn completed"
            );
            if envelopes.iter().any(|e| e.cron_schedule_id().is_some()) {
                state.materializer.notify_one();
            }
            Ok(TurnFlow::Continue)
        }
        Err(Error::Cancelled) => {
            let cleared = state.store.cancel_run(
                &run_id,
                finished,
                clear_pending.then_some((agent_name, finished)),
            )?;
            tracing::warn!(
                agent = %agent_name,
                run_id = %run_id,
                cleared_pending = cleared,
                "turn cancelled"
            );
            Ok(TurnFlow::Halt)
        }
        Err(e) => {
            state.store.fail_run(&run_id, finished, &e.to_string())?;
            tracing::warn!(agent = %agent_name, run_id = %run_id, error = %e, "turn failed, envelopes remain pending");
            Ok(TurnFlow::Halt)
        }
    }
}

/// Evaluate refresh policy and return the session handle to resume with
/// (`None` = fresh session). Refreshes discard the persisted handle.
fn evaluate_session(state: &AppState, agent: &Agent, now: u64) -> Result<Option<String>> {
    let last_run = state.store.last_terminal_run(&agent.name)?;
    let inputs = session_policy::PolicyInputs {
        now,
        tz: state.boss_timezone(),
        handle_present: agent.session_handle().is_some(),
        session_opened_at: agent.session_opened_at,
        last_run_completed_at: last_run.as_ref().and_then(|r| r.completed_at),
        last_context_length: last_run.as_ref().and_then(|r| r.context_length),
        refresh_requested: agent.refresh_requested,
    };

    match session_policy::evaluate(agent.session_policy.as_ref(), &inputs) {
        Some(reason) => {
            tracing::info!(agent = %agent.name, reason = reason.as_str(), "refreshing provider session");
            state.store.set_session_handle(&agent.name, None)?;
            state.store.set_session_opened_at(&agent.name, None)?;
            if agent.refresh_requested {
                state.store.set_refresh_requested(&agent.name, false)?;
            }
            Ok(None)
        }
        None => Ok(agent.session_handle().map(str::to_string)),
    }
}

fn build_spawn_spec(
    state: &AppState,
    agent: &Agent,
    session_handle: Option<String>,
) -> Result<SpawnSpec> {
    let workspace = agent
        .workspace
        .as_ref()
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| state.data_dir.agent_workspace(&agent.name));
    state.data_dir.ensure_agent_layout(&agent.name)?;
    std::fs::create_dir_all(&workspace)?;

    Ok(SpawnSpec {
        workspace,
        system_instructions: system_instructions(state, &agent.name),
        model: agent.model.clone(),
        reasoning_effort: agent.reasoning_effort,
        session_handle,
        memory_dir: Some(state.data_dir.agent_memory_dir(&agent.name)),
    })
}

/// System instructions for a turn: `BOSS.md` then the agent's `SOUL.md`,
/// injected inline into the provider invocation.
fn system_instructions(state: &AppState, agent_name: &str) -> String {
    let mut parts = Vec::new();
    if let Ok(boss) = std::fs::read_to_string(state.data_dir.boss_file()) {
        if !boss.trim().is_empty() {
            parts.push(boss);
        }
    }
    if let Ok(soul) = std::fs::read_to_string(state.data_dir.agent_soul_file(agent_name)) {
        if !soul.trim().is_empty() {
            parts.push(soul);
        }
    }
    parts.join("\n\n")
}
