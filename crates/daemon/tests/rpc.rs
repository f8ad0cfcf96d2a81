//! RPC surface behavior: bootstrap gating, token authentication, policy
//! enforcement, and the envelope/cron/agent method families, exercised
//! through the dispatch layer with a no-op driver.

use std::sync::Arc;

use serde_json::{json, Value};

use hb_daemon::paths::DataDir;
use hb_daemon::rpc::handlers::dispatch;
use hb_daemon::state::AppState;
use hb_domain::Error;
use hb_providers::{ProviderDriver, TurnResult};
use hb_store::Store;

/// Holds every turn open until shutdown so envelope state stays exactly
/// where the RPC layer put it.
struct ParkedDriver;

#[async_trait::async_trait]
impl ProviderDriver for ParkedDriver {
    fn name(&self) -> &'static str {
        "parked"
    }

    async fn run(
        &self,
        _spec: &hb_providers::SpawnSpec,
        _turn_input: &str,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> hb_domain::Result<TurnResult> {
        cancel.cancelled().await;
        Err(Error::Cancelled)
    }
}

struct Fixture {
    state: AppState,
    _tmp: tempfile::TempDir,
}

const BOSS_TOKEN: &str = "boss-secret-token";

async fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = DataDir::new(tmp.path().join("hiboss"));
    data_dir.ensure_layout().unwrap();
    let store = Arc::new(Store::open(&data_dir.db_path()).unwrap());
    let state = AppState::new(
        store,
        data_dir,
        Arc::new(|_| Box::new(ParkedDriver) as Box<dyn ProviderDriver>),
    );

    dispatch(
        &state,
        "setup.execute",
        &json!({
            "boss-token": BOSS_TOKEN,
            "boss-name": "kay",
            "boss-timezone": "UTC",
        }),
    )
    .await
    .unwrap();

    Fixture { state, _tmp: tmp }
}

async fn call(f: &Fixture, method: &str, params: Value) -> Result<Value, Error> {
    dispatch(&f.state, method, &params).await
}

async fn register_agent(f: &Fixture, name: &str) -> String {
    let result = call(
        f,
        "agent.register",
        json!({ "token": BOSS_TOKEN, "name": name, "provider": "claude" }),
    )
    .await
    .unwrap();
    result["token"].as_str().unwrap().to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bootstrap & auth
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn setup_runs_once_then_refuses() {
    let f = fixture().await;
    let checked = call(&f, "setup.check", json!({})).await.unwrap();
    assert_eq!(checked["setup-completed"], true);

    let err = call(
        &f,
        "setup.execute",
        json!({ "boss-token": "other-token-123" }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "permission-denied");
}

#[tokio::test]
async fn boss_verify_is_tokenless_and_total() {
    let f = fixture().await;
    let ok = call(&f, "boss.verify", json!({ "token": BOSS_TOKEN }))
        .await
        .unwrap();
    assert_eq!(ok["valid"], true);
    let bad = call(&f, "boss.verify", json!({ "token": "nope" }))
        .await
        .unwrap();
    assert_eq!(bad["valid"], false);
}

#[tokio::test]
async fn every_non_bootstrap_method_requires_a_token() {
    let f = fixture().await;
    for method in [
        "envelope.send",
        "envelope.list",
        "envelope.get",
        "cron.create",
        "cron.list",
        "agent.list",
        "agent.status",
        "daemon.status",
        "daemon.ping",
        "daemon.time",
    ] {
        let err = call(&f, method, json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "auth-error", "{method} must reject tokenless calls");
    }
}

#[tokio::test]
async fn unknown_tokens_are_rejected() {
    let f = fixture().await;
    let err = call(&f, "daemon.ping", json!({ "token": "who-dis" }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "auth-error");
}

#[tokio::test]
async fn permission_levels_gate_methods() {
    let f = fixture().await;
    let agent_token = register_agent(&f, "nex").await;

    // Standard-level agent: daemon.status (boss) denied, daemon.ping fine.
    let err = call(&f, "daemon.status", json!({ "token": agent_token }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "permission-denied");
    let pong = call(&f, "daemon.ping", json!({ "token": agent_token }))
        .await
        .unwrap();
    assert_eq!(pong["pong"], true);

    // Boss passes everything.
    let status = call(&f, "daemon.status", json!({ "token": BOSS_TOKEN }))
        .await
        .unwrap();
    assert_eq!(status["running"], true);
    assert!(status["data-dir"].as_str().unwrap().contains("hiboss"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope family
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn send_and_list_inbox_round_trip() {
    let f = fixture().await;
    let agent_token = register_agent(&f, "nex").await;

    for text in ["hello-1", "hello-2"] {
        call(
            &f,
            "envelope.send",
            json!({ "token": BOSS_TOKEN, "to": "agent:nex", "text": text }),
        )
        .await
        .unwrap();
    }

    let listed = call(
        &f,
        "envelope.list",
        json!({ "token": agent_token, "box": "inbox", "status": "pending" }),
    )
    .await
    .unwrap();
    let texts: Vec<&str> = listed["envelopes"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["text"].as_str())
        .collect();
    assert!(texts.contains(&"hello-1"));
    assert!(texts.contains(&"hello-2"));
    // Boss-origin sends are stamped.
    assert!(listed["envelopes"][0]["from-boss"].as_bool().unwrap());
}

#[tokio::test]
async fn deliver_at_accepts_relative_and_absolute_forms() {
    let f = fixture().await;
    register_agent(&f, "nex").await;

    let rel = call(
        &f,
        "envelope.send",
        json!({ "token": BOSS_TOKEN, "to": "agent:nex", "text": "later", "deliver-at": "+2s" }),
    )
    .await
    .unwrap();
    assert!(rel["deliver-at"].as_u64().unwrap() > hb_domain::time::now_ms());

    let abs = call(
        &f,
        "envelope.send",
        json!({
            "token": BOSS_TOKEN, "to": "agent:nex", "text": "much later",
            "deliver-at": "2099-01-01T00:00:00Z",
        }),
    )
    .await
    .unwrap();
    assert_eq!(abs["deliver-at"].as_u64().unwrap(), 4_070_908_800_000);

    let err = call(
        &f,
        "envelope.send",
        json!({ "token": BOSS_TOKEN, "to": "agent:nex", "text": "x", "deliver-at": "whenever" }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "validation-error");
}

#[tokio::test]
async fn envelope_get_resolves_short_prefixes() {
    let f = fixture().await;
    register_agent(&f, "nex").await;
    let sent = call(
        &f,
        "envelope.send",
        json!({ "token": BOSS_TOKEN, "to": "agent:nex", "text": "findme" }),
    )
    .await
    .unwrap();
    let short = sent["short-id"].as_str().unwrap();

    let got = call(&f, "envelope.get", json!({ "token": BOSS_TOKEN, "id": short }))
        .await
        .unwrap();
    assert_eq!(got["text"], "findme");
    assert_eq!(got["id"], sent["envelope-id"]);

    let err = call(
        &f,
        "envelope.get",
        json!({ "token": BOSS_TOKEN, "id": "ffffffff" }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "not-found");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent family
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn register_validates_and_conflicts() {
    let f = fixture().await;
    register_agent(&f, "nex").await;

    let dup = call(
        &f,
        "agent.register",
        json!({ "token": BOSS_TOKEN, "name": "NEX", "provider": "codex" }),
    )
    .await
    .unwrap_err();
    assert_eq!(dup.kind(), "conflict");

    let bad = call(
        &f,
        "agent.register",
        json!({ "token": BOSS_TOKEN, "name": "bad name!", "provider": "claude" }),
    )
    .await
    .unwrap_err();
    assert_eq!(bad.kind(), "validation-error");

    let reserved = call(
        &f,
        "agent.register",
        json!({ "token": BOSS_TOKEN, "name": "background", "provider": "claude" }),
    )
    .await
    .unwrap_err();
    assert_eq!(reserved.kind(), "validation-error");
}

#[tokio::test]
async fn register_requires_boss_level() {
    let f = fixture().await;
    let agent_token = register_agent(&f, "nex").await;
    let err = call(
        &f,
        "agent.register",
        json!({ "token": agent_token, "name": "zed", "provider": "claude" }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "permission-denied");
}

#[tokio::test]
async fn bind_conflicts_on_shared_credential() {
    let f = fixture().await;
    register_agent(&f, "nex").await;
    register_agent(&f, "zed").await;

    call(
        &f,
        "agent.bind",
        json!({ "token": BOSS_TOKEN, "name": "nex", "adapter-type": "telegram", "adapter-token": "T1" }),
    )
    .await
    .unwrap();

    let err = call(
        &f,
        "agent.bind",
        json!({ "token": BOSS_TOKEN, "name": "zed", "adapter-type": "telegram", "adapter-token": "T1" }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "conflict");

    // Bound agent now reports the speaker role.
    let listed = call(&f, "agent.list", json!({ "token": BOSS_TOKEN }))
        .await
        .unwrap();
    let nex = listed["agents"]
        .as_array()
        .unwrap()
        .iter()
        .find(|a| a["name"] == "nex")
        .unwrap();
    assert_eq!(nex["role"], "speaker");
}

#[tokio::test]
async fn metadata_updates_preserve_session_handle() {
    let f = fixture().await;
    let agent_token = register_agent(&f, "nex").await;
    f.state
        .store
        .set_session_handle("nex", Some("sess-keep"))
        .unwrap();

    // Arbitrary sequence of metadata writes and clears.
    call(
        &f,
        "agent.set",
        json!({ "token": agent_token, "metadata": { "mood": "good", "sessionHandle": "evil" } }),
    )
    .await
    .unwrap();
    call(
        &f,
        "agent.set",
        json!({ "token": agent_token, "clear-metadata": true }),
    )
    .await
    .unwrap();
    call(
        &f,
        "agent.set",
        json!({ "token": agent_token, "metadata": { "mood": "tired" } }),
    )
    .await
    .unwrap();

    let agent = f.state.store.get_agent("nex").unwrap().unwrap();
    assert_eq!(agent.session_handle(), Some("sess-keep"));
    assert_eq!(agent.metadata.get("mood").unwrap(), "tired");
}

#[tokio::test]
async fn agents_cannot_target_other_agents() {
    let f = fixture().await;
    let nex_token = register_agent(&f, "nex").await;
    register_agent(&f, "zed").await;

    let err = call(
        &f,
        "agent.set",
        json!({ "token": nex_token, "name": "zed", "description": "hijack" }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), "permission-denied");
}

#[tokio::test]
async fn session_policy_set_and_status() {
    let f = fixture().await;
    register_agent(&f, "nex").await;

    call(
        &f,
        "agent.session-policy.set",
        json!({
            "token": BOSS_TOKEN, "name": "nex",
            "daily-reset-at": "04:30", "idle-timeout": "1h30m", "max-context-length": 120000,
        }),
    )
    .await
    .unwrap();

    let agent = f.state.store.get_agent("nex").unwrap().unwrap();
    let policy = agent.session_policy.unwrap();
    assert_eq!(policy.idle_timeout.as_deref(), Some("1h30m"));
    assert_eq!(policy.max_context_length, Some(120_000));

    let bad = call(
        &f,
        "agent.session-policy.set",
        json!({ "token": BOSS_TOKEN, "name": "nex", "idle-timeout": "90x" }),
    )
    .await
    .unwrap_err();
    assert_eq!(bad.kind(), "validation-error");

    let status = call(
        &f,
        "agent.status",
        json!({ "token": BOSS_TOKEN, "name": "nex" }),
    )
    .await
    .unwrap();
    assert_eq!(status["state"], "idle");
    assert_eq!(status["session-active"], false);
}

#[tokio::test]
async fn delete_removes_agent_and_its_token() {
    let f = fixture().await;
    let agent_token = register_agent(&f, "nex").await;

    call(&f, "agent.delete", json!({ "token": BOSS_TOKEN, "name": "nex" }))
        .await
        .unwrap();

    let err = call(&f, "daemon.ping", json!({ "token": agent_token }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "auth-error");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cron family
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn cron_crud_round_trip() {
    let f = fixture().await;
    let agent_token = register_agent(&f, "nex").await;

    let created = call(
        &f,
        "cron.create",
        json!({
            "token": agent_token, "cron": "*/1 * * * *",
            "to": "agent:nex", "text": "tick", "timezone": "UTC",
        }),
    )
    .await
    .unwrap();
    assert_eq!(created["agent"], "nex");
    assert!(created["next-occurrence"].as_u64().unwrap() > hb_domain::time::now_ms());
    let id = created["short-id"].as_str().unwrap().to_string();

    let listed = call(&f, "cron.list", json!({ "token": agent_token }))
        .await
        .unwrap();
    assert_eq!(listed["count"], 1);

    call(&f, "cron.disable", json!({ "token": agent_token, "id": id }))
        .await
        .unwrap();
    let got = call(&f, "cron.get", json!({ "token": agent_token, "id": id }))
        .await
        .unwrap();
    assert_eq!(got["enabled"], false);

    call(&f, "cron.delete", json!({ "token": agent_token, "id": id }))
        .await
        .unwrap();
    let listed = call(&f, "cron.list", json!({ "token": agent_token }))
        .await
        .unwrap();
    assert_eq!(listed["count"], 0);
}

#[tokio::test]
async fn cron_rejects_bad_expressions_and_timezones() {
    let f = fixture().await;
    let agent_token = register_agent(&f, "nex").await;

    let bad_expr = call(
        &f,
        "cron.create",
        json!({ "token": agent_token, "cron": "not a cron", "to": "agent:nex", "text": "x" }),
    )
    .await
    .unwrap_err();
    assert_eq!(bad_expr.kind(), "validation-error");

    let bad_tz = call(
        &f,
        "cron.create",
        json!({
            "token": agent_token, "cron": "@daily", "to": "agent:nex",
            "text": "x", "timezone": "Mars/Olympus",
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(bad_tz.kind(), "validation-error");
}

#[tokio::test]
async fn cron_ownership_is_enforced() {
    let f = fixture().await;
    let nex_token = register_agent(&f, "nex").await;
    let zed_token = register_agent(&f, "zed").await;

    let created = call(
        &f,
        "cron.create",
        json!({ "token": nex_token, "cron": "@daily", "to": "agent:nex", "text": "tick" }),
    )
    .await
    .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let err = call(&f, "cron.delete", json!({ "token": zed_token, "id": id }))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "permission-denied");
}
