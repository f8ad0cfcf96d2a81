//! Driver for the `claude` CLI.
//!
//! The CLI runs in print mode with `--output-format stream-json`, one JSON
//! event per stdout line. Session resume uses `--resume <session-id>`; the
//! session id observed in the stream is handed back for persistence.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use hb_domain::Result;

use crate::process::{run_streaming, ChildSpec};
use crate::{ProviderDriver, SpawnSpec, TurnResult, TurnUsage};

/// Env override cleared so every agent shares the default provider home.
const HOME_OVERRIDE_VARS: &[&str] = &["CLAUDE_CONFIG_DIR"];

#[derive(Debug, Default)]
pub struct ClaudeDriver;

fn build_args(spec: &SpawnSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-p".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--verbose".into(),
        // Full access: the agent drives our own RPC client from inside.
        "--dangerously-skip-permissions".into(),
        "--append-system-prompt".into(),
        spec.system_instructions.clone(),
    ];
    if let Some(dir) = &spec.memory_dir {
        args.push("--add-dir".into());
        args.push(dir.display().to_string());
    }
    if let Some(model) = &spec.model {
        args.push("--model".into());
        args.push(model.clone());
    }
    if let Some(handle) = &spec.session_handle {
        args.push("--resume".into());
        args.push(handle.clone());
    }
    args
}

/// Accumulates stream events into a [`TurnResult`].
#[derive(Default)]
struct StreamState {
    session_id: Option<String>,
    last_call_usage: Option<TurnUsage>,
    final_response: Option<String>,
    total_cost_usd: Option<f64>,
    /// Error subtype from the result event (`error_max_turns`, ...). The CLI
    /// can exit zero on these, so the driver checks it explicitly.
    result_error: Option<String>,
}

fn parse_usage(usage: &Value) -> TurnUsage {
    let field = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
    TurnUsage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cache_read_tokens: field("cache_read_input_tokens"),
        cache_write_tokens: field("cache_creation_input_tokens"),
    }
}

fn ingest_line(state: &mut StreamState, line: &str) {
    let Ok(event) = serde_json::from_str::<Value>(line) else {
        tracing::debug!(line, "skipping non-JSON stream line");
        return;
    };
    if let Some(sid) = event.get("session_id").and_then(Value::as_str) {
        state.session_id = Some(sid.to_string());
    }
    match event.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            if let Some(usage) = event.pointer("/message/usage") {
                state.last_call_usage = Some(parse_usage(usage));
            }
        }
        Some("result") => {
            match event.get("subtype").and_then(Value::as_str) {
                Some("success") | None => {}
                Some(subtype) => state.result_error = Some(subtype.to_string()),
            }
            if event.get("is_error").and_then(Value::as_bool) == Some(true)
                && state.result_error.is_none()
            {
                state.result_error = Some("error".to_string());
            }
            if let Some(text) = event.get("result").and_then(Value::as_str) {
                state.final_response = Some(text.to_string());
            }
            // The result usage covers the final call; prefer it when no
            // assistant usage was seen (short turns).
            if state.last_call_usage.is_none() {
                if let Some(usage) = event.get("usage") {
                    state.last_call_usage = Some(parse_usage(usage));
                }
            }
            state.total_cost_usd = event.get("total_cost_usd").and_then(Value::as_f64);
        }
        _ => {}
    }
}

#[async_trait::async_trait]
impl ProviderDriver for ClaudeDriver {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn run(
        &self,
        spec: &SpawnSpec,
        turn_input: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnResult> {
        if spec.session_handle.is_none() {
            tracing::info!("no session handle used, opening fresh claude session");
        }
        let args = build_args(spec);
        let mut state = StreamState::default();
        run_streaming(
            self.name(),
            ChildSpec {
                program: "claude",
                args,
                workdir: &spec.workspace,
                clear_env: HOME_OVERRIDE_VARS,
            },
            turn_input,
            cancel,
            |line| ingest_line(&mut state, line),
        )
        .await?;

        if let Some(cost) = state.total_cost_usd {
            tracing::info!(cost_usd = cost, "claude turn billing total");
        }
        if let Some(subtype) = state.result_error {
            return Err(hb_domain::Error::Provider {
                provider: self.name().to_string(),
                message: format!(
                    "turn ended with {subtype}: {}",
                    state.final_response.as_deref().unwrap_or("(no output)")
                ),
            });
        }
        Ok(TurnResult {
            final_response: state.final_response,
            context_length: state.last_call_usage.map(|u| u.context_length()),
            new_session_handle: state.session_id,
            usage: state.last_call_usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> SpawnSpec {
        SpawnSpec {
            workspace: PathBuf::from("/tmp"),
            system_instructions: "be helpful".into(),
            model: Some("claude-sonnet-4-5".into()),
            reasoning_effort: None,
            session_handle: Some("sess-1".into()),
            memory_dir: Some(PathBuf::from("/tmp/mem")),
        }
    }

    #[test]
    fn args_include_resume_model_and_allowlist() {
        let args = build_args(&spec());
        let joined = args.join(" ");
        assert!(joined.contains("--output-format stream-json"));
        assert!(joined.contains("--dangerously-skip-permissions"));
        assert!(joined.contains("--append-system-prompt be helpful"));
        assert!(joined.contains("--add-dir /tmp/mem"));
        assert!(joined.contains("--model claude-sonnet-4-5"));
        assert!(joined.contains("--resume sess-1"));
    }

    #[test]
    fn fresh_session_omits_resume() {
        let mut s = spec();
        s.session_handle = None;
        let args = build_args(&s);
        assert!(!args.iter().any(|a| a == "--resume"));
    }

    #[test]
    fn stream_parse_tracks_last_call_usage_and_result() {
        let mut state = StreamState::default();
        ingest_line(
            &mut state,
            r#"{"type":"system","subtype":"init","session_id":"abc"}"#,
        );
        ingest_line(
            &mut state,
            r#"{"type":"assistant","message":{"usage":{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":100,"cache_creation_input_tokens":20}},"session_id":"abc"}"#,
        );
        ingest_line(
            &mut state,
            r#"{"type":"assistant","message":{"usage":{"input_tokens":40,"output_tokens":8,"cache_read_input_tokens":200,"cache_creation_input_tokens":2}},"session_id":"abc"}"#,
        );
        ingest_line(
            &mut state,
            r#"{"type":"result","subtype":"success","result":"all done","session_id":"def","total_cost_usd":0.012}"#,
        );

        assert_eq!(state.final_response.as_deref(), Some("all done"));
        // Context length derives from the LAST assistant call: 40+8+200+2.
        assert_eq!(state.last_call_usage.unwrap().context_length(), 250);
        // Session handle follows the latest session_id seen.
        assert_eq!(state.session_id.as_deref(), Some("def"));
    }

    #[test]
    fn error_result_subtype_is_recorded() {
        let mut state = StreamState::default();
        ingest_line(
            &mut state,
            r#"{"type":"result","subtype":"error_max_turns","is_error":true,"session_id":"s"}"#,
        );
        assert_eq!(state.result_error.as_deref(), Some("error_max_turns"));

        let mut ok = StreamState::default();
        ingest_line(
            &mut ok,
            r#"{"type":"result","subtype":"success","result":"fine"}"#,
        );
        assert!(ok.result_error.is_none());
    }

    #[test]
    fn garbage_lines_are_ignored() {
        let mut state = StreamState::default();
        ingest_line(&mut state, "not json");
        ingest_line(&mut state, r#"{"type":"unknown-event"}"#);
        assert!(state.final_response.is_none());
        assert!(state.last_call_usage.is_none());
    }
}
