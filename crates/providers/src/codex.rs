//! Driver for the `codex` CLI.
//!
//! `codex exec --json` emits one `{id, msg}` event per line. Resume is a
//! subcommand (`codex exec resume <session-id>`). System instructions are
//! injected inline by prefixing the turn input; codex has no system-prompt
//! flag that avoids writing to the provider home.

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use hb_domain::agent::ReasoningEffort;
use hb_domain::Result;

use crate::process::{run_streaming, ChildSpec};
use crate::{ProviderDriver, SpawnSpec, TurnResult, TurnUsage};

/// Env override cleared so every agent shares the default provider home.
const HOME_OVERRIDE_VARS: &[&str] = &["CODEX_HOME"];

#[derive(Debug, Default)]
pub struct CodexDriver;

fn effort_value(effort: ReasoningEffort) -> &'static str {
    match effort {
        ReasoningEffort::None => "none",
        ReasoningEffort::Low => "low",
        ReasoningEffort::Medium => "medium",
        ReasoningEffort::High => "high",
        ReasoningEffort::Xhigh => "xhigh",
    }
}

fn build_args(spec: &SpawnSpec) -> Vec<String> {
    let mut args: Vec<String> = vec!["exec".into()];
    if let Some(handle) = &spec.session_handle {
        args.push("resume".into());
        args.push(handle.clone());
    }
    args.push("--json".into());
    // Full access: the agent drives our own RPC client from inside.
    args.push("--dangerously-bypass-approvals-and-sandbox".into());
    args.push("--skip-git-repo-check".into());
    args.push("--cd".into());
    args.push(spec.workspace.display().to_string());
    if let Some(model) = &spec.model {
        args.push("--model".into());
        args.push(model.clone());
    }
    if let Some(effort) = spec.reasoning_effort {
        args.push("-c".into());
        args.push(format!("model_reasoning_effort=\"{}\"", effort_value(effort)));
    }
    // The prompt arrives on stdin.
    args.push("-".into());
    args
}

/// Turn input with system instructions prefixed inline.
fn build_stdin(spec: &SpawnSpec, turn_input: &str) -> String {
    if spec.system_instructions.is_empty() {
        turn_input.to_string()
    } else {
        format!("{}\n\n{}", spec.system_instructions, turn_input)
    }
}

#[derive(Default)]
struct StreamState {
    session_id: Option<String>,
    last_token_count: Option<TurnUsage>,
    last_agent_message: Option<String>,
}

fn ingest_line(state: &mut StreamState, line: &str) {
    let Ok(event) = serde_json::from_str::<Value>(line) else {
        tracing::debug!(line, "skipping non-JSON stream line");
        return;
    };
    let Some(msg) = event.get("msg") else {
        return;
    };
    match msg.get("type").and_then(Value::as_str) {
        Some("session_configured") => {
            if let Some(sid) = msg.get("session_id").and_then(Value::as_str) {
                state.session_id = Some(sid.to_string());
            }
        }
        Some("token_count") => {
            // Older builds put the totals flat on the event; newer ones nest
            // them under info.total_token_usage.
            let usage = msg
                .pointer("/info/last_token_usage")
                .or_else(|| msg.pointer("/info/total_token_usage"))
                .unwrap_or(msg);
            let field = |key: &str| usage.get(key).and_then(Value::as_u64).unwrap_or(0);
            state.last_token_count = Some(TurnUsage {
                input_tokens: field("input_tokens"),
                output_tokens: field("output_tokens"),
                ..Default::default()
            });
        }
        Some("agent_message") => {
            if let Some(text) = msg.get("message").and_then(Value::as_str) {
                state.last_agent_message = Some(text.to_string());
            }
        }
        Some("task_complete") => {
            if let Some(text) = msg.get("last_agent_message").and_then(Value::as_str) {
                state.last_agent_message = Some(text.to_string());
            }
        }
        _ => {}
    }
}

#[async_trait::async_trait]
impl ProviderDriver for CodexDriver {
    fn name(&self) -> &'static str {
        "codex"
    }

    async fn run(
        &self,
        spec: &SpawnSpec,
        turn_input: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnResult> {
        if spec.session_handle.is_none() {
            tracing::info!("no session handle used, opening fresh codex session");
        }
        let args = build_args(spec);
        let stdin = build_stdin(spec, turn_input);
        let mut state = StreamState::default();
        run_streaming(
            self.name(),
            ChildSpec {
                program: "codex",
                args,
                workdir: &spec.workspace,
                clear_env: HOME_OVERRIDE_VARS,
            },
            &stdin,
            cancel,
            |line| ingest_line(&mut state, line),
        )
        .await?;

        if let Some(usage) = &state.last_token_count {
            tracing::info!(
                input = usage.input_tokens,
                output = usage.output_tokens,
                "codex turn token totals"
            );
        }
        Ok(TurnResult {
            final_response: state.last_agent_message,
            // Context length = input + output of the last token-count event.
            context_length: state.last_token_count.map(|u| u.context_length()),
            new_session_handle: state.session_id,
            usage: state.last_token_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> SpawnSpec {
        SpawnSpec {
            workspace: PathBuf::from("/work"),
            system_instructions: "you are nex".into(),
            model: Some("gpt-5.2-codex".into()),
            reasoning_effort: Some(ReasoningEffort::High),
            session_handle: None,
            memory_dir: None,
        }
    }

    #[test]
    fn fresh_session_args() {
        let args = build_args(&spec());
        let joined = args.join(" ");
        assert!(joined.starts_with("exec --json"));
        assert!(joined.contains("--dangerously-bypass-approvals-and-sandbox"));
        assert!(joined.contains("--cd /work"));
        assert!(joined.contains("--model gpt-5.2-codex"));
        assert!(joined.contains("model_reasoning_effort=\"high\""));
        assert!(joined.ends_with(" -"));
    }

    #[test]
    fn resume_uses_subcommand_form() {
        let mut s = spec();
        s.session_handle = Some("0199-abcd".into());
        let args = build_args(&s);
        assert_eq!(&args[..3], &["exec", "resume", "0199-abcd"]);
    }

    #[test]
    fn stdin_prefixes_system_instructions() {
        let s = spec();
        let stdin = build_stdin(&s, "now: x\npending-envelopes: 1");
        assert!(stdin.starts_with("you are nex\n\n"));
        assert!(stdin.ends_with("pending-envelopes: 1"));
    }

    #[test]
    fn stream_parse_takes_last_token_count() {
        let mut state = StreamState::default();
        ingest_line(
            &mut state,
            r#"{"id":"0","msg":{"type":"session_configured","session_id":"s-9"}}"#,
        );
        ingest_line(
            &mut state,
            r#"{"id":"1","msg":{"type":"token_count","input_tokens":100,"output_tokens":10}}"#,
        );
        ingest_line(
            &mut state,
            r#"{"id":"2","msg":{"type":"token_count","info":{"last_token_usage":{"input_tokens":300,"output_tokens":25}}}}"#,
        );
        ingest_line(
            &mut state,
            r#"{"id":"3","msg":{"type":"agent_message","message":"partial"}}"#,
        );
        ingest_line(
            &mut state,
            r#"{"id":"4","msg":{"type":"task_complete","last_agent_message":"final answer"}}"#,
        );

        assert_eq!(state.session_id.as_deref(), Some("s-9"));
        assert_eq!(state.last_token_count.unwrap().context_length(), 325);
        assert_eq!(state.last_agent_message.as_deref(), Some("final answer"));
    }
}
