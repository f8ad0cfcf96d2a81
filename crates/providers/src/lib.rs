//! Provider CLI drivers.
//!
//! Each driver spawns an external agent CLI (`claude` or `codex`) for one
//! turn, stream-parses its line-delimited JSON output, and reports the final
//! response, the session-resume handle, and usage-derived context length.
//! Drivers own the child process end to end: stdin closed after the turn
//! input, stdout line-streamed, stderr kept in a bounded ring buffer,
//! SIGINT → SIGTERM → SIGKILL on cancellation.

pub mod claude;
pub mod codex;
mod process;

use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use hb_domain::agent::{Provider, ReasoningEffort};
use hb_domain::Result;

/// Everything a driver needs to spawn a turn.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Working directory for the child.
    pub workspace: PathBuf,
    /// System instructions, injected inline (never written to provider home).
    pub system_instructions: String,
    /// `None` = provider default model.
    pub model: Option<String>,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Session handle from the previous turn; `None` opens a fresh session.
    pub session_handle: Option<String>,
    /// Agent memory directory to add to the provider's allowlist.
    pub memory_dir: Option<PathBuf>,
}

/// Token usage of a single model call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TurnUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl TurnUsage {
    /// Prompt+output size of the call, the per-turn context length.
    pub fn context_length(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }
}

/// Outcome of a successful provider turn. Failures and cancellations travel
/// as `Error::Provider` / `Error::Cancelled`.
#[derive(Debug, Clone, Default)]
pub struct TurnResult {
    pub final_response: Option<String>,
    /// Token size of the turn's last model call.
    pub context_length: Option<u64>,
    /// Handle to persist for session resume on the next turn.
    pub new_session_handle: Option<String>,
    /// Usage of the last model call (billing totals are logged, not kept).
    pub usage: Option<TurnUsage>,
}

#[async_trait]
pub trait ProviderDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Spawn the CLI for one turn and await its completion.
    async fn run(
        &self,
        spec: &SpawnSpec,
        turn_input: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnResult>;
}

/// Construct the driver for an agent's configured provider.
pub fn driver_for(provider: Provider) -> Box<dyn ProviderDriver> {
    match provider {
        Provider::Claude => Box::new(claude::ClaudeDriver::default()),
        Provider::Codex => Box::new(codex::CodexDriver::default()),
    }
}
