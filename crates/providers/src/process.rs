//! Shared child-process runner for the CLI drivers.
//!
//! Lifetime contract: stdin is written once and closed, stdout is consumed
//! line by line, stderr is drained into a bounded ring buffer for error
//! reporting. Cancellation escalates SIGINT → SIGTERM → SIGKILL with short
//! grace windows.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use hb_domain::{Error, Result};

/// Lines of stderr retained for post-mortems.
const STDERR_RING_CAPACITY: usize = 50;

/// Grace between SIGINT and SIGTERM, and between SIGTERM and SIGKILL.
const CANCEL_GRACE: Duration = Duration::from_secs(3);

pub(crate) struct ChildSpec<'a> {
    pub program: &'a str,
    pub args: Vec<String>,
    pub workdir: &'a Path,
    /// Provider-home env overrides cleared so the child uses the shared
    /// default home.
    pub clear_env: &'a [&'a str],
}

#[derive(Debug)]
pub(crate) struct ChildOutcome {
    pub exit_code: i32,
    pub stderr_tail: String,
}

fn provider_error(provider: &str, message: impl Into<String>) -> Error {
    Error::Provider {
        provider: provider.to_string(),
        message: message.into(),
    }
}

/// Spawn the child, feed `stdin_text`, and stream stdout lines into
/// `on_line`. Returns once the child exits or cancellation completes.
pub(crate) async fn run_streaming(
    provider: &str,
    spec: ChildSpec<'_>,
    stdin_text: &str,
    cancel: &CancellationToken,
    mut on_line: impl FnMut(&str),
) -> Result<ChildOutcome> {
    let mut cmd = Command::new(spec.program);
    cmd.args(&spec.args)
        .current_dir(spec.workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for var in spec.clear_env {
        cmd.env_remove(var);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| provider_error(provider, format!("failed to spawn '{}': {e}", spec.program)))?;

    // Write the turn input and close stdin so the CLI starts the turn.
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(stdin_text.as_bytes())
            .await
            .map_err(|e| provider_error(provider, format!("writing stdin: {e}")))?;
        stdin
            .shutdown()
            .await
            .map_err(|e| provider_error(provider, format!("closing stdin: {e}")))?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| provider_error(provider, "child stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| provider_error(provider, "child stderr not captured"))?;

    // Drain stderr concurrently into a bounded ring.
    let ring: Arc<tokio::sync::Mutex<VecDeque<String>>> = Arc::new(Default::default());
    let stderr_ring = ring.clone();
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut ring = stderr_ring.lock().await;
            if ring.len() >= STDERR_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(line);
        }
    });

    let mut lines = BufReader::new(stdout).lines();
    let cancelled = loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !line.trim().is_empty() {
                            on_line(&line);
                        }
                    }
                    Ok(None) => break false,
                    Err(e) => {
                        terminate(&mut child).await;
                        stderr_task.abort();
                        return Err(provider_error(provider, format!("reading stdout: {e}")));
                    }
                }
            }
            () = cancel.cancelled() => {
                break true;
            }
        }
    };

    if cancelled {
        terminate(&mut child).await;
        stderr_task.abort();
        return Err(Error::Cancelled);
    }

    let status = child
        .wait()
        .await
        .map_err(|e| provider_error(provider, format!("waiting for child: {e}")))?;
    let _ = stderr_task.await;
    let stderr_tail = {
        let ring = ring.lock().await;
        ring.iter().cloned().collect::<Vec<_>>().join("\n")
    };

    let exit_code = status.code().unwrap_or(-1);
    if !status.success() {
        return Err(provider_error(
            provider,
            format!("exited with status {exit_code}: {stderr_tail}"),
        ));
    }
    Ok(ChildOutcome {
        exit_code,
        stderr_tail,
    })
}

/// SIGINT, grace, SIGTERM, grace, SIGKILL.
async fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return; // already reaped
    };
    let pid = Pid::from_raw(pid as i32);

    let _ = kill(pid, Signal::SIGINT);
    if wait_with_timeout(child, CANCEL_GRACE).await {
        return;
    }
    let _ = kill(pid, Signal::SIGTERM);
    if wait_with_timeout(child, CANCEL_GRACE).await {
        return;
    }
    let _ = child.kill().await;
}

async fn wait_with_timeout(child: &mut Child, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, child.wait()).await.is_ok()
}
