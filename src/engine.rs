//! Agent Engine (§4.4).
//!
//! Spawns the configured agent subprocess, streams stdout, and classifies
//! each line the way `factory/agent_executor.rs::OutputParser` does.
//! Completion detection and the spawn/stdin/stream loop generalise
//! `orchestrator/runner.rs::ClaudeRunner::run_iteration`. `AgentEngine` is a
//! trait object (not an enum of known engines) so new agent backends can be
//! added without touching the executor — see DESIGN.md for why this departs
//! from the donor's single hardcoded `ClaudeRunner`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::errors::EngineError;

/// Outcome of a single agent invocation (no retry semantics here).
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub success: bool,
    pub output: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub completed: bool,
    pub completion_payload: Option<Value>,
    pub error: Option<String>,
}

#[async_trait]
pub trait AgentEngine: Send + Sync {
    /// Run the agent once against `prompt` inside `cwd`, enforcing
    /// `timeout_ms`. `completion_token` is the bare token (e.g. `"COMPLETE"`);
    /// the engine looks for `<promise>{token}</promise>` or
    /// `<promise>{token}:{json}</promise>` in the combined output.
    async fn invoke(
        &self,
        prompt: &str,
        cwd: &Path,
        timeout_ms: u64,
        completion_token: &str,
    ) -> Result<AgentResult, EngineError>;
}

/// Finds a completion token in `output`. `None` if absent; `Some(None)` if
/// present with no JSON payload; `Some(Some(value))` if present with one.
fn find_completion(output: &str, token: &str) -> Option<Option<Value>> {
    let open = format!("<promise>{}", token);
    let idx = output.find(&open)?;
    let after = &output[idx + open.len()..];
    if let Some(rest) = after.strip_prefix(':') {
        let end = rest.find("</promise>")?;
        let payload = serde_json::from_str(&rest[..end]).ok();
        Some(payload)
    } else if after.starts_with("</promise>") {
        Some(None)
    } else {
        None
    }
}

/// Subprocess-backed engine: spawns `agent_cmd`, writes `prompt` to stdin,
/// streams stdout line-by-line, accumulates the combined text.
pub struct SubprocessEngine {
    agent_cmd: String,
    extra_args: Vec<String>,
}

impl SubprocessEngine {
    /// `dangerously_skip_permissions` and `model` are folded into the
    /// argument list once at construction rather than threaded through every
    /// `invoke` call, since they're fixed for the process's lifetime.
    pub fn new(
        agent_cmd: impl Into<String>,
        mut extra_args: Vec<String>,
        dangerously_skip_permissions: bool,
        model: Option<String>,
    ) -> Self {
        if dangerously_skip_permissions {
            extra_args.push("--dangerously-skip-permissions".to_string());
        }
        if let Some(model) = model {
            extra_args.push("--model".to_string());
            extra_args.push(model);
        }
        Self {
            agent_cmd: agent_cmd.into(),
            extra_args,
        }
    }
}

#[async_trait]
impl AgentEngine for SubprocessEngine {
    async fn invoke(
        &self,
        prompt: &str,
        cwd: &Path,
        timeout_ms: u64,
        completion_token: &str,
    ) -> Result<AgentResult, EngineError> {
        let started = std::time::Instant::now();

        let mut cmd = Command::new(&self.agent_cmd);
        cmd.args(&self.extra_args)
            .current_dir(cwd)
            .env("CI", "true")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(EngineError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let stdout = child.stdout.take().expect("stdout piped");
        let mut reader = BufReader::new(stdout).lines();
        let mut combined = String::new();

        let run = async {
            while let Some(line) = reader.next_line().await? {
                combined.push_str(&line);
                combined.push('\n');
            }
            Ok::<_, std::io::Error>(())
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(EngineError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                return Err(EngineError::AgentTimeout { timeout_ms });
            }
        }

        let status = child.wait().await?;
        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = started.elapsed().as_millis() as u64;

        let completion = find_completion(&combined, completion_token);
        let completed = completion.is_some();
        let completion_payload = completion.flatten();
        let success = exit_code == 0;

        info!(
            target: "engine",
            exit_code,
            completed,
            duration_ms,
            "agent invocation finished"
        );

        Ok(AgentResult {
            success,
            output: combined,
            exit_code,
            duration_ms,
            completed,
            completion_payload,
            error: if success || completed {
                None
            } else {
                Some(format!("agent exited {} without completion token", exit_code))
            },
        })
    }
}

/// `min(1000 * 2^attempt, 30000)` ms, per spec §4.4's retry envelope.
fn backoff_ms(attempt: u32) -> u64 {
    let pow = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    (1000u64.saturating_mul(pow)).min(30_000)
}

/// Runs `engine` up to `max_retries + 1` times, retrying whenever an attempt
/// is neither successful nor completed. Returns the last attempt's result
/// regardless of outcome: retry exhaustion is reported via that result's
/// `success`/`completed` flags, not as a distinct error, so callers can log
/// partial output either way.
pub async fn invoke_with_retries(
    engine: &dyn AgentEngine,
    prompt: &str,
    cwd: &Path,
    timeout_ms: u64,
    completion_token: &str,
    max_retries: u32,
) -> Result<AgentResult, EngineError> {
    let attempts = max_retries + 1;
    let mut last_err = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = backoff_ms(attempt - 1);
            warn!(target: "engine", attempt, delay_ms = delay, "retrying agent invocation");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match engine.invoke(prompt, cwd, timeout_ms, completion_token).await {
            Ok(result) => {
                if result.success || result.completed {
                    return Ok(result);
                }
                last_err = None;
                if attempt == attempts - 1 {
                    return Ok(result);
                }
            }
            Err(e) => {
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or(EngineError::AgentNonZero { exit_code: -1 }))
}
