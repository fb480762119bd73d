//! Hook Runner (§4.6).
//!
//! Restricted to the five lifecycle hooks the executor actually fires
//! (`beforePhase`, `beforeTask`, `afterTask`, `onSuccess`, `onError`) rather
//! than the donor's six-event `HookEvent` (which also carries `preIteration`
//! /`postIteration`, with no task-level counterpart here). Spawn-via-shell
//! and env-var context injection are grounded on
//! `hooks/executor.rs::HookExecutor::execute_command`; the richer
//! JSON-result/exit-code-as-verdict protocol there has no use here since
//! this spec's hooks are fire-and-report, not flow-control gates.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

use crate::errors::HookError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    BeforePhase,
    BeforeTask,
    AfterTask,
    OnSuccess,
    OnError,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforePhase => "beforePhase",
            HookEvent::BeforeTask => "beforeTask",
            HookEvent::AfterTask => "afterTask",
            HookEvent::OnSuccess => "onSuccess",
            HookEvent::OnError => "onError",
        }
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for HookEvent {
    type Err = HookEventParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beforePhase" => Ok(HookEvent::BeforePhase),
            "beforeTask" => Ok(HookEvent::BeforeTask),
            "afterTask" => Ok(HookEvent::AfterTask),
            "onSuccess" => Ok(HookEvent::OnSuccess),
            "onError" => Ok(HookEvent::OnError),
            _ => Err(HookEventParseError(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown hook event '{0}'")]
pub struct HookEventParseError(String);

/// Context injected as env vars per spec §6, mirroring
/// `hooks/executor.rs`'s `FORGE_EVENT`/`FORGE_PHASE` pattern but with the
/// task-level vars this spec's hooks need.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub project: String,
    pub phase: String,
    pub task_id: Option<String>,
    pub task_name: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
}

impl HookContext {
    fn env_vars(&self) -> HashMap<&'static str, String> {
        let mut vars = HashMap::new();
        vars.insert("PROJECT", self.project.clone());
        vars.insert("PHASE", self.phase.clone());
        vars.insert("TASK_ID", self.task_id.clone().unwrap_or_default());
        vars.insert("TASK_NAME", self.task_name.clone().unwrap_or_default());
        vars.insert("STATUS", self.status.clone().unwrap_or_default());
        vars.insert("ERROR", self.error.clone().unwrap_or_default());
        vars
    }
}

pub struct HookRunner {
    project_root: PathBuf,
    timeout_ms: u64,
}

impl HookRunner {
    pub fn new(project_root: PathBuf, timeout_ms: u64) -> Self {
        Self { project_root, timeout_ms }
    }

    /// Run `command` for `event` via `sh -c`. A non-zero exit is reported as
    /// `HookError::HookFailure`; the caller (executor) decides whether a
    /// hook failure is fatal per event (e.g. `beforeTask` blocks the task,
    /// `onError` is best-effort logging).
    pub async fn run(&self, event: HookEvent, command: &str, context: &HookContext) -> Result<(), HookError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for (key, value) in context.env_vars() {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(HookError::Spawn)?;

        let output = match timeout(Duration::from_millis(self.timeout_ms), child.wait_with_output()).await {
            Ok(result) => result.map_err(HookError::Spawn)?,
            Err(_) => {
                return Err(HookError::Timeout {
                    timeout_ms: self.timeout_ms,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(target: "hooks", event = %event, "hook exited non-zero");
            return Err(HookError::HookFailure {
                event: event.to_string(),
                message: stderr,
            });
        }

        Ok(())
    }
}
