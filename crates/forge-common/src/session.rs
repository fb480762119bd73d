use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal status of a single checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Completed,
    Failed,
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for CheckpointStatus {
    type Err = CheckpointStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(CheckpointStatus::Completed),
            "failed" => Ok(CheckpointStatus::Failed),
            _ => Err(CheckpointStatusParseError(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid checkpoint status '{0}'")]
pub struct CheckpointStatusParseError(String);

/// A durable record of a task's terminal outcome within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub status: CheckpointStatus,
    #[serde(default)]
    pub pr_link: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Per-task error accumulator. `iterations` is monotonically increasing;
/// `resolveError` only ever flips `resolved`, never touches `iterations`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub iterations: u32,
    pub last_error: String,
    pub retried: bool,
    pub resolved: bool,
}

/// A single run instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub project: String,
    /// Canonicalised `p<PP>` form.
    pub phase: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_task: Option<String>,
    pub pending_tasks: Vec<String>,
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub failed_tasks: Vec<String>,
    #[serde(default)]
    pub worktrees: HashMap<String, String>,
    #[serde(default)]
    pub branches: HashMap<String, String>,
    #[serde(default)]
    pub prs: HashMap<String, String>,
    #[serde(default)]
    pub errors: HashMap<String, ErrorRecord>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
}

impl Session {
    pub fn new(project: impl Into<String>, phase: impl Into<String>, task_ids: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project: project.into(),
            phase: phase.into(),
            started_at: Utc::now(),
            last_checkpoint_at: None,
            current_task: None,
            pending_tasks: task_ids,
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            worktrees: HashMap::new(),
            branches: HashMap::new(),
            prs: HashMap::new(),
            errors: HashMap::new(),
            checkpoints: Vec::new(),
        }
    }

    /// A session is "active" iff `pendingTasks` is non-empty or `currentTask`
    /// is set.
    pub fn is_active(&self) -> bool {
        !self.pending_tasks.is_empty() || self.current_task.is_some()
    }
}
