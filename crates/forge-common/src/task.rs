use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Estimate, Priority};

/// Status of a task within a run. Mirrors the status vocabulary phase
/// metadata uses on disk (`not_started` maps to `Pending` on load).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" | "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "blocked" => Ok(TaskStatus::Blocked),
            _ => Err(TaskStatusParseError(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid task status '{0}'")]
pub struct TaskStatusParseError(String);

/// A unit of work, identified by `T<PP>-<NNN>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    pub parallel_group: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub estimate: Estimate,
    #[serde(default)]
    pub priority: Priority,
    pub phase: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub business_rules: Vec<String>,
    #[serde(default)]
    pub testing_requirements: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
}

impl Task {
    /// Minimal record derived only from the directory/id, used when a task
    /// descriptor is missing or fails to parse. Per spec §4.1 this must never
    /// fail the load.
    pub fn minimal(id: impl Into<String>, phase: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            status: TaskStatus::Pending,
            parallel_group: 1,
            dependencies: Vec::new(),
            files: Vec::new(),
            acceptance_criteria: Vec::new(),
            estimate: Estimate::from_hours(0.0),
            priority: Priority::default(),
            phase: phase.into(),
            requirements: Vec::new(),
            business_rules: Vec::new(),
            testing_requirements: Vec::new(),
            skills: Vec::new(),
        }
    }
}

/// Status of a phase as a whole (rolled up from its tasks by planning
/// tooling; the core only reads it, never derives it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Planning,
    Synced,
    InProgress,
    Completed,
    Blocked,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseStatus::Planning => "planning",
            PhaseStatus::Synced => "synced",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Blocked => "blocked",
        };
        write!(f, "{}", s)
    }
}

/// A versioned collection of related tasks, identified by `P<PP>-<slug>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub phase_number: u32,
    pub phase_name: String,
    #[serde(default)]
    pub status: PhaseStatus,
    pub tasks: Vec<Task>,
}

impl Phase {
    pub fn new(phase_number: u32, phase_name: impl Into<String>) -> Self {
        Self {
            phase_number,
            phase_name: phase_name.into(),
            status: PhaseStatus::default(),
            tasks: Vec::new(),
        }
    }
}
