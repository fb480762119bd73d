//! Typed error hierarchy for the orchestrator core.
//!
//! One enum per subsystem, composed into `ForgeError` at the binary
//! boundary. Library code returns the concrete subsystem error; only
//! `main.rs` and the thin CLI command functions collapse everything into
//! `anyhow::Result`.

use thiserror::Error;

/// Errors from the task loader (§4.1).
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("failed to parse task file {path}: {message}")]
    TaskFileParse { path: String, message: String },

    #[error("failed to parse phase metadata {path}: {message}")]
    MetadataParse { path: String, message: String },

    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the scheduler (§4.2). All fatal to the run that triggers them.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("circular dependency detected: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    #[error("unschedulable tasks remain (cross-group dependency conflict): {}", remaining.join(", "))]
    UnschedulableTasks { remaining: Vec<String> },
}

/// Errors from the worktree manager (§4.3).
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("worktree conflict for task {task_id}: {message}")]
    WorktreeConflict { task_id: String, message: String },

    #[error("nothing to commit for task {task_id}")]
    NothingToCommit { task_id: String },

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git command failed: {0}")]
    Command(String),
}

/// Errors from the agent engine (§4.4).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("agent invocation timed out after {timeout_ms} ms")]
    AgentTimeout { timeout_ms: u64 },

    #[error("agent exited non-zero ({exit_code}) without emitting a completion token")]
    AgentNonZero { exit_code: i32 },

    #[error("failed to spawn agent process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("io error communicating with agent process: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the hook runner (§4.6).
#[derive(Debug, Error)]
pub enum HookError {
    #[error("{event} hook failed: {message}")]
    HookFailure { event: String, message: String },

    #[error("hook spawn failed: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("hook timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
}

/// Errors from the session store (§4.5).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session write failed: {0}")]
    SessionWriteFailure(String),

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("task {task_id} not found in session {session_id}")]
    TaskNotFound { session_id: String, task_id: String },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors from the executor (§4.7), wrapping every subsystem error plus the
/// executor's own validation/commit/PR failure kinds.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("validation failed for task {task_id}: {command} exited {exit_code}")]
    ValidationFailure {
        task_id: String,
        command: String,
        exit_code: i32,
    },

    #[error("commit/push failed for task {task_id}: {message}")]
    CommitPushFailure { task_id: String, message: String },

    /// Non-fatal: PR creation is best-effort. Kept as a typed variant so
    /// callers can distinguish "warn and continue" from real failures, per
    /// spec §7's "Warning only; task succeeds" recovery policy.
    #[error("PR creation failed for task {task_id} (non-fatal): {message}")]
    PrCreateFailure { task_id: String, message: String },

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Top-level error for binary-facing reporting.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
