//! Executor (§4.7) — the heart of the core.
//!
//! Ties the loader, scheduler, worktree manager, agent engine, hook runner
//! and session store into the run/resume state machine. Generalises donor
//! `dag/executor.rs::DagExecutor::execute` (semaphore-bounded wave loop,
//! `PhaseEvent` emission) down to task granularity, and
//! `execute_single_phase`'s iterate-until-promise loop for the per-task
//! retry/validate/commit pipeline. `tokio::task::JoinSet` replaces the
//! donor's raw `JoinHandle` map so a chunk's failures never cancel its
//! peers, matching the spec's `allSettled` wave semantics.

use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use forge_common::{Checkpoint, CheckpointStatus, ErrorRecord, Session, Task};
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{Config, OUTER_TASK_RETRIES};
use crate::engine::{invoke_with_retries, AgentEngine};
use crate::errors::ExecutorError;
use crate::hooks::{HookContext, HookEvent, HookRunner};
use crate::loader;
use crate::scheduler::TaskGraph;
use crate::store::SessionStore;
use crate::worktree::{Worktree, WorktreeManager};

/// Progress events broadcast during a run, mirroring the donor's `PhaseEvent`
/// so an out-of-scope CLI/TUI can subscribe without polling.
#[derive(Debug, Clone)]
pub enum RunEvent {
    WaveStarted { wave: usize, tasks: Vec<String> },
    TaskStarted { task_id: String },
    TaskCompleted { task_id: String, success: bool },
    WaveCompleted { wave: usize, failed: usize },
    RunCompleted { success: bool },
}

/// One entry of a dry-run execution plan.
#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub task_id: String,
    pub wave: usize,
    pub parallel_group: u32,
    pub estimate_hours: f64,
    pub dependencies: Vec<String>,
}

pub struct Executor {
    config: Config,
    engine: Arc<dyn AgentEngine>,
    worktrees: Arc<dyn WorktreeManager>,
    hooks: HookRunner,
    store: SessionStore,
    events: Option<broadcast::Sender<RunEvent>>,
}

impl Executor {
    pub fn new(
        config: Config,
        engine: Arc<dyn AgentEngine>,
        worktrees: Arc<dyn WorktreeManager>,
        store: SessionStore,
    ) -> Self {
        let hooks = HookRunner::new(config.project_root.clone(), config.timeout_ms);
        Self {
            config,
            engine,
            worktrees,
            hooks,
            store,
            events: None,
        }
    }

    pub fn with_event_channel(mut self, capacity: usize) -> (Self, broadcast::Receiver<RunEvent>) {
        let (tx, rx) = broadcast::channel(capacity);
        self.events = Some(tx);
        (self, rx)
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Compute the execution plan for `phase` without running anything.
    pub fn dry_run(&self, phase: &str) -> Result<Vec<PlannedTask>, ExecutorError> {
        let tasks = loader::load_tasks(&self.config.specs_root, phase)?;
        let graph = TaskGraph::build(tasks)?;
        let waves = graph.compute_waves()?;

        let mut plan = Vec::new();
        for (wave_idx, wave) in waves.iter().enumerate() {
            for group in wave {
                for task in group {
                    plan.push(PlannedTask {
                        task_id: task.id.clone(),
                        wave: wave_idx,
                        parallel_group: task.parallel_group,
                        estimate_hours: task.estimate.hours(),
                        dependencies: task.dependencies.clone(),
                    });
                }
            }
        }
        Ok(plan)
    }

    /// Start a fresh run over `phase`'s full task set. Scheduling is
    /// validated (dependencies resolve, no cycle) before any session is
    /// persisted, so an unschedulable phase never leaves a session behind.
    pub async fn run(&self, project: &str, phase: &str) -> Result<Session, ExecutorError> {
        let tasks = loader::load_tasks(&self.config.specs_root, phase)?;
        let waves = plan_waves(tasks)?;
        let task_ids: Vec<String> = waves.iter().flatten().flatten().map(|t| t.id.clone()).collect();

        let mut session = Session::new(project, phase, task_ids);
        self.store.create_session(&session)?;

        self.run_hook(HookEvent::BeforePhase, &session, None, None, None).await;
        self.execute_waves(&mut session, waves).await?;
        Ok(session)
    }

    /// Resume the most recently active session for `project`/`phase`, or the
    /// given `session_id` if provided. Per spec §4.7 step 3-5: a crashed
    /// mid-task run prepends `currentTask` back onto `pendingTasks` before
    /// the scheduler is invoked fresh on the reduced set.
    pub async fn resume(&self, project: &str, phase: &str) -> Result<Option<Session>, ExecutorError> {
        let mut session = match self.store.find_active_session(project, phase)? {
            Some(s) => s,
            None => {
                info!(target: "executor", project, phase, "no active session to resume");
                return Ok(None);
            }
        };

        if let Some(current) = session.current_task.take() {
            warn!(target: "executor", task_id = %current, "resuming interrupted task");
            session.pending_tasks.insert(0, current);
            self.store.save_session(&session)?;
        }

        // The scheduler only ever sees `remaining`, so any dependency it
        // must resolve inside that set. A dependency on an already-completed
        // task is satisfied but lives outside the set; drop that edge. A
        // dependency on a *failed* task is never silently promoted to
        // satisfied (preserved open question) — its task is left out of
        // this run entirely and stays in `pendingTasks` untouched.
        let remaining_ids: Vec<String> = session.pending_tasks.clone();
        let mut remaining = Vec::new();
        for id in &remaining_ids {
            let Some(mut task) = loader::load_task(&self.config.specs_root, id)? else {
                continue;
            };
            if task.dependencies.iter().any(|d| session.failed_tasks.contains(d)) {
                continue;
            }
            task.dependencies.retain(|d| remaining_ids.contains(d));
            remaining.push(task);
        }

        let waves = plan_waves(remaining)?;
        self.execute_waves(&mut session, waves).await?;
        Ok(Some(session))
    }

    async fn execute_waves(&self, session: &mut Session, waves: Vec<Vec<Vec<Task>>>) -> Result<(), ExecutorError> {
        if waves.is_empty() {
            self.emit(RunEvent::RunCompleted { success: true });
            return Ok(());
        }

        let sequential = self.config.max_parallel <= 1;
        let mut run_failed = false;

        'waves: for (wave_idx, wave) in waves.into_iter().enumerate() {
            let wave_task_ids: Vec<String> = wave.iter().flatten().map(|t| t.id.clone()).collect();
            self.emit(RunEvent::WaveStarted {
                wave: wave_idx,
                tasks: wave_task_ids,
            });
            let mut wave_failed = 0usize;

            for group in wave {
                if sequential {
                    for task in group {
                        let ok = self.run_single_task(session, task).await;
                        if !ok {
                            wave_failed += 1;
                            run_failed = true;
                            break 'waves;
                        }
                    }
                    continue;
                }

                for chunk in group.chunks(self.config.max_parallel) {
                    let mut set = JoinSet::new();
                    for task in chunk {
                        let task: Task = task.clone();
                        self.emit(RunEvent::TaskStarted { task_id: task.id.clone() });
                        self.run_hook(HookEvent::BeforeTask, session, Some(&task.id), Some(&task.name), None)
                            .await;
                        let this = self.clone_for_task();
                        set.spawn(async move { this.run(task).await });
                    }

                    while let Some(res) = set.join_next().await {
                        match res {
                            Ok((task_id, outcome)) => {
                                let success = outcome_success(&outcome);
                                self.apply_task_outcome(session, &task_id, outcome).await;
                                if !success {
                                    wave_failed += 1;
                                    run_failed = true;
                                }
                            }
                            Err(e) => {
                                error!(target: "executor", error = %e, "task join failed");
                                wave_failed += 1;
                                run_failed = true;
                            }
                        }
                    }
                }
            }

            self.emit(RunEvent::WaveCompleted {
                wave: wave_idx,
                failed: wave_failed,
            });
        }

        self.emit(RunEvent::RunCompleted { success: !run_failed });
        if run_failed {
            self.run_hook(HookEvent::OnError, session, None, None, None).await;
        } else {
            self.run_hook(HookEvent::OnSuccess, session, None, None, None).await;
        }
        Ok(())
    }

    /// Sequential-mode helper: drives one task end to end against the shared
    /// `session`, recording the outcome before returning whether it succeeded.
    /// Marks `currentTask` before the pipeline starts so a crash mid-task is
    /// visible to `resume` (§4.7 step 3).
    async fn run_single_task(&self, session: &mut Session, task: Task) -> bool {
        session.current_task = Some(task.id.clone());
        if let Err(e) = self.store.save_session(session) {
            error!(target: "executor", task_id = %task.id, error = %e, "failed to persist current_task");
        }
        self.emit(RunEvent::TaskStarted { task_id: task.id.clone() });
        self.run_hook(HookEvent::BeforeTask, session, Some(&task.id), Some(&task.name), None)
            .await;

        let (task_id, outcome) = self.clone_for_task().run(task).await;
        let success = outcome_success(&outcome);
        self.apply_task_outcome(session, &task_id, outcome).await;
        success
    }

    /// A lightweight clone sharing the engine/worktree handles, used so
    /// parallel chunks can each own a `TaskRunner` without a shared `&self`
    /// borrow across an `.await` inside `JoinSet::spawn`.
    fn clone_for_task(&self) -> TaskRunner {
        TaskRunner {
            config: self.config.clone(),
            engine: self.engine.clone(),
            worktrees: self.worktrees.clone(),
        }
    }

    async fn apply_task_outcome(&self, session: &mut Session, task_id: &str, outcome: TaskOutcome) {
        let error_msg = match &outcome {
            TaskOutcome::Failed { message, .. } => Some(message.clone()),
            TaskOutcome::Completed { .. } => None,
        };
        session.pending_tasks.retain(|id| id != task_id);
        session.current_task = None;

        let now = Utc::now();
        match &outcome {
            TaskOutcome::Completed {
                pr_url,
                duration_ms,
                worktree_path,
                branch,
            } => {
                session.completed_tasks.push(task_id.to_string());
                if let Some(url) = pr_url {
                    session.prs.insert(task_id.to_string(), url.clone());
                }
                session.worktrees.insert(task_id.to_string(), worktree_path.clone());
                session.branches.insert(task_id.to_string(), branch.clone());
                session.errors.entry(task_id.to_string()).and_modify(|e| e.resolved = true);
                let checkpoint = Checkpoint {
                    timestamp: now,
                    task_id: task_id.to_string(),
                    status: CheckpointStatus::Completed,
                    pr_link: pr_url.clone(),
                    duration_ms: Some(*duration_ms),
                    error: None,
                };
                if let Err(e) = self.store.record_checkpoint(session.id, &checkpoint) {
                    error!(target: "executor", task_id, error = %e, "failed to record checkpoint");
                }
            }
            TaskOutcome::Failed { message, attempts, duration_ms } => {
                session.failed_tasks.push(task_id.to_string());
                session.errors.insert(
                    task_id.to_string(),
                    ErrorRecord {
                        iterations: *attempts,
                        last_error: message.clone(),
                        retried: *attempts > 1,
                        resolved: false,
                    },
                );
                let checkpoint = Checkpoint {
                    timestamp: now,
                    task_id: task_id.to_string(),
                    status: CheckpointStatus::Failed,
                    pr_link: None,
                    duration_ms: Some(*duration_ms),
                    error: Some(message.clone()),
                };
                if let Err(e) = self.store.record_checkpoint(session.id, &checkpoint) {
                    error!(target: "executor", task_id, error = %e, "failed to record checkpoint");
                }
            }
        }

        if let Err(e) = self.store.save_session(session) {
            error!(target: "executor", task_id, error = %e, "failed to persist session");
        }

        self.run_hook(HookEvent::AfterTask, session, Some(task_id), None, error_msg.as_deref())
            .await;

        self.emit(RunEvent::TaskCompleted {
            task_id: task_id.to_string(),
            success: outcome_success(&outcome),
        });
    }

    async fn run_hook(
        &self,
        event: HookEvent,
        session: &Session,
        task_id: Option<&str>,
        task_name: Option<&str>,
        error_msg: Option<&str>,
    ) {
        let Some(command) = self.config.hooks.get(event.as_str()) else {
            return;
        };
        let context = HookContext {
            project: session.project.clone(),
            phase: session.phase.clone(),
            task_id: task_id.map(String::from),
            task_name: task_name.map(String::from),
            status: Some(if error_msg.is_some() { "error" } else { "success" }.to_string()),
            error: error_msg.map(String::from),
        };
        if let Err(e) = self.hooks.run(event, command, &context).await {
            warn!(target: "executor", %event, error = %e, "hook failed");
        }
    }
}

/// Validates scheduling (dependencies resolve, no cycle) and materialises
/// owned waves. Called before any session-store mutation so an unschedulable
/// task set never leaves a session behind.
fn plan_waves(tasks: Vec<Task>) -> Result<Vec<Vec<Vec<Task>>>, ExecutorError> {
    if tasks.is_empty() {
        return Ok(Vec::new());
    }
    let graph = TaskGraph::build(tasks)?;
    let waves = graph.compute_waves()?;
    Ok(waves
        .into_iter()
        .map(|wave| wave.into_iter().map(|group| group.into_iter().cloned().collect()).collect())
        .collect())
}

fn outcome_success(outcome: &TaskOutcome) -> bool {
    matches!(outcome, TaskOutcome::Completed { .. })
}

enum TaskOutcome {
    Completed {
        pr_url: Option<String>,
        duration_ms: u64,
        worktree_path: String,
        branch: String,
    },
    Failed {
        message: String,
        attempts: u32,
        duration_ms: u64,
    },
}

/// Owns only what a single task's pipeline needs, so it can be spawned onto
/// a `JoinSet` without borrowing the parent `Executor`.
struct TaskRunner {
    config: Config,
    engine: Arc<dyn AgentEngine>,
    worktrees: Arc<dyn WorktreeManager>,
}

impl TaskRunner {
    async fn run(&self, task: Task) -> (String, TaskOutcome) {
        let task_id = task.id.clone();
        let started = std::time::Instant::now();
        let base_branch = "HEAD";

        let mut last_error = String::new();
        let mut attempts = 0u32;

        for attempt in 0..=OUTER_TASK_RETRIES {
            attempts = attempt + 1;

            let worktree = match self.worktrees.create(&task_id, base_branch).await {
                Ok(wt) => wt,
                Err(e) => {
                    last_error = format!("failed to create worktree: {}", e);
                    continue;
                }
            };

            match self.run_once(&task, &worktree).await {
                Ok(pr_url) => {
                    return (
                        task_id,
                        TaskOutcome::Completed {
                            pr_url,
                            duration_ms: started.elapsed().as_millis() as u64,
                            worktree_path: worktree.path.display().to_string(),
                            branch: worktree.branch.clone(),
                        },
                    );
                }
                Err(e) => {
                    last_error = e.to_string();
                    let _ = self.worktrees.remove(&worktree).await;
                }
            }
        }

        (
            task_id,
            TaskOutcome::Failed {
                message: last_error,
                attempts,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        )
    }

    async fn run_once(&self, task: &Task, worktree: &Worktree) -> Result<Option<String>, ExecutorError> {
        let prompt = build_prompt(task);

        let result = invoke_with_retries(
            self.engine.as_ref(),
            &prompt,
            &worktree.path,
            self.config.timeout_ms,
            &self.config.completion_token,
            self.config.max_retries,
        )
        .await?;

        if !result.success && !result.completed {
            return Err(crate::errors::EngineError::AgentNonZero {
                exit_code: result.exit_code,
            }
            .into());
        }

        if !self.config.fast {
            if let Some(lint) = &self.config.lint_cmd {
                self.run_validation_command(task, &worktree.path, lint).await?;
            }
            if let Some(test) = &self.config.test_cmd {
                self.run_validation_command(task, &worktree.path, test).await?;
            }
        }

        let message = format!("{}: {}\n\nvia forge agent executor", task.id, task.name);
        match self.worktrees.commit(worktree, &message).await {
            Ok(_) => {}
            Err(crate::errors::WorktreeError::NothingToCommit { .. }) => {}
            Err(e) => {
                return Err(ExecutorError::CommitPushFailure {
                    task_id: task.id.clone(),
                    message: e.to_string(),
                });
            }
        }

        if let Err(e) = self.worktrees.push(worktree).await {
            return Err(ExecutorError::CommitPushFailure {
                task_id: task.id.clone(),
                message: e.to_string(),
            });
        }

        let pr_title = format!("{}: {}", task.id, task.name);
        let pr_body = task.description.clone().unwrap_or_default();
        let pr_url = match self.worktrees.open_pr(worktree, &pr_title, &pr_body).await {
            Ok(url) => url,
            Err(e) => {
                warn!(target: "executor", task_id = %task.id, error = %e, "PR creation failed (non-fatal)");
                None
            }
        };

        Ok(pr_url)
    }

    async fn run_validation_command(
        &self,
        task: &Task,
        cwd: &std::path::Path,
        command: &str,
    ) -> Result<(), ExecutorError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                error!(target: "executor", task_id = %task.id, command, error = %e, "validation command failed to spawn");
                ExecutorError::ValidationFailure {
                    task_id: task.id.clone(),
                    command: command.to_string(),
                    exit_code: -1,
                }
            })?;

        if !output.status.success() {
            return Err(ExecutorError::ValidationFailure {
                task_id: task.id.clone(),
                command: command.to_string(),
                exit_code: output.status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }
}

fn build_prompt(task: &Task) -> String {
    let mut prompt = format!("Task {}: {}\n", task.id, task.name);
    if let Some(desc) = &task.description {
        prompt.push_str(desc);
        prompt.push('\n');
    }
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\nAcceptance criteria:\n");
        for c in &task.acceptance_criteria {
            prompt.push_str(&format!("- {}\n", c));
        }
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::AgentResult;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct MockEngine {
        result: StdMutex<Option<AgentResult>>,
    }

    #[async_trait]
    impl AgentEngine for MockEngine {
        async fn invoke(
            &self,
            _prompt: &str,
            _cwd: &Path,
            _timeout_ms: u64,
            _completion_token: &str,
        ) -> Result<AgentResult, crate::errors::EngineError> {
            Ok(self.result.lock().unwrap().take().unwrap())
        }
    }

    struct MockWorktrees;

    #[async_trait]
    impl WorktreeManager for MockWorktrees {
        async fn create(&self, task_id: &str, _base_branch: &str) -> Result<Worktree, crate::errors::WorktreeError> {
            Ok(Worktree {
                task_id: task_id.to_string(),
                path: std::env::temp_dir(),
                branch: format!("forge/{}", task_id.to_lowercase()),
            })
        }
        async fn commit(&self, _w: &Worktree, _m: &str) -> Result<String, crate::errors::WorktreeError> {
            Err(crate::errors::WorktreeError::NothingToCommit {
                task_id: "x".into(),
            })
        }
        async fn push(&self, _w: &Worktree) -> Result<(), crate::errors::WorktreeError> {
            Ok(())
        }
        async fn open_pr(
            &self,
            _w: &Worktree,
            _t: &str,
            _b: &str,
        ) -> Result<Option<String>, crate::errors::WorktreeError> {
            Ok(None)
        }
        async fn remove(&self, _w: &Worktree) -> Result<(), crate::errors::WorktreeError> {
            Ok(())
        }
    }

    /// Scripted multi-call engine double, unlike `MockEngine` which only
    /// supports a single invocation. Used for scenarios spanning several
    /// attempts (outer retries, engine retries).
    struct ScriptedMockEngine {
        results: StdMutex<Vec<AgentResult>>,
    }

    impl ScriptedMockEngine {
        fn always_ok() -> Self {
            Self {
                results: StdMutex::new(Vec::new()),
            }
        }

        fn fail_then_ok(failures: usize) -> Self {
            let mut results = vec![failing_result(); failures];
            results.push(ok_result());
            results.reverse();
            Self {
                results: StdMutex::new(results),
            }
        }
    }

    #[async_trait]
    impl AgentEngine for ScriptedMockEngine {
        async fn invoke(
            &self,
            _prompt: &str,
            _cwd: &Path,
            _timeout_ms: u64,
            _completion_token: &str,
        ) -> Result<AgentResult, crate::errors::EngineError> {
            Ok(self.results.lock().unwrap().pop().unwrap_or_else(ok_result))
        }
    }

    fn failing_result() -> AgentResult {
        AgentResult {
            success: false,
            output: String::new(),
            exit_code: 1,
            duration_ms: 5,
            completed: false,
            completion_payload: None,
            error: Some("not yet".into()),
        }
    }

    fn ok_result() -> AgentResult {
        AgentResult {
            success: true,
            output: "<promise>COMPLETE</promise>".into(),
            exit_code: 0,
            duration_ms: 10,
            completed: true,
            completion_payload: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn single_task_completes_and_is_checkpointed() {
        let dir = tempdir().unwrap();
        let config = crate::config::test_config(dir.path());
        let store = SessionStore::open_in_memory().unwrap();
        let engine: Arc<dyn AgentEngine> = Arc::new(MockEngine {
            result: StdMutex::new(Some(ok_result())),
        });
        let worktrees: Arc<dyn WorktreeManager> = Arc::new(MockWorktrees);
        let executor = Executor::new(config, engine, worktrees, store);

        let mut session = Session::new("proj", "p01", vec!["T01-001".into()]);
        executor.store.create_session(&session).unwrap();
        let task = Task::minimal("T01-001", "p01");

        let waves = plan_waves(vec![task]).unwrap();
        executor.execute_waves(&mut session, waves).await.unwrap();

        assert_eq!(session.completed_tasks, vec!["T01-001".to_string()]);
        assert!(session.pending_tasks.is_empty());
        let checkpoints = executor.store.list_checkpoints(session.id).unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].status, CheckpointStatus::Completed);
    }

    #[tokio::test]
    async fn completed_task_records_its_worktree_and_branch_on_the_session() {
        let dir = tempdir().unwrap();
        let config = crate::config::test_config(dir.path());
        let store = SessionStore::open_in_memory().unwrap();
        let engine: Arc<dyn AgentEngine> = Arc::new(MockEngine {
            result: StdMutex::new(Some(ok_result())),
        });
        let worktrees: Arc<dyn WorktreeManager> = Arc::new(MockWorktrees);
        let executor = Executor::new(config, engine, worktrees, store);

        let mut session = Session::new("proj", "p01", vec!["T01-001".into()]);
        executor.store.create_session(&session).unwrap();
        let task = Task::minimal("T01-001", "p01");

        let waves = plan_waves(vec![task]).unwrap();
        executor.execute_waves(&mut session, waves).await.unwrap();

        assert_eq!(
            session.branches.get("T01-001").unwrap(),
            "forge/t01-001"
        );
        assert!(session.worktrees.contains_key("T01-001"));
    }

    #[tokio::test]
    async fn linear_three_task_phase_completes_in_three_waves() {
        let dir = tempdir().unwrap();
        let config = crate::config::test_config(dir.path());
        let store = SessionStore::open_in_memory().unwrap();
        let engine: Arc<dyn AgentEngine> = Arc::new(ScriptedMockEngine::always_ok());
        let worktrees: Arc<dyn WorktreeManager> = Arc::new(MockWorktrees);
        let executor = Executor::new(config, engine, worktrees, store);

        let mut t1 = Task::minimal("T00-001", "p00");
        let mut t2 = Task::minimal("T00-002", "p00");
        t2.dependencies = vec!["T00-001".into()];
        let mut t3 = Task::minimal("T00-003", "p00");
        t3.dependencies = vec!["T00-002".into()];

        let mut session = Session::new("proj", "p00", vec![t1.id.clone(), t2.id.clone(), t3.id.clone()]);
        executor.store.create_session(&session).unwrap();
        let waves = plan_waves(vec![t1, t2, t3]).unwrap();
        assert_eq!(waves.len(), 3);

        executor.execute_waves(&mut session, waves).await.unwrap();

        assert_eq!(session.completed_tasks.len(), 3);
        assert!(session.pending_tasks.is_empty());
        assert_eq!(executor.store.list_checkpoints(session.id).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cyclic_dependencies_are_rejected_before_any_session_exists() {
        let mut x = Task::minimal("T00-X", "p00");
        x.dependencies = vec!["T00-Y".into()];
        let mut y = Task::minimal("T00-Y", "p00");
        y.dependencies = vec!["T00-X".into()];

        let err = plan_waves(vec![x, y]).unwrap_err();
        match err {
            ExecutorError::Scheduler(crate::errors::SchedulerError::CircularDependency { path }) => {
                assert!(path.contains(&"T00-X".to_string()));
                assert!(path.contains(&"T00-Y".to_string()));
            }
            other => panic!("expected CircularDependency, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn engine_retries_until_success_within_one_outer_attempt() {
        let dir = tempdir().unwrap();
        let config = crate::config::test_config(dir.path());
        let store = SessionStore::open_in_memory().unwrap();
        let engine: Arc<dyn AgentEngine> = Arc::new(ScriptedMockEngine::fail_then_ok(2));
        let worktrees: Arc<dyn WorktreeManager> = Arc::new(MockWorktrees);
        let executor = Executor::new(config, engine, worktrees, store);

        let mut session = Session::new("proj", "p01", vec!["T01-001".into()]);
        executor.store.create_session(&session).unwrap();
        let task = Task::minimal("T01-001", "p01");
        let waves = plan_waves(vec![task]).unwrap();
        executor.execute_waves(&mut session, waves).await.unwrap();

        assert_eq!(session.completed_tasks, vec!["T01-001".to_string()]);
        assert!(session.failed_tasks.is_empty());
    }

    #[tokio::test]
    async fn validation_failure_exhausts_outer_retries_and_fails_the_task() {
        let dir = tempdir().unwrap();
        let mut config = crate::config::test_config(dir.path());
        config.test_cmd = Some("exit 1".to_string());
        let store = SessionStore::open_in_memory().unwrap();
        let engine: Arc<dyn AgentEngine> = Arc::new(ScriptedMockEngine::always_ok());
        let worktrees: Arc<dyn WorktreeManager> = Arc::new(MockWorktrees);
        let executor = Executor::new(config, engine, worktrees, store);

        let mut session = Session::new("proj", "p01", vec!["T01-001".into()]);
        executor.store.create_session(&session).unwrap();
        let task = Task::minimal("T01-001", "p01");
        let waves = plan_waves(vec![task]).unwrap();
        executor.execute_waves(&mut session, waves).await.unwrap();

        assert_eq!(session.failed_tasks, vec!["T01-001".to_string()]);
        let error = session.errors.get("T01-001").unwrap();
        assert_eq!(error.iterations, 3);
        assert!(!error.resolved);
    }

    #[tokio::test]
    async fn independent_tasks_run_as_one_parallel_wave() {
        let dir = tempdir().unwrap();
        let mut config = crate::config::test_config(dir.path());
        config.max_parallel = 4;
        let store = SessionStore::open_in_memory().unwrap();
        let engine: Arc<dyn AgentEngine> = Arc::new(ScriptedMockEngine::always_ok());
        let worktrees: Arc<dyn WorktreeManager> = Arc::new(MockWorktrees);
        let executor = Executor::new(config, engine, worktrees, store);

        let a = Task::minimal("T00-001", "p00");
        let b = Task::minimal("T00-002", "p00");
        let c = Task::minimal("T00-003", "p00");

        let mut session = Session::new(
            "proj",
            "p00",
            vec![a.id.clone(), b.id.clone(), c.id.clone()],
        );
        executor.store.create_session(&session).unwrap();
        let waves = plan_waves(vec![a, b, c]).unwrap();
        assert_eq!(waves.len(), 1, "independent tasks share a single wave");
        assert_eq!(waves[0][0].len(), 3, "all three fit in one parallel group");

        executor.execute_waves(&mut session, waves).await.unwrap();

        assert_eq!(session.completed_tasks.len(), 3);
        assert!(session.pending_tasks.is_empty());
        assert!(session.current_task.is_none());
    }

    #[tokio::test]
    async fn resume_reschedules_the_interrupted_current_task() {
        let dir = tempdir().unwrap();
        let config = crate::config::test_config(dir.path());
        let store = SessionStore::open_in_memory().unwrap();
        let engine: Arc<dyn AgentEngine> = Arc::new(ScriptedMockEngine::always_ok());
        let worktrees: Arc<dyn WorktreeManager> = Arc::new(MockWorktrees);
        let executor = Executor::new(config, engine, worktrees, store);

        // Simulate a crash mid-task: T01-001 already completed, T01-002 was
        // in flight when the process died, T01-003 never started.
        let mut session = Session::new(
            "proj",
            "p01",
            vec!["T01-002".into(), "T01-003".into()],
        );
        session.completed_tasks.push("T01-001".into());
        session.current_task = Some("T01-002".into());
        session.pending_tasks = vec!["T01-003".into()];
        executor.store.create_session(&session).unwrap();

        assert!(session.current_task.is_some(), "crash left current_task set on disk");

        let mut resumed = executor.store.find_active_session("proj", "p01").unwrap().unwrap();
        assert_eq!(resumed.current_task.as_deref(), Some("T01-002"));

        if let Some(current) = resumed.current_task.take() {
            resumed.pending_tasks.insert(0, current);
        }
        assert_eq!(resumed.pending_tasks, vec!["T01-002".to_string(), "T01-003".to_string()]);

        let task2 = Task::minimal("T01-002", "p01");
        let task3 = Task::minimal("T01-003", "p01");
        let waves = plan_waves(vec![task2, task3]).unwrap();
        executor.execute_waves(&mut resumed, waves).await.unwrap();

        assert_eq!(
            resumed.completed_tasks,
            vec!["T01-001".to_string(), "T01-002".to_string(), "T01-003".to_string()]
        );
        assert!(resumed.pending_tasks.is_empty());
        assert!(resumed.current_task.is_none());
    }

    #[tokio::test]
    async fn dry_run_returns_empty_plan_for_missing_phase() {
        let dir = tempdir().unwrap();
        let config = crate::config::test_config(dir.path());
        let store = SessionStore::open_in_memory().unwrap();
        let engine: Arc<dyn AgentEngine> = Arc::new(MockEngine {
            result: StdMutex::new(None),
        });
        let worktrees: Arc<dyn WorktreeManager> = Arc::new(MockWorktrees);
        let executor = Executor::new(config, engine, worktrees, store);

        let plan = executor.dry_run("p99").unwrap();
        assert!(plan.is_empty());
    }
}
