//! End-to-end tests driving `Executor::run`/`resume` against real on-disk
//! task fixtures (no mocked loader) and a real `Config::load` resolution.
//! The agent engine and worktree manager are still doubles — nothing here
//! shells out to git or an actual agent subprocess — but everything above
//! that layer, including the session store, is exercised for real.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use forge::config::{CliOverrides, Config};
use forge::engine::{AgentEngine, AgentResult};
use forge::errors::{EngineError, WorktreeError};
use forge::store::SessionStore;
use forge::worktree::{Worktree, WorktreeManager};
use forge::Executor;
use tempfile::TempDir;

fn ok_result() -> AgentResult {
    AgentResult {
        success: true,
        output: "<promise>COMPLETE</promise>".into(),
        exit_code: 0,
        duration_ms: 5,
        completed: true,
        completion_payload: None,
        error: None,
    }
}

struct AlwaysOkEngine;

#[async_trait]
impl AgentEngine for AlwaysOkEngine {
    async fn invoke(
        &self,
        _prompt: &str,
        _cwd: &Path,
        _timeout_ms: u64,
        _completion_token: &str,
    ) -> Result<AgentResult, EngineError> {
        Ok(ok_result())
    }
}

/// Fails every invocation whose prompt names `crash_task` until
/// `OUTER_TASK_RETRIES` is exhausted and the task is recorded failed, then
/// succeeds on every call after that — standing in for a process that
/// crashed mid-task and is then restarted for a resume.
struct CrashingEngine {
    crash_task: String,
    already_failed: StdMutex<bool>,
}

#[async_trait]
impl AgentEngine for CrashingEngine {
    async fn invoke(
        &self,
        prompt: &str,
        _cwd: &Path,
        _timeout_ms: u64,
        _completion_token: &str,
    ) -> Result<AgentResult, EngineError> {
        if prompt.contains(&self.crash_task) && !*self.already_failed.lock().unwrap() {
            return Err(EngineError::AgentTimeout { timeout_ms: 1 });
        }
        Ok(ok_result())
    }
}

struct NullWorktrees;

#[async_trait]
impl WorktreeManager for NullWorktrees {
    async fn create(&self, task_id: &str, _base_branch: &str) -> Result<Worktree, WorktreeError> {
        Ok(Worktree {
            task_id: task_id.to_string(),
            path: std::env::temp_dir(),
            branch: format!("forge/{}", task_id.to_lowercase()),
        })
    }
    async fn commit(&self, _w: &Worktree, _m: &str) -> Result<String, WorktreeError> {
        Err(WorktreeError::NothingToCommit {
            task_id: "x".into(),
        })
    }
    async fn push(&self, _w: &Worktree) -> Result<(), WorktreeError> {
        Ok(())
    }
    async fn open_pr(&self, _w: &Worktree, _t: &str, _b: &str) -> Result<Option<String>, WorktreeError> {
        Ok(None)
    }
    async fn remove(&self, _w: &Worktree) -> Result<(), WorktreeError> {
        Ok(())
    }
}

fn write_task(phase_dir: &Path, dirname: &str, content: &str) {
    let task_dir = phase_dir.join(dirname);
    fs::create_dir_all(&task_dir).unwrap();
    fs::write(task_dir.join("task.md"), content).unwrap();
}

fn project_with_phase(phase_dirname: &str) -> (TempDir, Config) {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("docs/specs").join(phase_dirname)).unwrap();
    let config = Config::load(dir.path().to_path_buf(), CliOverrides::default()).unwrap();
    config.ensure_directories().unwrap();
    (dir, config)
}

fn executor_with(config: Config, engine: Arc<dyn AgentEngine>) -> Executor {
    let store = SessionStore::open_in_memory().unwrap();
    let worktrees: Arc<dyn WorktreeManager> = Arc::new(NullWorktrees);
    Executor::new(config, engine, worktrees, store)
}

// Scenario 1: a linear chain of three dependent tasks completes in three
// sequential waves and leaves no task pending or failed.
#[tokio::test]
async fn linear_phase_completes_end_to_end() {
    let (dir, config) = project_with_phase("P01-auth");
    let phase_dir = dir.path().join("docs/specs/P01-auth");
    write_task(&phase_dir, "T01-001-signup", "name: Build signup\n");
    write_task(
        &phase_dir,
        "T01-002-login",
        "name: Build login\ndependencies:\n  - T01-001\n",
    );
    write_task(
        &phase_dir,
        "T01-003-logout",
        "name: Build logout\ndependencies:\n  - T01-002\n",
    );

    let executor = executor_with(config, Arc::new(AlwaysOkEngine));
    let session = executor.run("proj", "p01").await.unwrap();

    assert_eq!(session.completed_tasks.len(), 3);
    assert!(session.failed_tasks.is_empty());
    assert!(session.pending_tasks.is_empty());
}

// Scenario 2: tasks sharing no dependency edge are scheduled into a single
// wave and all run without one blocking another.
#[tokio::test]
async fn independent_tasks_fan_out_into_one_wave() {
    let (dir, config) = project_with_phase("P02-batch");
    let phase_dir = dir.path().join("docs/specs/P02-batch");
    write_task(&phase_dir, "T02-001-a", "name: Job A\n");
    write_task(&phase_dir, "T02-002-b", "name: Job B\n");
    write_task(&phase_dir, "T02-003-c", "name: Job C\n");

    let mut config = config;
    config.max_parallel = 4;
    let executor = executor_with(config, Arc::new(AlwaysOkEngine));

    let plan = executor.dry_run("p02").unwrap();
    let waves: std::collections::HashSet<usize> = plan.iter().map(|p| p.wave).collect();
    assert_eq!(waves.len(), 1, "independent tasks share a single wave");

    let session = executor.run("proj", "p02").await.unwrap();
    assert_eq!(session.completed_tasks.len(), 3);
    assert!(session.failed_tasks.is_empty());
}

// Scenario 3: a cyclic phase is rejected before any session row exists.
#[tokio::test]
async fn cyclic_phase_leaves_no_session_behind() {
    let (dir, config) = project_with_phase("P03-cycle");
    let phase_dir = dir.path().join("docs/specs/P03-cycle");
    write_task(&phase_dir, "T03-001-a", "name: A\ndependencies:\n  - T03-002\n");
    write_task(&phase_dir, "T03-002-b", "name: B\ndependencies:\n  - T03-001\n");

    let session_db = config.session_db.clone();
    let store = SessionStore::open(&session_db).unwrap();
    let worktrees: Arc<dyn WorktreeManager> = Arc::new(NullWorktrees);
    let executor = Executor::new(config, Arc::new(AlwaysOkEngine), worktrees, store);

    let result = executor.run("proj", "p03").await;
    assert!(result.is_err(), "cyclic phase must not run");
    drop(executor);

    // Scheduling is validated before any session row is written, so a
    // fresh handle onto the same database still reports nothing active.
    let check_store = SessionStore::open(&session_db).unwrap();
    assert!(check_store.find_active_session("proj", "p03").unwrap().is_none());
}

// Scenario 4: a crash mid-task (the engine call never returns control) is
// recorded as `current_task`, and `resume` continues from exactly that task
// without re-running anything already completed.
#[tokio::test]
async fn resume_continues_after_a_crash_mid_task() {
    let (dir, config) = project_with_phase("P04-resume");
    let phase_dir = dir.path().join("docs/specs/P04-resume");
    write_task(&phase_dir, "T04-001-a", "name: A\n");
    write_task(&phase_dir, "T04-002-b", "name: B\ndependencies:\n  - T04-001\n");
    write_task(&phase_dir, "T04-003-c", "name: C\ndependencies:\n  - T04-002\n");

    let mut config = config;
    config.max_parallel = 1; // sequential so current_task is tracked
    let crashing = Arc::new(CrashingEngine {
        crash_task: "T04-002".to_string(),
        already_failed: StdMutex::new(false),
    });

    // First run: T04-001 completes, T04-002's engine call errors out
    // (standing in for a process crash) and the run stops with it failed.
    // A file-backed store (rather than in-memory) lets a second handle
    // below reach in and re-queue the failed task, as an external operator
    // would between a crash and a manual resume.
    let store = SessionStore::open(&config.session_db).unwrap();
    let worktrees: Arc<dyn WorktreeManager> = Arc::new(NullWorktrees);
    let first_executor = Executor::new(config.clone(), crashing.clone(), worktrees.clone(), store);
    let first = first_executor.run("proj", "p04").await.unwrap();
    assert_eq!(first.completed_tasks, vec!["T04-001".to_string()]);
    assert_eq!(first.failed_tasks, vec!["T04-002".to_string()]);
    assert_eq!(first.pending_tasks, vec!["T04-003".to_string()]);
    drop(first_executor);

    // Re-queue the failed task by hand (per the preserved open-question
    // behaviour: failed tasks are never auto-promoted) and resume. The
    // underlying process has since been "restarted", so the engine no
    // longer crashes on this task.
    *crashing.already_failed.lock().unwrap() = true;
    let mut to_resume = first;
    to_resume.failed_tasks.clear();
    to_resume.pending_tasks.insert(0, "T04-002".to_string());
    let requeue_store = SessionStore::open(&config.session_db).unwrap();
    requeue_store.save_session(&to_resume).unwrap();
    drop(requeue_store);

    let worktrees2: Arc<dyn WorktreeManager> = Arc::new(NullWorktrees);
    let resume_store = SessionStore::open(&config.session_db).unwrap();
    let resume_executor = Executor::new(config, crashing, worktrees2, resume_store);
    let resumed = resume_executor.resume("proj", "p04").await.unwrap().unwrap();
    assert_eq!(
        resumed.completed_tasks,
        vec!["T04-001".to_string(), "T04-002".to_string(), "T04-003".to_string()]
    );
    assert!(resumed.pending_tasks.is_empty());
    assert!(resumed.failed_tasks.is_empty());
}

// Scenario 5: the engine's own internal retry envelope recovers from a
// transient failure inside a single outer attempt.
#[tokio::test]
async fn engine_retry_recovers_within_one_task_attempt() {
    let (dir, config) = project_with_phase("P05-retry");
    let phase_dir = dir.path().join("docs/specs/P05-retry");
    write_task(&phase_dir, "T05-001-a", "name: Flaky\n");

    struct FlakyOnce {
        failed_once: StdMutex<bool>,
    }
    #[async_trait]
    impl AgentEngine for FlakyOnce {
        async fn invoke(
            &self,
            _prompt: &str,
            _cwd: &Path,
            _timeout_ms: u64,
            _completion_token: &str,
        ) -> Result<AgentResult, EngineError> {
            let mut failed = self.failed_once.lock().unwrap();
            if !*failed {
                *failed = true;
                return Ok(AgentResult {
                    success: false,
                    output: String::new(),
                    exit_code: 1,
                    duration_ms: 1,
                    completed: false,
                    completion_payload: None,
                    error: Some("transient".into()),
                });
            }
            Ok(ok_result())
        }
    }

    let executor = executor_with(
        config,
        Arc::new(FlakyOnce {
            failed_once: StdMutex::new(false),
        }),
    );
    let session = executor.run("proj", "p05").await.unwrap();
    assert_eq!(session.completed_tasks, vec!["T05-001".to_string()]);
    assert!(session.failed_tasks.is_empty());
}

// Scenario 6: validation (lint/test) keeps failing across every outer
// attempt, so the task is recorded as failed with the full attempt count.
#[tokio::test]
async fn persistent_validation_failure_fails_the_task() {
    let (dir, config) = project_with_phase("P06-lint");
    let phase_dir = dir.path().join("docs/specs/P06-lint");
    write_task(&phase_dir, "T06-001-a", "name: Bad\n");

    let mut config = config;
    config.test_cmd = Some("exit 1".to_string());
    let executor = executor_with(config, Arc::new(AlwaysOkEngine));

    let session = executor.run("proj", "p06").await.unwrap();
    assert_eq!(session.failed_tasks, vec!["T06-001".to_string()]);
    let error = session.errors.get("T06-001").unwrap();
    assert_eq!(error.iterations, 3);
    assert!(!error.resolved);
}

#[tokio::test]
async fn dry_run_reports_an_empty_plan_for_a_phase_with_no_tasks() {
    let (_dir, config) = project_with_phase("P07-empty");
    let executor = executor_with(config, Arc::new(AlwaysOkEngine));
    let plan = executor.dry_run("p07").unwrap();
    assert!(plan.is_empty());
}

#[tokio::test]
async fn status_reports_no_active_session_before_any_run() {
    let (dir, config) = project_with_phase("P08-status");
    let store = SessionStore::open(&config.session_db).unwrap();
    assert!(store.find_active_session("proj", "p08").unwrap().is_none());
    let _ = dir; // keep the tempdir alive for the duration of the store
}
