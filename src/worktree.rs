//! Worktree Manager (§4.3).
//!
//! One isolated git worktree per task, on its own branch off the project's
//! current HEAD. Diff/commit primitives use `git2` directly (grounded on
//! `tracker/git.rs::GitTracker`); worktree add/remove/push shell out to the
//! `git` CLI via `tokio::process::Command` (grounded on
//! `factory/agent_executor.rs::AgentExecutor::{setup_worktree,cleanup_worktree,merge_branch}`)
//! since git2 has no native worktree-management API. `create` is
//! resume-safe: a worktree already on disk at the canonical path is returned
//! unchanged rather than re-added. `remove` falls back to a direct
//! filesystem removal plus `git worktree prune` when the native removal
//! fails, so cleanup stays idempotent even against a worktree git itself has
//! lost track of.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use git2::{DiffOptions, Repository, Signature};
use tokio::process::Command;
use tracing::{info, warn};

use crate::errors::WorktreeError;

/// A task's isolated worktree: path on disk plus the branch checked out there.
#[derive(Debug, Clone)]
pub struct Worktree {
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
}

#[async_trait]
pub trait WorktreeManager: Send + Sync {
    async fn create(&self, task_id: &str, base_branch: &str) -> Result<Worktree, WorktreeError>;

    /// Stage and commit all changes in the worktree. Returns the commit sha,
    /// or `Err(NothingToCommit)` if the working tree is clean.
    async fn commit(&self, worktree: &Worktree, message: &str) -> Result<String, WorktreeError>;

    async fn push(&self, worktree: &Worktree) -> Result<(), WorktreeError>;

    /// Best-effort PR creation via the `gh` CLI. Failure here is reported to
    /// the caller as a typed error but never aborts the task: PR creation is
    /// explicitly best-effort per the session store's non-fatal error policy.
    async fn open_pr(&self, worktree: &Worktree, title: &str, body: &str) -> Result<Option<String>, WorktreeError>;

    async fn remove(&self, worktree: &Worktree) -> Result<(), WorktreeError>;
}

pub struct GitWorktreeManager {
    project_root: PathBuf,
}

impl GitWorktreeManager {
    pub fn new(project_root: PathBuf) -> Self {
        Self { project_root }
    }

    fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.project_root.join(".forge").join("worktrees").join(task_id)
    }

    fn branch_name(&self, task_id: &str) -> String {
        format!("forge/{}", task_id.to_ascii_lowercase())
    }

    fn has_uncommitted_changes(worktree_path: &Path) -> Result<bool, WorktreeError> {
        let repo = Repository::open(worktree_path)?;
        let mut opts = DiffOptions::new();
        opts.include_untracked(true);
        let head_tree = repo.head().ok().and_then(|h| h.peel_to_tree().ok());
        let diff = repo.diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))?;
        Ok(diff.deltas().len() > 0)
    }
}

#[async_trait]
impl WorktreeManager for GitWorktreeManager {
    async fn create(&self, task_id: &str, base_branch: &str) -> Result<Worktree, WorktreeError> {
        let path = self.worktree_path(task_id);
        let branch = self.branch_name(task_id);

        // Resume-safety: a crashed run leaves its worktree on disk. Reuse it
        // rather than failing on a second `git worktree add` for a path git
        // already tracks.
        if path.exists() {
            info!(target: "worktree", task_id, branch = %branch, "reusing existing worktree");
            return Ok(Worktree {
                task_id: task_id.to_string(),
                path,
                branch,
            });
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path_str = path.to_str().ok_or_else(|| {
            WorktreeError::Command(format!("worktree path for {} is not valid UTF-8", task_id))
        })?;

        let fetch = Command::new("git")
            .args(["fetch", "origin", base_branch])
            .current_dir(&self.project_root)
            .output()
            .await;
        match fetch {
            Ok(output) if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!(target: "worktree", task_id, error = %stderr, "git fetch failed (non-fatal)");
            }
            Err(e) => {
                warn!(target: "worktree", task_id, error = %e, "git fetch failed (non-fatal)");
            }
            Ok(_) => {}
        }

        let output = Command::new("git")
            .args(["worktree", "add", "-b", &branch, path_str, base_branch])
            .current_dir(&self.project_root)
            .output()
            .await
            .map_err(WorktreeError::Io)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(WorktreeError::WorktreeConflict {
                task_id: task_id.to_string(),
                message: stderr,
            });
        }

        info!(target: "worktree", task_id, branch = %branch, "worktree created");
        Ok(Worktree {
            task_id: task_id.to_string(),
            path,
            branch,
        })
    }

    async fn commit(&self, worktree: &Worktree, message: &str) -> Result<String, WorktreeError> {
        if !Self::has_uncommitted_changes(&worktree.path)? {
            return Err(WorktreeError::NothingToCommit {
                task_id: worktree.task_id.clone(),
            });
        }

        let repo = Repository::open(&worktree.path)?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now("forge", "forge@localhost")?;

        let commit_id = if let Some(parent) = repo.head().ok().and_then(|h| h.peel_to_commit().ok()) {
            repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?
        };

        Ok(commit_id.to_string())
    }

    async fn push(&self, worktree: &Worktree) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["push", "-u", "origin", &worktree.branch])
            .current_dir(&worktree.path)
            .output()
            .await
            .map_err(WorktreeError::Io)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(WorktreeError::Command(format!("git push failed: {}", stderr)));
        }
        Ok(())
    }

    async fn open_pr(&self, worktree: &Worktree, title: &str, body: &str) -> Result<Option<String>, WorktreeError> {
        let output = Command::new("gh")
            .args(["pr", "create", "--title", title, "--body", body, "--head", &worktree.branch])
            .current_dir(&worktree.path)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
                Ok(Some(url))
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!(target: "worktree", task_id = %worktree.task_id, error = %stderr, "PR creation failed (non-fatal)");
                Ok(None)
            }
            Err(e) => {
                warn!(target: "worktree", task_id = %worktree.task_id, error = %e, "gh CLI unavailable (non-fatal)");
                Ok(None)
            }
        }
    }

    async fn remove(&self, worktree: &Worktree) -> Result<(), WorktreeError> {
        let output = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(&worktree.path)
            .current_dir(&self.project_root)
            .output()
            .await
            .map_err(WorktreeError::Io)?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(
            target: "worktree",
            task_id = %worktree.task_id,
            error = %stderr,
            "git worktree remove failed, falling back to direct removal"
        );

        if worktree.path.exists() {
            tokio::fs::remove_dir_all(&worktree.path).await.map_err(WorktreeError::Io)?;
        }

        let prune = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.project_root)
            .output()
            .await
            .map_err(WorktreeError::Io)?;

        if !prune.status.success() {
            let stderr = String::from_utf8_lossy(&prune.stderr).trim().to_string();
            return Err(WorktreeError::Command(format!("git worktree prune failed: {}", stderr)));
        }
        Ok(())
    }
}
