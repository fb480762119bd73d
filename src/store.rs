//! Session Store (§4.5).
//!
//! `sessions` and `checkpoints` tables, generalising
//! `factory/db.rs::FactoryDb`'s `rusqlite` migration/CRUD style to the run
//! session data model instead of the donor's kanban board. Set/map fields
//! (`pending_tasks`, `worktrees`, `errors`, ...) are stored JSON-encoded in a
//! single column, same as the donor's `issues.labels` column. `delete`
//! relies on the `checkpoints` table's `ON DELETE CASCADE` rather than
//! issuing a second statement.

use std::path::Path;

use chrono::{DateTime, Utc};
use forge_common::{Checkpoint, CheckpointStatus, ErrorRecord, Session};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::errors::StoreError;

pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                project TEXT NOT NULL,
                phase TEXT NOT NULL,
                started_at TEXT NOT NULL,
                last_checkpoint_at TEXT,
                current_task TEXT,
                pending_tasks TEXT NOT NULL DEFAULT '[]',
                completed_tasks TEXT NOT NULL DEFAULT '[]',
                failed_tasks TEXT NOT NULL DEFAULT '[]',
                worktrees TEXT NOT NULL DEFAULT '{}',
                branches TEXT NOT NULL DEFAULT '{}',
                prs TEXT NOT NULL DEFAULT '{}',
                errors TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS checkpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                timestamp TEXT NOT NULL,
                task_id TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('completed', 'failed')),
                pr_link TEXT,
                duration_ms INTEGER,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_checkpoints_session ON checkpoints(session_id);
            ",
        )?;
        Ok(())
    }

    pub fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO sessions (
                id, project, phase, started_at, last_checkpoint_at, current_task,
                pending_tasks, completed_tasks, failed_tasks, worktrees, branches, prs, errors
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                session.id.to_string(),
                session.project,
                session.phase,
                session.started_at.to_rfc3339(),
                session.last_checkpoint_at.map(|t| t.to_rfc3339()),
                session.current_task,
                serde_json::to_string(&session.pending_tasks)?,
                serde_json::to_string(&session.completed_tasks)?,
                serde_json::to_string(&session.failed_tasks)?,
                serde_json::to_string(&session.worktrees)?,
                serde_json::to_string(&session.branches)?,
                serde_json::to_string(&session.prs)?,
                serde_json::to_string(&session.errors)?,
            ],
        )?;
        Ok(())
    }

    pub fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            "UPDATE sessions SET
                project = ?2, phase = ?3, last_checkpoint_at = ?4, current_task = ?5,
                pending_tasks = ?6, completed_tasks = ?7, failed_tasks = ?8,
                worktrees = ?9, branches = ?10, prs = ?11, errors = ?12
             WHERE id = ?1",
            params![
                session.id.to_string(),
                session.project,
                session.phase,
                session.last_checkpoint_at.map(|t| t.to_rfc3339()),
                session.current_task,
                serde_json::to_string(&session.pending_tasks)?,
                serde_json::to_string(&session.completed_tasks)?,
                serde_json::to_string(&session.failed_tasks)?,
                serde_json::to_string(&session.worktrees)?,
                serde_json::to_string(&session.branches)?,
                serde_json::to_string(&session.prs)?,
                serde_json::to_string(&session.errors)?,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::SessionWriteFailure(format!(
                "session {} does not exist",
                session.id
            )));
        }
        Ok(())
    }

    pub fn get_session(&self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project, phase, started_at, last_checkpoint_at, current_task,
                        pending_tasks, completed_tasks, failed_tasks, worktrees, branches, prs, errors
                 FROM sessions WHERE id = ?1",
                params![id.to_string()],
                Self::row_to_session,
            )
            .optional()?;
        row.transpose()
    }

    /// Most recently started session for `project`/`phase` that is still
    /// active (per `Session::is_active`), used to resume a crashed run.
    pub fn find_active_session(&self, project: &str, phase: &str) -> Result<Option<Session>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project, phase, started_at, last_checkpoint_at, current_task,
                    pending_tasks, completed_tasks, failed_tasks, worktrees, branches, prs, errors
             FROM sessions WHERE project = ?1 AND phase = ?2 ORDER BY started_at DESC",
        )?;
        let mut rows = stmt.query_map(params![project, phase], Self::row_to_session)?;
        while let Some(row) = rows.next() {
            let session = row??;
            if session.is_active() {
                return Ok(Some(session));
            }
        }
        Ok(None)
    }

    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Result<Session, StoreError>> {
        let parse = || -> Result<Session, StoreError> {
            let id: String = row.get(0)?;
            let started_at: String = row.get(3)?;
            let last_checkpoint_at: Option<String> = row.get(4)?;
            let pending_tasks: String = row.get(6)?;
            let completed_tasks: String = row.get(7)?;
            let failed_tasks: String = row.get(8)?;
            let worktrees: String = row.get(9)?;
            let branches: String = row.get(10)?;
            let prs: String = row.get(11)?;
            let errors: String = row.get(12)?;

            Ok(Session {
                id: Uuid::parse_str(&id).map_err(|e| StoreError::SessionWriteFailure(e.to_string()))?,
                project: row.get(1)?,
                phase: row.get(2)?,
                started_at: parse_rfc3339(&started_at)?,
                last_checkpoint_at: last_checkpoint_at.map(|s| parse_rfc3339(&s)).transpose()?,
                current_task: row.get(5)?,
                pending_tasks: serde_json::from_str(&pending_tasks)?,
                completed_tasks: serde_json::from_str(&completed_tasks)?,
                failed_tasks: serde_json::from_str(&failed_tasks)?,
                worktrees: serde_json::from_str(&worktrees)?,
                branches: serde_json::from_str(&branches)?,
                prs: serde_json::from_str(&prs)?,
                errors: serde_json::from_str(&errors)?,
                checkpoints: Vec::new(),
            })
        };
        Ok(parse())
    }

    pub fn record_checkpoint(&self, session_id: Uuid, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO checkpoints (session_id, timestamp, task_id, status, pr_link, duration_ms, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id.to_string(),
                checkpoint.timestamp.to_rfc3339(),
                checkpoint.task_id,
                checkpoint.status.to_string(),
                checkpoint.pr_link,
                checkpoint.duration_ms,
                checkpoint.error,
            ],
        )?;
        self.conn.execute(
            "UPDATE sessions SET last_checkpoint_at = ?2 WHERE id = ?1",
            params![session_id.to_string(), checkpoint.timestamp.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn list_checkpoints(&self, session_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, task_id, status, pr_link, duration_ms, error
             FROM checkpoints WHERE session_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![session_id.to_string()], |row| {
            let timestamp: String = row.get(0)?;
            let status: String = row.get(2)?;
            Ok((timestamp, row.get::<_, String>(1)?, status, row.get(3)?, row.get(4)?, row.get(5)?))
        })?;

        let mut checkpoints = Vec::new();
        for row in rows {
            let (timestamp, task_id, status, pr_link, duration_ms, error) = row?;
            checkpoints.push(Checkpoint {
                timestamp: parse_rfc3339(&timestamp)?,
                task_id,
                status: status
                    .parse::<CheckpointStatus>()
                    .map_err(|e| StoreError::SessionWriteFailure(e.to_string()))?,
                pr_link,
                duration_ms,
                error,
            });
        }
        Ok(checkpoints)
    }

    /// Record or update a per-task error accumulator. `iterations` increments
    /// on every call; `resolved`/`retried` are taken from `record` as-is so
    /// callers control the transition explicitly.
    pub fn upsert_error_record(
        &self,
        session: &mut Session,
        task_id: &str,
        record: ErrorRecord,
    ) -> Result<(), StoreError> {
        session.errors.insert(task_id.to_string(), record);
        self.save_session(session)
    }

    /// Every session for `project`, most recently started first, regardless
    /// of phase or active/inactive status.
    pub fn list_all(&self, project: &str) -> Result<Vec<Session>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project, phase, started_at, last_checkpoint_at, current_task,
                    pending_tasks, completed_tasks, failed_tasks, worktrees, branches, prs, errors
             FROM sessions WHERE project = ?1 ORDER BY started_at DESC",
        )?;
        let rows = stmt.query_map(params![project], Self::row_to_session)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row??);
        }
        Ok(sessions)
    }

    fn require_session(&self, session_id: Uuid) -> Result<Session, StoreError> {
        self.get_session(session_id)?
            .ok_or_else(|| StoreError::SessionWriteFailure(format!("session {} does not exist", session_id)))
    }

    /// Records the worktree path for `task_id` against `session_id`.
    pub fn register_worktree(&self, session_id: Uuid, task_id: &str, path: &str) -> Result<(), StoreError> {
        let mut session = self.require_session(session_id)?;
        session.worktrees.insert(task_id.to_string(), path.to_string());
        self.save_session(&session)
    }

    /// Records the branch name for `task_id` against `session_id`.
    pub fn register_branch(&self, session_id: Uuid, task_id: &str, branch: &str) -> Result<(), StoreError> {
        let mut session = self.require_session(session_id)?;
        session.branches.insert(task_id.to_string(), branch.to_string());
        self.save_session(&session)
    }

    /// Deletes a session and (via `ON DELETE CASCADE`) its checkpoints.
    pub fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM sessions WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::SessionWriteFailure(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get_roundtrips_a_session() {
        let store = SessionStore::open_in_memory().unwrap();
        let session = Session::new("proj", "p01", vec!["T01-001".into(), "T01-002".into()]);
        store.create_session(&session).unwrap();

        let fetched = store.get_session(session.id).unwrap().unwrap();
        assert_eq!(fetched.id, session.id);
        assert_eq!(fetched.pending_tasks, session.pending_tasks);
    }

    #[test]
    fn get_session_returns_none_for_unknown_id() {
        let store = SessionStore::open_in_memory().unwrap();
        assert!(store.get_session(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn save_session_persists_task_transitions() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut session = Session::new("proj", "p01", vec!["T01-001".into()]);
        store.create_session(&session).unwrap();

        session.pending_tasks.clear();
        session.completed_tasks.push("T01-001".into());
        session.current_task = None;
        store.save_session(&session).unwrap();

        let fetched = store.get_session(session.id).unwrap().unwrap();
        assert!(fetched.pending_tasks.is_empty());
        assert_eq!(fetched.completed_tasks, vec!["T01-001".to_string()]);
        assert!(!fetched.is_active());
    }

    #[test]
    fn save_session_fails_for_nonexistent_session() {
        let store = SessionStore::open_in_memory().unwrap();
        let session = Session::new("proj", "p01", vec![]);
        let err = store.save_session(&session).unwrap_err();
        assert!(matches!(err, StoreError::SessionWriteFailure(_)));
    }

    #[test]
    fn checkpoints_are_recorded_and_listed_in_order() {
        let store = SessionStore::open_in_memory().unwrap();
        let session = Session::new("proj", "p01", vec!["T01-001".into(), "T01-002".into()]);
        store.create_session(&session).unwrap();

        let cp1 = Checkpoint {
            timestamp: Utc::now(),
            task_id: "T01-001".into(),
            status: CheckpointStatus::Completed,
            pr_link: Some("https://example.com/pr/1".into()),
            duration_ms: Some(1200),
            error: None,
        };
        let cp2 = Checkpoint {
            timestamp: Utc::now(),
            task_id: "T01-002".into(),
            status: CheckpointStatus::Failed,
            pr_link: None,
            duration_ms: Some(500),
            error: Some("validation failed".into()),
        };
        store.record_checkpoint(session.id, &cp1).unwrap();
        store.record_checkpoint(session.id, &cp2).unwrap();

        let checkpoints = store.list_checkpoints(session.id).unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].task_id, "T01-001");
        assert_eq!(checkpoints[1].status, CheckpointStatus::Failed);

        let refreshed = store.get_session(session.id).unwrap().unwrap();
        assert!(refreshed.last_checkpoint_at.is_some());
    }

    #[test]
    fn list_all_returns_every_session_for_a_project_most_recent_first() {
        let store = SessionStore::open_in_memory().unwrap();
        let first = Session::new("proj", "p01", vec!["T01-001".into()]);
        store.create_session(&first).unwrap();
        let second = Session::new("proj", "p02", vec!["T02-001".into()]);
        store.create_session(&second).unwrap();
        let other_project = Session::new("other", "p01", vec!["T01-001".into()]);
        store.create_session(&other_project).unwrap();

        let sessions = store.list_all("proj").unwrap();
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().any(|s| s.id == first.id));
        assert!(sessions.iter().any(|s| s.id == second.id));
    }

    #[test]
    fn register_worktree_and_branch_populate_the_session_maps() {
        let store = SessionStore::open_in_memory().unwrap();
        let session = Session::new("proj", "p01", vec!["T01-001".into()]);
        store.create_session(&session).unwrap();

        store.register_worktree(session.id, "T01-001", "/tmp/worktrees/T01-001").unwrap();
        store.register_branch(session.id, "T01-001", "forge/t01-001").unwrap();

        let fetched = store.get_session(session.id).unwrap().unwrap();
        assert_eq!(fetched.worktrees.get("T01-001").unwrap(), "/tmp/worktrees/T01-001");
        assert_eq!(fetched.branches.get("T01-001").unwrap(), "forge/t01-001");
    }

    #[test]
    fn delete_removes_the_session_and_cascades_its_checkpoints() {
        let store = SessionStore::open_in_memory().unwrap();
        let session = Session::new("proj", "p01", vec!["T01-001".into()]);
        store.create_session(&session).unwrap();
        store
            .record_checkpoint(
                session.id,
                &Checkpoint {
                    timestamp: Utc::now(),
                    task_id: "T01-001".into(),
                    status: CheckpointStatus::Completed,
                    pr_link: None,
                    duration_ms: Some(10),
                    error: None,
                },
            )
            .unwrap();

        store.delete(session.id).unwrap();

        assert!(store.get_session(session.id).unwrap().is_none());
        assert!(store.list_checkpoints(session.id).unwrap().is_empty());
    }

    #[test]
    fn find_active_session_skips_inactive_sessions() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut done = Session::new("proj", "p01", vec!["T01-001".into()]);
        done.pending_tasks.clear();
        done.completed_tasks.push("T01-001".into());
        store.create_session(&done).unwrap();

        assert!(store.find_active_session("proj", "p01").unwrap().is_none());

        let active = Session::new("proj", "p01", vec!["T01-002".into()]);
        store.create_session(&active).unwrap();
        let found = store.find_active_session("proj", "p01").unwrap().unwrap();
        assert_eq!(found.id, active.id);
    }
}
