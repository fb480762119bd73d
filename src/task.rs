//! Re-exports of the shared domain types, plus the `TaskId`/`PhaseId`
//! parsing helpers the rest of the core validates input against.

pub use forge_common::{Checkpoint, CheckpointStatus, ErrorRecord, Estimate, Phase, PhaseStatus,
    Priority, Session, Task, TaskStatus};

use std::sync::OnceLock;

use regex::Regex;

/// `^T\d{2}-\d{3}$` per spec §6.
pub fn task_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^T\d{2}-\d{3}$").unwrap())
}

/// `^[Pp]\d{2}$` per spec §6.
pub fn phase_input_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[Pp]\d{2}$").unwrap())
}

/// Canonicalise a phase input (`P01`, `p01`, `01`) to lowercase `p<PP>`.
pub fn canonicalize_phase(input: &str) -> Option<String> {
    if phase_input_regex().is_match(input) {
        return Some(input.to_lowercase());
    }
    None
}

/// Two-digit phase component of a task id (`T01-002` -> `"01"`).
pub fn phase_component(task_id: &str) -> Option<&str> {
    if !task_id_regex().is_match(task_id) {
        return None;
    }
    task_id.get(1..3)
}
