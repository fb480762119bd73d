//! Task Loader (§4.1).
//!
//! Walks `<specsRoot>/P<PP>-<slug>/T<PP>-<NNN>-<slug>/` directories, parses
//! each task's descriptor, and overlays the authoritative phase metadata
//! file. Generalises the donor's `phase.rs::PhasesFile::load` (a single JSON
//! file parsed into DAG nodes) one level down: tasks, not phases, are the
//! DAG nodes here, and they live one directory deeper than their metadata.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use forge_common::{Estimate, Priority, Task, TaskStatus};
use serde::Deserialize;
use tracing::warn;

use crate::errors::LoaderError;
use crate::task::{phase_component, task_id_regex};

const PHASE_METADATA_FILENAME: &str = "phase.json";
const TASK_DESCRIPTOR_MD: &str = "task.md";
const TASK_DESCRIPTOR_JSON: &str = "task.json";

/// Authoritative per-task entry inside a phase's metadata file.
#[derive(Debug, Clone, Deserialize)]
struct TaskMetaEntry {
    id: String,
    #[serde(default)]
    #[allow(dead_code)]
    name: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    title: Option<String>,
    #[serde(default)]
    estimate: Option<f64>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PhaseMetadataFile {
    #[allow(dead_code)]
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    phase_number: Option<u32>,
    #[serde(default)]
    #[allow(dead_code)]
    phase_name: Option<String>,
    #[serde(default)]
    tasks: Vec<TaskMetaEntry>,
}

/// Free-form fields recovered from a task descriptor (markdown front-matter
/// or a standalone JSON file). Every field is best-effort.
#[derive(Debug, Clone, Default, Deserialize)]
struct TaskDescriptor {
    #[serde(alias = "title")]
    name: Option<String>,
    description: Option<String>,
    status: Option<String>,
    #[serde(alias = "parallelGroup")]
    parallel_group: Option<u32>,
    #[serde(alias = "deps")]
    dependencies: Option<Vec<String>>,
    files: Option<Vec<String>>,
    #[serde(alias = "acceptanceCriteria")]
    acceptance_criteria: Option<Vec<String>>,
    estimate: Option<String>,
    priority: Option<String>,
    phase: Option<String>,
    requirements: Option<Vec<String>>,
    #[serde(alias = "businessRules")]
    business_rules: Option<Vec<String>>,
    #[serde(alias = "testingRequirements")]
    testing_requirements: Option<Vec<String>>,
    skills: Option<Vec<String>>,
}

/// Find the phase directory under `specs_root` matching `P<PP>-*`.
fn find_phase_dir(specs_root: &Path, phase: &str) -> Option<PathBuf> {
    let pp = phase_component_of_phase(phase)?;
    let prefix = format!("P{}-", pp);
    let read_dir = std::fs::read_dir(specs_root).ok()?;
    for entry in read_dir.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && name.starts_with(&prefix)
        {
            return Some(entry.path());
        }
    }
    None
}

fn phase_component_of_phase(phase: &str) -> Option<String> {
    // Accepts "p01"/"P01" (canonical) as well as bare "01".
    let digits: String = phase.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 2 { Some(digits) } else { None }
}

fn read_phase_metadata(phase_dir: &Path) -> Option<PhaseMetadataFile> {
    let path = phase_dir.join(PHASE_METADATA_FILENAME);
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&content) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!(target: "loader", path = %path.display(), error = %e, "malformed phase metadata, ignoring overlay");
            None
        }
    }
}

/// Parse `key: value` front-matter delimited by `---` lines, or a bare
/// `key: value` body with no delimiters. Lists are written either as
/// `key: [a, b, c]` or as indented `- item` bullets following `key:`.
fn parse_front_matter(content: &str) -> HashMap<String, String> {
    let mut fields: HashMap<String, Vec<String>> = HashMap::new();
    let mut current_key: Option<String> = None;

    let body = {
        let trimmed = content.trim_start();
        if let Some(rest) = trimmed.strip_prefix("---") {
            rest.split("---").next().unwrap_or("").to_string()
        } else {
            content.to_string()
        }
    };

    for line in body.lines() {
        if line.trim_start().starts_with("- ") {
            if let Some(key) = &current_key {
                let item = line.trim_start().trim_start_matches("- ").trim();
                fields.entry(key.clone()).or_default().push(item.to_string());
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_string();
            let value = value.trim().to_string();
            if value.is_empty() {
                current_key = Some(key);
            } else {
                current_key = None;
                fields.entry(key).or_default().push(value);
            }
        }
    }

    fields
        .into_iter()
        .map(|(k, v)| (k, v.join(", ")))
        .collect()
}

fn descriptor_from_markdown(content: &str) -> TaskDescriptor {
    let fields = parse_front_matter(content);
    let list = |key: &str| -> Option<Vec<String>> {
        fields.get(key).map(|v| {
            v.split(',')
                .map(|s| s.trim().trim_matches(|c| c == '[' || c == ']').to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    };
    TaskDescriptor {
        name: fields.get("name").or_else(|| fields.get("title")).cloned(),
        description: fields.get("description").cloned(),
        status: fields.get("status").cloned(),
        parallel_group: fields
            .get("parallel_group")
            .or_else(|| fields.get("parallelGroup"))
            .and_then(|v| v.parse().ok()),
        dependencies: list("dependencies").or_else(|| list("deps")),
        files: list("files"),
        acceptance_criteria: list("acceptance_criteria").or_else(|| list("acceptanceCriteria")),
        estimate: fields.get("estimate").cloned(),
        priority: fields.get("priority").cloned(),
        phase: fields.get("phase").cloned(),
        requirements: list("requirements"),
        business_rules: list("business_rules").or_else(|| list("businessRules")),
        testing_requirements: list("testing_requirements").or_else(|| list("testingRequirements")),
        skills: list("skills"),
    }
}

fn parse_task_descriptor(task_dir: &Path, task_id: &str) -> Option<TaskDescriptor> {
    let md_path = task_dir.join(TASK_DESCRIPTOR_MD);
    if let Ok(content) = std::fs::read_to_string(&md_path) {
        return Some(descriptor_from_markdown(&content));
    }
    let json_path = task_dir.join(TASK_DESCRIPTOR_JSON);
    if let Ok(content) = std::fs::read_to_string(&json_path) {
        match serde_json::from_str::<TaskDescriptor>(&content) {
            Ok(d) => return Some(d),
            Err(e) => {
                warn!(target: "loader", task_id, path = %json_path.display(), error = %e, "malformed task file, degrading to minimal record");
                return None;
            }
        }
    }
    None
}

fn build_task(task_id: &str, phase: &str, descriptor: Option<TaskDescriptor>) -> Task {
    let mut task = Task::minimal(task_id, phase);
    if let Some(d) = descriptor {
        if let Some(name) = d.name {
            task.name = name;
        }
        task.description = d.description;
        if let Some(status) = d.status.as_deref().and_then(|s| s.parse::<TaskStatus>().ok()) {
            task.status = status;
        }
        if let Some(pg) = d.parallel_group {
            task.parallel_group = pg;
        }
        if let Some(deps) = d.dependencies {
            task.dependencies = deps;
        }
        if let Some(files) = d.files {
            task.files = files;
        }
        if let Some(ac) = d.acceptance_criteria {
            task.acceptance_criteria = ac;
        }
        if let Some(est) = d.estimate.as_deref().and_then(|s| s.parse::<Estimate>().ok()) {
            task.estimate = est;
        }
        if let Some(p) = d.priority.as_deref().and_then(|s| s.parse::<Priority>().ok()) {
            task.priority = p;
        }
        if let Some(phase) = d.phase {
            task.phase = phase;
        }
        if let Some(r) = d.requirements {
            task.requirements = r;
        }
        if let Some(b) = d.business_rules {
            task.business_rules = b;
        }
        if let Some(t) = d.testing_requirements {
            task.testing_requirements = t;
        }
        if let Some(s) = d.skills {
            task.skills = s;
        }
    }
    task
}

fn overlay_metadata(task: &mut Task, entry: &TaskMetaEntry) {
    task.dependencies = entry.dependencies.clone();
    if let Some(est) = entry.estimate {
        task.estimate = Estimate::from_hours(est);
    }
    if let Some(p) = entry.priority.as_deref().and_then(|s| s.parse::<Priority>().ok()) {
        task.priority = p;
    }
    if let Some(status) = entry.status.as_deref().and_then(|s| s.parse::<TaskStatus>().ok()) {
        task.status = status;
    }
}

/// `loadTasks(cwd, phase)` — ordered ascending by id. Missing phase
/// directory returns an empty sequence, per spec §4.1 failure modes.
pub fn load_tasks(specs_root: &Path, phase: &str) -> Result<Vec<Task>, LoaderError> {
    let Some(phase_dir) = find_phase_dir(specs_root, phase) else {
        return Ok(Vec::new());
    };
    let pp = phase_component_of_phase(phase).unwrap_or_default();
    let metadata = read_phase_metadata(&phase_dir);
    let meta_by_id: HashMap<&str, &TaskMetaEntry> = metadata
        .as_ref()
        .map(|m| m.tasks.iter().map(|t| (t.id.as_str(), t)).collect())
        .unwrap_or_default();

    let mut tasks = Vec::new();
    let entries = std::fs::read_dir(&phase_dir).map_err(|e| LoaderError::Io {
        path: phase_dir.display().to_string(),
        source: e,
    })?;
    let task_prefix = format!("T{}-", pp);
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(&task_prefix) {
            continue;
        }
        // T<PP>-<NNN>-<slug> -> id is the first two hyphen-delimited segments.
        let mut parts = name.splitn(3, '-');
        let (Some(p), Some(n)) = (parts.next(), parts.next()) else {
            continue;
        };
        let task_id = format!("{}-{}", p, n);
        if !task_id_regex().is_match(&task_id) {
            continue;
        }

        let descriptor = parse_task_descriptor(&entry.path(), &task_id);
        let mut task = build_task(&task_id, phase, descriptor);
        task.id = task_id.clone();
        if let Some(entry) = meta_by_id.get(task_id.as_str()) {
            overlay_metadata(&mut task, entry);
        }
        tasks.push(task);
    }

    tasks.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(tasks)
}

/// `loadTask(cwd, taskId)` — single task or `None` if its phase/directory is
/// absent.
pub fn load_task(specs_root: &Path, task_id: &str) -> Result<Option<Task>, LoaderError> {
    let Some(pp) = phase_component(task_id) else {
        return Ok(None);
    };
    let phase = format!("p{}", pp);
    let tasks = load_tasks(specs_root, &phase)?;
    Ok(tasks.into_iter().find(|t| t.id == task_id))
}
