//! Runtime configuration for the orchestrator core.
//!
//! Resolves `projectRoot`, `specsRoot`, the session database path, log
//! directory, and engine defaults from a `forge.toml` overlay, environment
//! variables, and CLI flags, in that precedence order (CLI wins, then env,
//! then `forge.toml`, then built-in defaults).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_TIMEOUT_MS: u64 = 600_000;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_MAX_PARALLEL: usize = 3;
const DEFAULT_COMPLETION_TOKEN: &str = "COMPLETE";
/// Outer per-task retry envelope (§4.7), independent of the engine's own
/// internal retries.
pub const OUTER_TASK_RETRIES: u32 = 2;

#[derive(Debug, Clone)]
pub struct Config {
    pub project_root: PathBuf,
    pub specs_root: PathBuf,
    pub session_db: PathBuf,
    pub log_dir: PathBuf,
    pub worktree_base_dir: PathBuf,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub max_parallel: usize,
    pub completion_token: String,
    pub agent_cmd: String,
    pub dangerously_skip_permissions: bool,
    /// Model identifier forwarded to the agent CLI, if the agent supports
    /// selecting one. `None` leaves the agent's own default in effect.
    pub model: Option<String>,
    /// Skip lint/test validation after agent completion (`fast` mode).
    pub fast: bool,
    pub lint_cmd: Option<String>,
    pub test_cmd: Option<String>,
    /// Shell command per lifecycle hook name (`beforePhase`, `beforeTask`,
    /// `afterTask`, `onSuccess`, `onError`), absent entries are no-ops.
    pub hooks: HashMap<String, String>,
}

/// Overrides accepted from the CLI layer. All fields optional; `None` falls
/// through to env, then `forge.toml`, then built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub specs_root: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub max_parallel: Option<usize>,
    pub fast: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct ForgeToml {
    #[serde(default)]
    specs_root: Option<String>,
    #[serde(default)]
    engine: EngineToml,
    #[serde(default)]
    validation: ValidationToml,
    #[serde(default)]
    hooks: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct EngineToml {
    timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    max_parallel: Option<usize>,
    completion_token: Option<String>,
    agent_cmd: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ValidationToml {
    fast: Option<bool>,
    lint_cmd: Option<String>,
    test_cmd: Option<String>,
}

impl Config {
    pub fn load(project_root: PathBuf, overrides: CliOverrides) -> Result<Self> {
        let project_root = project_root
            .canonicalize()
            .context("failed to resolve project root")?;

        let toml_path = project_root.join("forge.toml");
        let toml = if toml_path.exists() {
            let content = std::fs::read_to_string(&toml_path)
                .with_context(|| format!("failed to read {}", toml_path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", toml_path.display()))?
        } else {
            ForgeToml::default()
        };

        let specs_root = overrides
            .specs_root
            .or_else(|| std::env::var("FORGE_SPECS_ROOT").ok().map(PathBuf::from))
            .or_else(|| toml.specs_root.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("docs/specs"));
        let specs_root = project_root.join(specs_root);

        let forge_dir = project_root.join(".forge");
        let session_db = forge_dir.join("session.db");
        let log_dir = forge_dir.join("logs");
        let worktree_base_dir = forge_dir.join("worktrees");

        let timeout_ms = overrides
            .timeout_ms
            .or_else(|| env_parse("FORGE_TIMEOUT_MS"))
            .or(toml.engine.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        let max_retries = overrides
            .max_retries
            .or_else(|| env_parse("FORGE_MAX_RETRIES"))
            .or(toml.engine.max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES);

        let max_parallel = overrides
            .max_parallel
            .or_else(|| env_parse("FORGE_MAX_PARALLEL"))
            .or(toml.engine.max_parallel)
            .unwrap_or(DEFAULT_MAX_PARALLEL);

        let completion_token = std::env::var("FORGE_COMPLETION_TOKEN")
            .ok()
            .or(toml.engine.completion_token)
            .unwrap_or_else(|| DEFAULT_COMPLETION_TOKEN.to_string());

        let agent_cmd = std::env::var("FORGE_AGENT_CMD")
            .ok()
            .or(toml.engine.agent_cmd)
            .unwrap_or_else(|| "claude".to_string());

        let dangerously_skip_permissions = std::env::var("FORGE_SKIP_PERMISSIONS")
            .map(|v| v != "false")
            .unwrap_or(true);

        let model = std::env::var("FORGE_MODEL").ok().or(toml.engine.model);

        let fast = overrides
            .fast
            .or_else(|| {
                std::env::var("FORGE_FAST")
                    .ok()
                    .map(|v| v != "false" && v != "0")
            })
            .or(toml.validation.fast)
            .unwrap_or(false);

        Ok(Self {
            project_root,
            specs_root,
            session_db,
            log_dir,
            worktree_base_dir,
            timeout_ms,
            max_retries,
            max_parallel,
            completion_token,
            agent_cmd,
            dangerously_skip_permissions,
            model,
            fast,
            lint_cmd: toml.validation.lint_cmd,
            test_cmd: toml.validation.test_cmd,
            hooks: toml.hooks,
        })
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.log_dir).context("failed to create log directory")?;
        std::fs::create_dir_all(&self.worktree_base_dir)
            .context("failed to create worktree base directory")?;
        if let Some(parent) = self.session_db.parent() {
            std::fs::create_dir_all(parent).context("failed to create .forge directory")?;
        }
        Ok(())
    }

    pub fn completion_tag_open(&self) -> String {
        format!("<promise>{}", self.completion_token)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Test-only constructor bypassing `forge.toml`/env discovery, used by
/// subsystem tests that only need paths, not full precedence resolution.
#[cfg(test)]
pub fn test_config(project_root: &Path) -> Config {
    Config {
        project_root: project_root.to_path_buf(),
        specs_root: project_root.join("docs/specs"),
        session_db: project_root.join(".forge/session.db"),
        log_dir: project_root.join(".forge/logs"),
        worktree_base_dir: project_root.join(".forge/worktrees"),
        timeout_ms: DEFAULT_TIMEOUT_MS,
        max_retries: DEFAULT_MAX_RETRIES,
        max_parallel: DEFAULT_MAX_PARALLEL,
        completion_token: DEFAULT_COMPLETION_TOKEN.to_string(),
        agent_cmd: "claude".to_string(),
        dangerously_skip_permissions: true,
        model: None,
        fast: false,
        lint_cmd: None,
        test_cmd: None,
        hooks: HashMap::new(),
    }
}
