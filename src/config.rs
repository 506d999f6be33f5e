//! Worker configuration (`.crucible.toml`).
//!
//! Loaded from the target repository root. A missing file means all
//! defaults; a present file may set any subset of fields. The directory
//! layout, environment allow-list, pattern catalog, and branch rules are
//! fixed and deliberately not configurable.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Name of the config file at the repository root.
pub const CONFIG_FILE: &str = ".crucible.toml";

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// A configuration file that could not be loaded or parsed.
#[derive(Debug)]
pub struct ConfigError {
    /// Path to the config file, when known.
    pub path: Option<PathBuf>,
    /// Human-readable description of the problem.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => write!(
                f,
                "configuration error in '{}': {}",
                p.display(),
                self.message
            ),
            None => write!(f, "configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level worker configuration.
#[derive(Clone, Debug, PartialEq, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CrucibleConfig {
    /// Task queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Container sandbox settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// VCS safety envelope settings.
    #[serde(default)]
    pub vcs: VcsConfig,

    /// The AI executor command.
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl CrucibleConfig {
    /// Load from `<repo>/.crucible.toml`. Missing file → all defaults.
    pub fn load(repo_root: &Path) -> Result<Self, ConfigError> {
        let path = repo_root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError {
            path: Some(path.clone()),
            message: e.to_string(),
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError {
            path: Some(path),
            message: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

/// Handoff directory location and polling cadence.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Handoff root, relative to the repository (default `".crucible"`).
    #[serde(default = "default_queue_root")]
    pub root: String,

    /// Seconds between queue passes in continuous mode (default 2).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            root: default_queue_root(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_queue_root() -> String {
    ".crucible".to_owned()
}

const fn default_poll_interval() -> u64 {
    2
}

// ---------------------------------------------------------------------------
// SandboxConfig
// ---------------------------------------------------------------------------

/// Container engine selection and resource limits.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    /// Engine binary (default `"docker"`; any CLI-compatible engine).
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Image tag to run (default `"crucible-sandbox:latest"`).
    #[serde(default = "default_image")]
    pub image: String,

    /// Memory limit (default `"2g"`).
    #[serde(default = "default_memory")]
    pub memory: String,

    /// CPU limit (default 2).
    #[serde(default = "default_cpus")]
    pub cpus: u32,

    /// Pid limit (default 256).
    #[serde(default = "default_pids_limit")]
    pub pids_limit: u32,

    /// Default per-command wall clock in seconds (default 300).
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            image: default_image(),
            memory: default_memory(),
            cpus: default_cpus(),
            pids_limit: default_pids_limit(),
            timeout_secs: default_sandbox_timeout(),
        }
    }
}

fn default_engine() -> String {
    "docker".to_owned()
}

fn default_image() -> String {
    "crucible-sandbox:latest".to_owned()
}

fn default_memory() -> String {
    "2g".to_owned()
}

const fn default_cpus() -> u32 {
    2
}

const fn default_pids_limit() -> u32 {
    256
}

const fn default_sandbox_timeout() -> u64 {
    300
}

// ---------------------------------------------------------------------------
// VcsConfig
// ---------------------------------------------------------------------------

/// VCS call limits.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VcsConfig {
    /// Wall-clock timeout per git call in seconds (default 30).
    #[serde(default = "default_vcs_timeout")]
    pub timeout_secs: u64,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_vcs_timeout(),
        }
    }
}

const fn default_vcs_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// ExecutorConfig
// ---------------------------------------------------------------------------

/// The command that performs the AI edit. Opaque to the worker: it runs
/// through the same sandbox and scanning path as verification commands,
/// with the task prompt appended as its final argument.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Executor binary (default `"echo"`, a placeholder that makes no
    /// edits).
    #[serde(default = "default_executor_cmd")]
    pub cmd: String,

    /// Fixed leading arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Executor wall clock in seconds (default 300).
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cmd: default_executor_cmd(),
            args: Vec::new(),
            timeout_secs: default_sandbox_timeout(),
        }
    }
}

fn default_executor_cmd() -> String {
    "echo".to_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_all_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = CrucibleConfig::load(dir.path()).unwrap();
        assert_eq!(cfg, CrucibleConfig::default());
        assert_eq!(cfg.queue.root, ".crucible");
        assert_eq!(cfg.queue.poll_interval_secs, 2);
        assert_eq!(cfg.sandbox.engine, "docker");
        assert_eq!(cfg.sandbox.memory, "2g");
        assert_eq!(cfg.sandbox.cpus, 2);
        assert_eq!(cfg.sandbox.pids_limit, 256);
        assert_eq!(cfg.sandbox.timeout_secs, 300);
        assert_eq!(cfg.vcs.timeout_secs, 30);
        assert_eq!(cfg.executor.cmd, "echo");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[sandbox]\nimage = \"custom:1\"\n\n[queue]\npoll_interval_secs = 5\n",
        )
        .unwrap();

        let cfg = CrucibleConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.sandbox.image, "custom:1");
        assert_eq!(cfg.sandbox.engine, "docker");
        assert_eq!(cfg.queue.poll_interval_secs, 5);
        assert_eq!(cfg.queue.root, ".crucible");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "[queue]\nspeed = 9\n").unwrap();
        let err = CrucibleConfig::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains(CONFIG_FILE), "{err}");
    }

    #[test]
    fn executor_section_parses() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[executor]\ncmd = \"opencode\"\nargs = [\"run\"]\ntimeout_secs = 120\n",
        )
        .unwrap();

        let cfg = CrucibleConfig::load(dir.path()).unwrap();
        assert_eq!(cfg.executor.cmd, "opencode");
        assert_eq!(cfg.executor.args, vec!["run".to_owned()]);
        assert_eq!(cfg.executor.timeout_secs, 120);
    }
}
