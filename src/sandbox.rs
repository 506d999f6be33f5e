//! Execution of untrusted commands in a hardened container.
//!
//! [`ContainerRunner`] launches an external container engine (docker or
//! any CLI-compatible engine) with no network, a read-only root
//! filesystem, dropped capabilities, resource limits, and exactly one
//! writable mount: the per-task working tree at `/workspace`.
//!
//! [`InsecureRunner`] executes commands directly on the host instead.
//! It exists for tests and machines without a container engine; every
//! result produced through it is stamped `insecure_runner_used` and it
//! must never be enabled in production.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::config::SandboxConfig;
use crate::proc;

/// Host environment variables forwarded into the sandbox. Everything
/// else is stripped.
pub const ENV_ALLOWLIST: &[&str] = &[
    "CI", "NODE_ENV", "HOME", "PATH", "TERM", "LANG", "LC_ALL", "TZ",
];

/// Fixed mount point of the working tree inside the container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Timeout for availability probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// SandboxError
// ---------------------------------------------------------------------------

/// Errors from sandbox invocation.
#[derive(Debug)]
pub enum SandboxError {
    /// The engine or command could not be spawned at all.
    Spawn {
        /// The binary that failed to start.
        command: String,
        /// The underlying error.
        source: std::io::Error,
    },
    /// The working tree to mount is unusable.
    Worktree {
        /// The path that was rejected.
        path: std::path::PathBuf,
        /// Why.
        reason: String,
    },
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { command, source } => {
                write!(f, "failed to spawn '{command}': {source}")
            }
            Self::Worktree { path, reason } => {
                write!(f, "unusable working tree '{}': {reason}", path.display())
            }
        }
    }
}

impl std::error::Error for SandboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn { source, .. } => Some(source),
            Self::Worktree { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// RunResult
// ---------------------------------------------------------------------------

/// Outcome of one sandboxed command.
#[derive(Debug)]
pub struct RunResult {
    /// Exit code; `-1` if killed by a signal.
    pub exit_code: i32,
    /// Captured stdout bytes.
    pub stdout: Vec<u8>,
    /// Captured stderr bytes.
    pub stderr: Vec<u8>,
    /// Whether the wall-clock timeout expired (the command received
    /// `SIGKILL` but accumulated output is preserved).
    pub timed_out: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Sandbox trait
// ---------------------------------------------------------------------------

/// Abstraction over command execution backends.
///
/// Object-safe so the worker can hold a `Box<dyn Sandbox>`.
pub trait Sandbox {
    /// Run `cmd args` with `worktree` as the (only) writable directory,
    /// bounded by `timeout`.
    fn run(
        &self,
        worktree: &Path,
        cmd: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<RunResult, SandboxError>;

    /// Whether the execution engine is reachable at all.
    fn is_engine_available(&self) -> bool;

    /// Whether the configured image is present locally.
    fn is_image_available(&self) -> bool;

    /// True for backends that execute on the host without isolation.
    fn is_insecure(&self) -> bool {
        false
    }

    /// Human-readable backend description for logs and `doctor`.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// ContainerRunner
// ---------------------------------------------------------------------------

/// The production sandbox: a container engine invoked with hardened flags.
pub struct ContainerRunner {
    engine: String,
    image: String,
    memory: String,
    cpus: u32,
    pids_limit: u32,
}

impl ContainerRunner {
    /// Build a runner from the sandbox configuration.
    pub fn new(cfg: &SandboxConfig) -> Self {
        Self {
            engine: cfg.engine.clone(),
            image: cfg.image.clone(),
            memory: cfg.memory.clone(),
            cpus: cfg.cpus,
            pids_limit: cfg.pids_limit,
        }
    }

    /// Assemble the full engine argv for one command.
    ///
    /// The hardened flags come first, then the image tag, then the
    /// command and its arguments.
    fn container_args(
        &self,
        worktree: &Path,
        cmd: &str,
        args: &[String],
    ) -> Result<Vec<String>, SandboxError> {
        let (uid, gid) = owner_ids(worktree)?;

        let mut argv: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--network".into(),
            "none".into(),
            "--read-only".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--pids-limit".into(),
            self.pids_limit.to_string(),
            "--memory".into(),
            self.memory.clone(),
            "--cpus".into(),
            self.cpus.to_string(),
            "--user".into(),
            format!("{uid}:{gid}"),
            "-v".into(),
            format!("{}:{WORKSPACE_MOUNT}:rw", worktree.display()),
            "--tmpfs".into(),
            "/tmp:rw,noexec,nosuid,nodev,size=512m".into(),
            "-w".into(),
            WORKSPACE_MOUNT.into(),
        ];

        for (key, value) in allowed_env(std::env::vars()) {
            argv.push("-e".into());
            argv.push(format!("{key}={value}"));
        }

        argv.push(self.image.clone());
        argv.push(cmd.to_owned());
        argv.extend(args.iter().cloned());
        Ok(argv)
    }
}

impl Sandbox for ContainerRunner {
    fn run(
        &self,
        worktree: &Path,
        cmd: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<RunResult, SandboxError> {
        let argv = self.container_args(worktree, cmd, args)?;
        let mut command = std::process::Command::new(&self.engine);
        command.args(&argv);

        let cap = proc::run_captured(&mut command, timeout).map_err(|e| SandboxError::Spawn {
            command: self.engine.clone(),
            source: e,
        })?;

        let duration_ms = cap.duration_ms();
        Ok(RunResult {
            exit_code: cap.exit_code,
            stdout: cap.stdout,
            stderr: cap.stderr,
            timed_out: cap.timed_out,
            duration_ms,
        })
    }

    fn is_engine_available(&self) -> bool {
        let mut cmd = std::process::Command::new(&self.engine);
        cmd.arg("version");
        proc::run_captured(&mut cmd, PROBE_TIMEOUT).is_ok_and(|cap| cap.success())
    }

    fn is_image_available(&self) -> bool {
        let mut cmd = std::process::Command::new(&self.engine);
        cmd.args(["image", "inspect", &self.image]);
        proc::run_captured(&mut cmd, PROBE_TIMEOUT).is_ok_and(|cap| cap.success())
    }

    fn describe(&self) -> String {
        format!("container engine '{}', image '{}'", self.engine, self.image)
    }
}

/// The uid/gid of the working tree's owner — the invoking user, since
/// the worker created the tree itself.
fn owner_ids(worktree: &Path) -> Result<(u32, u32), SandboxError> {
    let meta = std::fs::metadata(worktree).map_err(|e| SandboxError::Worktree {
        path: worktree.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !meta.is_dir() {
        return Err(SandboxError::Worktree {
            path: worktree.to_path_buf(),
            reason: "not a directory".to_owned(),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Ok((meta.uid(), meta.gid()))
    }
    #[cfg(not(unix))]
    {
        Ok((0, 0))
    }
}

/// Filter an environment down to the allow-list, preserving input order
/// of the allow-list itself.
fn allowed_env(vars: impl Iterator<Item = (String, String)>) -> Vec<(String, String)> {
    let present: Vec<(String, String)> = vars.collect();
    ENV_ALLOWLIST
        .iter()
        .filter_map(|key| {
            present
                .iter()
                .find(|(k, _)| k == key)
                .map(|(k, v)| (k.clone(), v.clone()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// InsecureRunner
// ---------------------------------------------------------------------------

/// Host-process execution without container isolation.
pub struct InsecureRunner;

impl Sandbox for InsecureRunner {
    fn run(
        &self,
        worktree: &Path,
        cmd: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<RunResult, SandboxError> {
        let mut command = std::process::Command::new(cmd);
        command.args(args).current_dir(worktree).env_clear();
        for (key, value) in allowed_env(std::env::vars()) {
            command.env(key, value);
        }

        let cap = proc::run_captured(&mut command, timeout).map_err(|e| SandboxError::Spawn {
            command: cmd.to_owned(),
            source: e,
        })?;

        let duration_ms = cap.duration_ms();
        Ok(RunResult {
            exit_code: cap.exit_code,
            stdout: cap.stdout,
            stderr: cap.stderr,
            timed_out: cap.timed_out,
            duration_ms,
        })
    }

    fn is_engine_available(&self) -> bool {
        true
    }

    fn is_image_available(&self) -> bool {
        true
    }

    fn is_insecure(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        "INSECURE host-process runner (no isolation)".to_owned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner() -> ContainerRunner {
        ContainerRunner::new(&SandboxConfig::default())
    }

    fn args_for(worktree: &Path) -> Vec<String> {
        runner()
            .container_args(worktree, "true", &[])
            .unwrap()
    }

    fn has_pair(argv: &[String], flag: &str, value: &str) -> bool {
        argv.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn hardened_flags_are_present() {
        let ws = TempDir::new().unwrap();
        let argv = args_for(ws.path());

        assert!(has_pair(&argv, "--network", "none"));
        assert!(argv.contains(&"--read-only".to_owned()));
        assert!(has_pair(&argv, "--cap-drop", "ALL"));
        assert!(has_pair(&argv, "--security-opt", "no-new-privileges"));
        assert!(has_pair(&argv, "--pids-limit", "256"));
        assert!(has_pair(&argv, "--memory", "2g"));
        assert!(has_pair(&argv, "--cpus", "2"));
        assert!(has_pair(&argv, "-w", WORKSPACE_MOUNT));
        assert!(has_pair(
            &argv,
            "--tmpfs",
            "/tmp:rw,noexec,nosuid,nodev,size=512m"
        ));
    }

    #[test]
    fn worktree_is_the_only_bind_mount() {
        let ws = TempDir::new().unwrap();
        let argv = args_for(ws.path());

        let mounts: Vec<&String> = argv
            .windows(2)
            .filter(|w| w[0] == "-v")
            .map(|w| &w[1])
            .collect();
        assert_eq!(mounts.len(), 1);
        assert_eq!(
            *mounts[0],
            format!("{}:{WORKSPACE_MOUNT}:rw", ws.path().display())
        );
    }

    #[test]
    fn user_flag_maps_worktree_owner() {
        let ws = TempDir::new().unwrap();
        let (uid, gid) = owner_ids(ws.path()).unwrap();
        let argv = args_for(ws.path());
        assert!(has_pair(&argv, "--user", &format!("{uid}:{gid}")));
    }

    #[test]
    fn command_follows_image_tag() {
        let ws = TempDir::new().unwrap();
        let argv = runner()
            .container_args(ws.path(), "cargo", &["test".to_owned(), "--all".to_owned()])
            .unwrap();

        let image_pos = argv
            .iter()
            .position(|a| a == "crucible-sandbox:latest")
            .unwrap();
        assert_eq!(argv[image_pos + 1], "cargo");
        assert_eq!(argv[image_pos + 2], "test");
        assert_eq!(argv[image_pos + 3], "--all");
        assert_eq!(argv.len(), image_pos + 4);
    }

    #[test]
    fn missing_worktree_is_rejected() {
        let err = runner()
            .container_args(Path::new("/definitely/not/here"), "true", &[])
            .unwrap_err();
        assert!(matches!(err, SandboxError::Worktree { .. }), "got {err}");
    }

    // -- env filtering --

    #[test]
    fn allowed_env_keeps_only_allowlist() {
        let input = vec![
            ("PATH".to_owned(), "/usr/bin".to_owned()),
            ("AWS_SECRET_ACCESS_KEY".to_owned(), "nope".to_owned()),
            ("HOME".to_owned(), "/home/u".to_owned()),
            ("SSH_AUTH_SOCK".to_owned(), "/tmp/agent".to_owned()),
        ];
        let filtered = allowed_env(input.into_iter());
        let keys: Vec<&str> = filtered.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["PATH", "HOME"]);
    }

    #[test]
    fn allowed_env_empty_input() {
        assert!(allowed_env(std::iter::empty()).is_empty());
    }

    // -- insecure runner --

    #[test]
    fn insecure_runner_executes_in_worktree() {
        let ws = TempDir::new().unwrap();
        std::fs::write(ws.path().join("marker.txt"), "here").unwrap();

        let result = InsecureRunner
            .run(ws.path(), "ls", &[], Duration::from_secs(10))
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(String::from_utf8_lossy(&result.stdout).contains("marker.txt"));
    }

    #[test]
    fn insecure_runner_reports_itself() {
        assert!(InsecureRunner.is_insecure());
        assert!(InsecureRunner.is_engine_available());
        assert!(InsecureRunner.is_image_available());
    }

    #[test]
    fn insecure_runner_times_out() {
        let ws = TempDir::new().unwrap();
        let result = InsecureRunner
            .run(
                ws.path(),
                "sleep",
                &["30".to_owned()],
                Duration::from_millis(200),
            )
            .unwrap();
        assert!(result.timed_out);
    }
}
