//! Git operations with a fixed safety envelope.
//!
//! Every invocation of `git` made by the worker goes through [`Git`],
//! which injects configuration that prevents repository-controlled code
//! from running: hooks are short-circuited to a nonexistent path, auto-gc
//! is off (gc can run user-configured commands), advice output is
//! silenced, and each call is bounded by a wall-clock timeout.
//!
//! The working directory is fixed per call; no operation ever touches the
//! primary worktree except `worktree add`.

use std::fmt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use crate::proc;

/// Unified diffs larger than this are cut and marked with
/// [`DIFF_TRUNCATION_SENTINEL`].
pub const DIFF_MAX_BYTES: usize = 10 * 1024 * 1024;

/// Suffix appended to a truncated diff.
pub const DIFF_TRUNCATION_SENTINEL: &str = "\n[truncated: diff exceeded 10 MiB]\n";

/// Config injected into every git invocation.
///
/// `core.hooksPath=/dev/null` makes hook lookup resolve to a path that
/// can never contain executables, regardless of what the repository's
/// own config or `.git/hooks` says.
const SAFETY_CONFIG: &[&str] = &[
    "-c",
    "core.hooksPath=/dev/null",
    "-c",
    "gc.auto=0",
    "-c",
    "advice.detachedHead=false",
    "-c",
    "advice.statusHints=false",
    "-c",
    "commit.gpgsign=false",
];

// ---------------------------------------------------------------------------
// GitError
// ---------------------------------------------------------------------------

/// Errors from the VCS layer.
#[derive(Debug)]
pub enum GitError {
    /// A git command exited non-zero.
    Command {
        /// The command that was run (e.g. `"git worktree add"`).
        command: String,
        /// Captured stderr, trimmed.
        stderr: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
    },
    /// A git command exceeded its wall-clock timeout and was killed.
    TimedOut {
        /// The command that was run.
        command: String,
    },
    /// Spawning git failed.
    Io(std::io::Error),
}

impl fmt::Display for GitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command {
                command,
                stderr,
                exit_code,
            } => {
                write!(f, "`{command}` failed")?;
                if let Some(code) = exit_code {
                    write!(f, " (exit code {code})")?;
                }
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
            Self::TimedOut { command } => write!(f, "`{command}` timed out"),
            Self::Io(e) => write!(f, "failed to run git: {e}"),
        }
    }
}

impl std::error::Error for GitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GitError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Repository status
// ---------------------------------------------------------------------------

/// Structured `git status` report for one working tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepoStatus {
    /// Paths with staged (index) changes.
    pub staged: Vec<String>,
    /// Paths with unstaged working-tree changes.
    pub unstaged: Vec<String>,
    /// Untracked paths.
    pub untracked: Vec<String>,
    /// Renames as `(from, to)` pairs.
    pub renamed: Vec<(String, String)>,
}

impl RepoStatus {
    /// Whether the tree has no changes of any kind.
    pub fn is_clean(&self) -> bool {
        self.staged.is_empty()
            && self.unstaged.is_empty()
            && self.untracked.is_empty()
            && self.renamed.is_empty()
    }

    /// Every touched path, sorted and deduplicated. Renames contribute
    /// their new name.
    pub fn changed_files(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .staged
            .iter()
            .chain(self.unstaged.iter())
            .chain(self.untracked.iter())
            .cloned()
            .chain(self.renamed.iter().map(|(_, to)| to.clone()))
            .collect();
        all.sort();
        all.dedup();
        all
    }

    /// Paths that did not exist before: untracked files plus staged
    /// additions plus rename targets.
    pub fn created_files(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .untracked
            .iter()
            .cloned()
            .chain(self.renamed.iter().map(|(_, to)| to.clone()))
            .collect();
        all.sort();
        all.dedup();
        all
    }
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// Handle for running git with the safety envelope.
#[derive(Clone, Debug)]
pub struct Git {
    timeout: Duration,
}

impl Git {
    /// Create a handle with the given per-call wall-clock timeout.
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run git in `dir` and return stdout bytes.
    fn run(&self, dir: &Path, args: &[&str]) -> Result<Vec<u8>, GitError> {
        let mut cmd = Command::new("git");
        cmd.args(SAFETY_CONFIG).args(args).current_dir(dir);

        let command = format!("git {}", args.join(" "));
        let cap = proc::run_captured(&mut cmd, self.timeout)?;

        if cap.timed_out {
            return Err(GitError::TimedOut { command });
        }
        if cap.exit_code != 0 {
            return Err(GitError::Command {
                command,
                stderr: String::from_utf8_lossy(&cap.stderr).trim().to_owned(),
                exit_code: Some(cap.exit_code),
            });
        }
        Ok(cap.stdout)
    }

    /// Run git in `dir` and return stdout as a lossily-decoded string.
    fn run_text(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let out = self.run(dir, args)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Whether `dir` is inside a git working tree.
    pub fn is_repo(&self, dir: &Path) -> bool {
        self.run(dir, &["rev-parse", "--is-inside-work-tree"])
            .is_ok()
    }

    /// Initialize a new repository in `dir`.
    pub fn init(&self, dir: &Path) -> Result<(), GitError> {
        self.run(dir, &["init"]).map(|_| ())
    }

    /// The current branch name, or `"HEAD"` when detached.
    pub fn current_branch(&self, dir: &Path) -> Result<String, GitError> {
        let out = self.run_text(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(out.trim().to_owned())
    }

    /// The commit id of `HEAD`.
    pub fn head_commit(&self, dir: &Path) -> Result<String, GitError> {
        let out = self.run_text(dir, &["rev-parse", "HEAD"])?;
        Ok(out.trim().to_owned())
    }

    /// Structured status of the working tree at `dir`.
    pub fn status(&self, dir: &Path) -> Result<RepoStatus, GitError> {
        let out = self.run_text(
            dir,
            &["status", "--porcelain", "--untracked-files=all", "--renames"],
        )?;
        Ok(parse_porcelain(&out))
    }

    /// Whether the working tree has any uncommitted change.
    pub fn is_dirty(&self, dir: &Path) -> Result<bool, GitError> {
        Ok(!self.status(dir)?.is_clean())
    }

    /// Unified diff of the working tree (or the index when `staged`)
    /// against `HEAD`, truncated at [`DIFF_MAX_BYTES`].
    pub fn diff_head(&self, dir: &Path, staged: bool) -> Result<String, GitError> {
        let args: &[&str] = if staged {
            &["diff", "--cached", "HEAD"]
        } else {
            &["diff", "HEAD"]
        };
        let out = self.run(dir, args)?;
        Ok(truncate_diff(&out))
    }

    /// Unified diff between two commits, truncated at [`DIFF_MAX_BYTES`].
    pub fn diff_range(&self, dir: &Path, from: &str, to: &str) -> Result<String, GitError> {
        let out = self.run(dir, &["diff", from, to])?;
        Ok(truncate_diff(&out))
    }

    /// Create `ws_path` as a new worktree of the repo at `main`, on a
    /// fresh branch off `HEAD`. Fails if `ws_path` already exists.
    pub fn worktree_add(
        &self,
        main: &Path,
        ws_path: &Path,
        branch: &str,
    ) -> Result<(), GitError> {
        if ws_path.exists() {
            return Err(GitError::Command {
                command: "git worktree add".to_owned(),
                stderr: format!("'{}' already exists", ws_path.display()),
                exit_code: None,
            });
        }
        let path_str = ws_path.to_string_lossy();
        self.run(main, &["worktree", "add", "-b", branch, &path_str, "HEAD"])
            .map(|_| ())
    }

    /// Like [`worktree_add`](Self::worktree_add) but detached at `HEAD`,
    /// for repositories already on a working branch.
    pub fn worktree_add_detached(&self, main: &Path, ws_path: &Path) -> Result<(), GitError> {
        if ws_path.exists() {
            return Err(GitError::Command {
                command: "git worktree add".to_owned(),
                stderr: format!("'{}' already exists", ws_path.display()),
                exit_code: None,
            });
        }
        let path_str = ws_path.to_string_lossy();
        self.run(main, &["worktree", "add", "--detach", &path_str, "HEAD"])
            .map(|_| ())
    }

    /// Force-remove the worktree at `ws_path` and prune stale entries.
    ///
    /// Idempotent: a missing or half-removed worktree is cleaned up
    /// manually and the prune still runs.
    pub fn worktree_remove(&self, main: &Path, ws_path: &Path) -> Result<(), GitError> {
        if ws_path.exists() {
            let path_str = ws_path.to_string_lossy();
            if self
                .run(main, &["worktree", "remove", "--force", &path_str])
                .is_err()
                && ws_path.exists()
            {
                std::fs::remove_dir_all(ws_path)?;
            }
        }
        // Clean the .git/worktrees/<name> admin dir even after manual removal.
        let _ = self.run(main, &["worktree", "prune"]);
        Ok(())
    }

    /// Stage every change in the working tree.
    pub fn add_all(&self, dir: &Path) -> Result<(), GitError> {
        self.run(dir, &["add", "-A"]).map(|_| ())
    }

    /// Commit staged changes with `message`.
    pub fn commit(&self, dir: &Path, message: &str) -> Result<(), GitError> {
        self.run(dir, &["commit", "-m", message]).map(|_| ())
    }
}

/// Cut a diff at [`DIFF_MAX_BYTES`] and append the sentinel. A diff of
/// exactly the limit is returned unchanged.
fn truncate_diff(bytes: &[u8]) -> String {
    if bytes.len() <= DIFF_MAX_BYTES {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut s = String::from_utf8_lossy(&bytes[..DIFF_MAX_BYTES]).into_owned();
    s.push_str(DIFF_TRUNCATION_SENTINEL);
    s
}

/// Parse `git status --porcelain` v1 output.
///
/// Each line is `XY path` (`X` index status, `Y` worktree status), or
/// `R  from -> to` for renames, or `?? path` for untracked. Quoted paths
/// have their quotes stripped.
fn parse_porcelain(output: &str) -> RepoStatus {
    let mut status = RepoStatus::default();

    for line in output.lines() {
        if line.len() < 4 {
            continue;
        }
        let (code, rest) = line.split_at(2);
        let rest = rest.trim_start();

        if code == "??" {
            status.untracked.push(unquote(rest));
            continue;
        }

        let x = code.chars().next().unwrap_or(' ');
        let y = code.chars().nth(1).unwrap_or(' ');

        if x == 'R' || y == 'R' {
            if let Some((from, to)) = rest.split_once(" -> ") {
                status.renamed.push((unquote(from), unquote(to)));
            }
            continue;
        }

        if x != ' ' {
            status.staged.push(unquote(rest));
        }
        if y != ' ' {
            status.unstaged.push(unquote(rest));
        }
    }

    status
}

fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(path)
        .to_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
