//! Shared test helpers for crucible integration tests.
//!
//! All tests use temp directories — no side effects on the real repo.
//! Each test gets its own git repo via [`TestEnv::new`], with the
//! handoff root gitignored the way a deployed setup would have it.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tempfile::TempDir;

use crucible::config::CrucibleConfig;
use crucible::model::{Task, VerifySpec};
use crucible::queue::HandoffDir;
use crucible::sandbox::InsecureRunner;
use crucible::worker::Worker;

/// A scratch repository with one commit on `main` and a ready handoff
/// directory.
pub struct TestEnv {
    // Held for its Drop; the path lives in `repo`.
    _dir: TempDir,
    pub repo: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        // Canonicalize: on some platforms TempDir paths go through
        // symlinks (/var -> /private/var) and path comparisons need the
        // real location.
        let repo = dir.path().canonicalize().expect("canonicalize temp dir");

        run_git(&repo, &["init", "-b", "main"]);
        run_git(&repo, &["config", "user.name", "Test User"]);
        run_git(&repo, &["config", "user.email", "test@example.com"]);
        run_git(&repo, &["config", "commit.gpgsign", "false"]);

        std::fs::create_dir_all(repo.join("src")).expect("mkdir src");
        std::fs::write(repo.join("src/a.txt"), "original\n").expect("write src/a.txt");
        std::fs::write(repo.join("README.md"), "# test repo\n").expect("write README");
        std::fs::write(repo.join(".gitignore"), ".crucible/\n").expect("write .gitignore");

        run_git(&repo, &["add", "."]);
        run_git(&repo, &["commit", "-m", "initial commit"]);

        let env = Self { _dir: dir, repo };
        env.handoff().ensure_layout().expect("handoff layout");
        env
    }

    pub fn handoff(&self) -> HandoffDir {
        HandoffDir::new(self.repo.join(".crucible"))
    }

    /// A worker on the insecure runner with the default (no-op echo)
    /// executor.
    pub fn worker(&self) -> Worker {
        self.worker_with_executor("echo", &[])
    }

    /// A worker whose executor is `cmd args... <prompt>` on the host.
    pub fn worker_with_executor(&self, cmd: &str, args: &[&str]) -> Worker {
        let mut config = CrucibleConfig::default();
        config.executor.cmd = cmd.to_owned();
        config.executor.args = args.iter().map(|s| (*s).to_owned()).collect();

        Worker::new(
            self.repo.clone(),
            config,
            Box::new(InsecureRunner),
            Arc::new(AtomicBool::new(false)),
        )
    }

    /// Drop a task file into `tasks/`.
    pub fn enqueue(&self, task: &Task) {
        let path = self.handoff().task_path(&task.id);
        let json = serde_json::to_vec_pretty(task).expect("serialize task");
        std::fs::write(path, json).expect("write task file");
    }

    /// Read and parse `results/<id>.json`.
    pub fn result(&self, id: &str) -> crucible::model::ResultRecord {
        let bytes =
            std::fs::read(self.handoff().result_path(id)).expect("result file should exist");
        crucible::model::ResultRecord::from_json(&bytes).expect("result should parse")
    }

    pub fn has_result(&self, id: &str) -> bool {
        self.handoff().result_path(id).exists()
    }
}

/// A task with sensible test defaults: scope `src/a.txt`, one `true`
/// verification, stop_on_failure on.
pub fn task(id: &str) -> Task {
    Task {
        id: id.to_owned(),
        created_at: "2026-01-02T03:04:05Z".parse().expect("timestamp"),
        prompt: "apply the change".to_owned(),
        scope: vec!["src/a.txt".to_owned()],
        verify: vec![verify("true", &[])],
        priority: None,
        stop_on_failure: true,
    }
}

pub fn verify(cmd: &str, args: &[&str]) -> VerifySpec {
    VerifySpec {
        cmd: cmd.to_owned(),
        args: args.iter().map(|s| (*s).to_owned()).collect(),
        expected_exit: 0,
        timeout_sec: 60,
    }
}

/// A verification entry that runs a shell snippet.
pub fn verify_sh(script: &str) -> VerifySpec {
    verify("sh", &["-c", script])
}

pub fn run_git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to run git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}
