//! The orchestration loop.
//!
//! One worker owns a handoff root (worker lock), polls `tasks/`, and
//! drives each task through the state machine: claim → worktree →
//! executor → verify → gates → result → cleanup. Failures of any step
//! become an exit path in the task's result; the worker itself never
//! crashes mid-pass. The only fatal conditions are pre-flight (engine or
//! image missing) and a busy worker lock, both before any task is
//! touched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::CrucibleConfig;
use crate::git::Git;
use crate::model::{
    Artifacts, ExitPath, ResultRecord, SecretIncident, Task, VerificationOutcome, is_valid_id,
};
use crate::locks::{LockError, TaskLock, WorkerLock};
use crate::queue::{HandoffDir, TaskFile};
use crate::safefs;
use crate::safety;
use crate::sandbox::{RunResult, Sandbox};
use crate::scanner::StreamScanner;

/// Captured stream bytes beyond this are spilled to `logs/` instead of
/// the result record.
pub const STREAM_CAP_BYTES: usize = 10 * 1024;

/// Granularity of shutdown-flag checks while sleeping between passes.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A single-threaded queue worker bound to one repository and one
/// handoff root.
pub struct Worker {
    repo: PathBuf,
    handoff: HandoffDir,
    git: Git,
    sandbox: Box<dyn Sandbox>,
    config: CrucibleConfig,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    /// Assemble a worker. Nothing is touched until [`run`](Self::run).
    pub fn new(
        repo: PathBuf,
        config: CrucibleConfig,
        sandbox: Box<dyn Sandbox>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let handoff = HandoffDir::new(repo.join(&config.queue.root));
        let git = Git::new(Duration::from_secs(config.vcs.timeout_secs));
        Self {
            repo,
            handoff,
            git,
            sandbox,
            config,
            shutdown,
        }
    }

    /// The worker's handoff directory.
    pub fn handoff(&self) -> &HandoffDir {
        &self.handoff
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run the loop: single pass with `once`, otherwise poll until a
    /// shutdown signal or a `stop_on_failure` task failure.
    pub fn run(&self, once: bool) -> Result<()> {
        info!(backend = %self.sandbox.describe(), repo = %self.repo.display(), "worker starting");
        if self.sandbox.is_insecure() {
            warn!("running WITHOUT container isolation; results will be marked insecure");
        }

        // Pre-flight: fail fast before claiming anything.
        if !self.git.is_repo(&self.repo) {
            bail!("'{}' is not a git repository", self.repo.display());
        }
        if !self.sandbox.is_engine_available() {
            bail!(
                "execution engine is not reachable ({}); install or start it, or pass --insecure-runner for development",
                self.sandbox.describe()
            );
        }
        if !self.sandbox.is_image_available() {
            bail!(
                "sandbox image is not available locally ({})",
                self.sandbox.describe()
            );
        }

        self.handoff
            .ensure_layout()
            .context("failed to create handoff directory layout")?;

        let worker_lock = match WorkerLock::acquire(&self.handoff) {
            Ok(lock) => lock,
            Err(e @ LockError::Busy { .. }) => bail!("{e}; refusing to start a second worker"),
            Err(e) => return Err(e).context("failed to acquire worker lock"),
        };

        let outcome = self.poll_loop(once);
        worker_lock.release();
        info!("worker stopped");
        outcome
    }

    fn poll_loop(&self, once: bool) -> Result<()> {
        loop {
            if self.stopping() {
                info!("shutdown requested; stopping after current pass");
                return Ok(());
            }

            let halted = self.run_pass()?;
            if halted {
                info!("stop_on_failure task failed; ending the loop");
                return Ok(());
            }
            if once {
                return Ok(());
            }

            let deadline =
                Instant::now() + Duration::from_secs(self.config.queue.poll_interval_secs);
            while Instant::now() < deadline {
                if self.stopping() {
                    return Ok(());
                }
                std::thread::sleep(SLEEP_SLICE);
            }
        }
    }

    /// One pass over `tasks/`. Returns `true` when a `stop_on_failure`
    /// task failed and the loop must end.
    fn run_pass(&self) -> Result<bool> {
        let entries = self
            .handoff
            .list_tasks()
            .context("failed to enumerate tasks")?;

        for entry in entries {
            if self.stopping() {
                return Ok(false);
            }

            match &entry.parsed {
                Err(err) => self.reject_invalid(&entry, err),
                Ok(task) => {
                    if self.handoff.has_result(&task.id) {
                        debug!(task_id = %task.id, "result already exists; idempotent skip");
                        continue;
                    }

                    let _task_lock = match TaskLock::acquire(&self.handoff, &task.id) {
                        Ok(lock) => lock,
                        Err(LockError::Busy { .. }) => {
                            debug!(task_id = %task.id, "task lock held elsewhere; skipping");
                            continue;
                        }
                        Err(e) => {
                            warn!(task_id = %task.id, error = %e, "task lock failed; skipping");
                            continue;
                        }
                    };

                    if let Err(e) = self.handoff.claim(&task.id) {
                        // The file vanished between listing and claiming.
                        debug!(task_id = %task.id, error = %e, "claim failed; skipping");
                        continue;
                    }

                    info!(task_id = %task.id, "task claimed");
                    let record = self.execute(task);
                    let failed = matches!(
                        record.exit_path,
                        ExitPath::CompletedFailed | ExitPath::VerifyFailed
                    );
                    info!(
                        task_id = %task.id,
                        exit_path = ?record.exit_path,
                        duration_ms = record.duration_ms,
                        "task finished"
                    );

                    self.write_result(&record);
                    if let Err(e) = self.handoff.finish_running(&task.id) {
                        warn!(task_id = %task.id, error = %e, "failed to remove running marker");
                    }

                    if failed && task.stop_on_failure {
                        return Ok(true);
                    }
                }
            }
        }

        Ok(false)
    }

    /// A task file that failed schema validation: record the rejection
    /// (when the filename yields a usable id) and delete the file.
    fn reject_invalid(&self, entry: &TaskFile, err: &crate::model::TaskError) {
        warn!(file = %entry.path.display(), error = %err, "rejecting invalid task file");

        if is_valid_id(&entry.id) && !self.handoff.has_result(&entry.id) {
            let now = Utc::now();
            let record = ResultRecord {
                task_id: entry.id.clone(),
                task_snapshot: None,
                status: ExitPath::SchemaInvalid.status(),
                exit_path: ExitPath::SchemaInvalid,
                reason: Some(err.to_string()),
                started_at: now,
                completed_at: now,
                duration_ms: 0,
                verification: Vec::new(),
                branch: None,
                commit_before: None,
                commit_after: None,
                files_changed: Vec::new(),
                artifacts: Artifacts::default(),
                secret_incident: None,
                insecure_runner_used: self.sandbox.is_insecure(),
            };
            self.write_result(&record);
        }

        if let Err(e) = safefs::unlink(&entry.path, self.handoff.root()) {
            warn!(file = %entry.path.display(), error = %e, "failed to delete invalid task file");
        }
    }

    fn write_result(&self, record: &ResultRecord) {
        let rel = Path::new("results").join(format!("{}.json", record.task_id));
        let bytes = match record.to_json() {
            Ok(b) => b,
            Err(e) => {
                error!(task_id = %record.task_id, error = %e, "result serialization failed");
                return;
            }
        };
        if let Err(e) = safefs::write_atomic(&rel, &bytes, self.handoff.root()) {
            error!(task_id = %record.task_id, error = %e, "result write failed");
        }
    }

    // -----------------------------------------------------------------------
    // Per-task execution
    // -----------------------------------------------------------------------

    /// Drive one claimed task to a terminal record. Never fails: any
    /// unexpected error becomes `internal_error` and the worktree guard
    /// still cleans up.
    fn execute(&self, task: &Task) -> ResultRecord {
        let mut run = TaskRun::begin(task, self.sandbox.is_insecure());
        let exit_path = match self.try_execute(task, &mut run) {
            Ok(path) => path,
            Err(e) => {
                error!(task_id = %task.id, error = %format!("{e:#}"), "internal error");
                run.reason = Some(format!("{e:#}"));
                ExitPath::InternalError
            }
        };
        run.finish(exit_path)
    }

    fn try_execute(&self, task: &Task, run: &mut TaskRun) -> Result<ExitPath> {
        // Dirty-repo gate: refuse to base work on uncommitted state.
        if self.git.is_dirty(&self.repo).context("dirty check failed")? {
            run.reason = Some("target repository has uncommitted changes".to_owned());
            return Ok(ExitPath::RepoDirty);
        }

        let commit_before = self.git.head_commit(&self.repo).context("rev-parse HEAD")?;
        run.commit_before = Some(commit_before.clone());
        let current_branch = self
            .git
            .current_branch(&self.repo)
            .context("current branch")?;

        // Auto-branch rule: never work directly on main/master.
        let task_branch = safety::auto_branch(&current_branch, &task.id);
        run.branch = Some(
            task_branch
                .clone()
                .unwrap_or_else(|| current_branch.clone()),
        );

        let ws = self.handoff.worktree_path(&task.id);
        let created = match &task_branch {
            Some(branch) => self.git.worktree_add(&self.repo, &ws, branch),
            None => self.git.worktree_add_detached(&self.repo, &ws),
        };
        if let Err(e) = created {
            run.reason = Some(e.to_string());
            return Ok(ExitPath::BranchCheckoutFailed);
        }
        let _guard = WorktreeGuard {
            git: self.git.clone(),
            repo: self.repo.clone(),
            ws: ws.clone(),
            tmp: self.handoff.tmp_dir(),
        };

        // The executor, sandboxed exactly like verification commands.
        match self.run_executor(task, &ws) {
            ExecutorOutcome::Ok => {}
            ExecutorOutcome::Exit(path, reason) => {
                run.reason = Some(reason);
                return Ok(path);
            }
            ExecutorOutcome::Secret(matches) => {
                return Ok(run.secret_detected(&task.id, &matches));
            }
        }

        // Verification commands, in order, each scanned before anything
        // about it is persisted.
        let mut all_passed = true;
        let mut failed_count = 0usize;
        for (index, spec) in task.verify.iter().enumerate() {
            let result = match self.sandbox.run(
                &ws,
                &spec.cmd,
                &spec.args,
                Duration::from_secs(spec.timeout_sec),
            ) {
                Ok(r) => r,
                Err(e) => {
                    run.reason = Some(format!("verify command '{}' failed to run: {e}", spec.cmd));
                    return Ok(ExitPath::VerifyFailed);
                }
            };

            let matches = scan_streams(&result);
            if !matches.is_empty() {
                return Ok(run.secret_detected(&task.id, &matches));
            }

            let (stdout, out_truncated) = cap_stream(&result.stdout);
            let (stderr, err_truncated) = cap_stream(&result.stderr);
            if out_truncated {
                self.spill_log(run, &task.id, index, "stdout", &result.stdout);
            }
            if err_truncated {
                self.spill_log(run, &task.id, index, "stderr", &result.stderr);
            }

            let passed = !result.timed_out && result.exit_code == spec.expected_exit;
            if !passed {
                all_passed = false;
                failed_count += 1;
            }

            run.verification.push(VerificationOutcome {
                cmd: spec.cmd.clone(),
                args: spec.args.clone(),
                exit_code: result.exit_code,
                expected_exit: spec.expected_exit,
                passed,
                duration_ms: result.duration_ms,
                stdout,
                stderr,
                output_truncated: out_truncated || err_truncated,
            });
            debug!(task_id = %task.id, cmd = %spec.cmd, passed, "verification command done");
        }

        // Post-execution gates on the actual change set.
        let status = self.git.status(&ws).context("worktree status")?;
        run.files_changed = status.changed_files();

        let forbidden = safety::forbidden_created_files(&status.created_files());
        if !forbidden.is_empty() {
            run.reason = Some(format!(
                "forbidden files created: {}",
                forbidden.join(", ")
            ));
            return Ok(ExitPath::ScopeViolation);
        }

        let violations = safety::scope_violations(&task.scope, &run.files_changed);
        if !violations.is_empty() {
            run.reason = Some(format!("out-of-scope changes: {}", violations.join(", ")));
            return Ok(ExitPath::ScopeViolation);
        }

        // Commit the work on the task branch and emit the patch.
        if !run.files_changed.is_empty() {
            self.git.add_all(&ws).context("stage changes")?;
            self.git
                .commit(&ws, &format!("crucible: {}", task.id))
                .context("commit task changes")?;
            let commit_after = self.git.head_commit(&ws).context("rev-parse new HEAD")?;
            run.commit_after = Some(commit_after.clone());

            let patch = self
                .git
                .diff_range(&ws, &commit_before, &commit_after)
                .context("produce patch")?;
            let rel = Path::new("patches").join(format!("{}.patch", task.id));
            safefs::write_atomic(&rel, patch.as_bytes(), self.handoff.root())
                .context("write patch")?;
            run.artifacts.patch_path = Some(format!("patches/{}.patch", task.id));
        }

        if all_passed {
            Ok(ExitPath::CompletedSuccess)
        } else {
            run.reason = Some(format!(
                "{failed_count} of {} verification commands failed",
                task.verify.len()
            ));
            Ok(ExitPath::CompletedFailed)
        }
    }

    fn run_executor(&self, task: &Task, ws: &Path) -> ExecutorOutcome {
        let exec = &self.config.executor;
        let mut args = exec.args.clone();
        args.push(task.prompt.clone());

        let result = match self.sandbox.run(
            ws,
            &exec.cmd,
            &args,
            Duration::from_secs(exec.timeout_secs),
        ) {
            Ok(r) => r,
            Err(e) => {
                return ExecutorOutcome::Exit(
                    ExitPath::OpencodeCrashed,
                    format!("executor failed to start: {e}"),
                );
            }
        };

        let matches = scan_streams(&result);
        if !matches.is_empty() {
            return ExecutorOutcome::Secret(matches);
        }
        if result.timed_out {
            return ExecutorOutcome::Exit(
                ExitPath::OpencodeTimeout,
                format!("executor exceeded {} s", exec.timeout_secs),
            );
        }
        if result.exit_code != 0 {
            return ExecutorOutcome::Exit(
                ExitPath::OpencodeCrashed,
                format!("executor exited with code {}", result.exit_code),
            );
        }
        ExecutorOutcome::Ok
    }

    fn spill_log(&self, run: &mut TaskRun, id: &str, index: usize, stream: &str, bytes: &[u8]) {
        let rel = Path::new("logs").join(format!("{id}_{index}_{stream}.log"));
        match safefs::write_atomic(&rel, bytes, self.handoff.root()) {
            Ok(()) => {
                if run.artifacts.log_path.is_none() {
                    run.artifacts.log_path = Some(format!("logs/{id}_{index}_{stream}.log"));
                }
            }
            Err(e) => warn!(task_id = %id, error = %e, "failed to spill overflow log"),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution helpers
// ---------------------------------------------------------------------------

enum ExecutorOutcome {
    Ok,
    Exit(ExitPath, String),
    Secret(Vec<&'static str>),
}

/// Scan both output streams of one command; a fresh scanner per stream.
/// Returns the matched pattern names (positions are logged nowhere —
/// incidents carry names only).
fn scan_streams(result: &RunResult) -> Vec<&'static str> {
    let mut names = Vec::new();
    for stream in [&result.stdout, &result.stderr] {
        let mut scanner = StreamScanner::new();
        let mut matches = scanner.scan(stream);
        matches.extend(scanner.finalize());
        names.extend(matches.into_iter().map(|m| m.pattern));
    }
    names
}

/// Cap a stream for the result record. Exactly the cap is kept verbatim;
/// anything longer is cut (and spilled by the caller).
fn cap_stream(bytes: &[u8]) -> (String, bool) {
    if bytes.len() <= STREAM_CAP_BYTES {
        (String::from_utf8_lossy(bytes).into_owned(), false)
    } else {
        (
            String::from_utf8_lossy(&bytes[..STREAM_CAP_BYTES]).into_owned(),
            true,
        )
    }
}

/// Accumulator for one task's result fields.
struct TaskRun {
    task: Task,
    insecure: bool,
    started_at: DateTime<Utc>,
    t0: Instant,
    verification: Vec<VerificationOutcome>,
    branch: Option<String>,
    commit_before: Option<String>,
    commit_after: Option<String>,
    files_changed: Vec<String>,
    artifacts: Artifacts,
    secret_incident: Option<SecretIncident>,
    reason: Option<String>,
}

impl TaskRun {
    fn begin(task: &Task, insecure: bool) -> Self {
        Self {
            task: task.clone(),
            insecure,
            started_at: Utc::now(),
            t0: Instant::now(),
            verification: Vec::new(),
            branch: None,
            commit_before: None,
            commit_after: None,
            files_changed: Vec::new(),
            artifacts: Artifacts::default(),
            secret_incident: None,
            reason: None,
        }
    }

    /// Record a detection and redact everything gathered so far: no
    /// artifacts, no captured output, no logs.
    fn secret_detected(&mut self, task_id: &str, patterns: &[&'static str]) -> ExitPath {
        warn!(task_id = %task_id, count = patterns.len(), "secret detected in command output");
        let names: Vec<String> = patterns.iter().map(|p| (*p).to_owned()).collect();
        self.secret_incident = Some(SecretIncident::new(
            task_id,
            names,
            patterns.len() as u64,
        ));
        for outcome in &mut self.verification {
            outcome.stdout.clear();
            outcome.stderr.clear();
        }
        self.artifacts = Artifacts::default();
        self.reason = Some("secret pattern detected in command output".to_owned());
        ExitPath::SecretDetected
    }

    fn finish(self, exit_path: ExitPath) -> ResultRecord {
        let (artifacts, verification) = if exit_path == ExitPath::SecretDetected {
            // Redundant with secret_detected(), but the invariant is
            // cheap to hold unconditionally here.
            (Artifacts::default(), {
                let mut v = self.verification;
                for outcome in &mut v {
                    outcome.stdout.clear();
                    outcome.stderr.clear();
                }
                v
            })
        } else {
            (self.artifacts, self.verification)
        };

        ResultRecord {
            task_id: self.task.id.clone(),
            task_snapshot: Some(self.task),
            status: exit_path.status(),
            exit_path,
            reason: self.reason,
            started_at: self.started_at,
            completed_at: Utc::now(),
            duration_ms: u64::try_from(self.t0.elapsed().as_millis()).unwrap_or(u64::MAX),
            verification,
            branch: self.branch,
            commit_before: self.commit_before,
            commit_after: self.commit_after,
            files_changed: self.files_changed,
            artifacts,
            secret_incident: self.secret_incident,
            insecure_runner_used: self.insecure,
        }
    }
}

/// Removes the per-task worktree on every exit path. Refuses to remove a
/// path that is not confined to the handoff `tmp/` directory.
struct WorktreeGuard {
    git: Git,
    repo: PathBuf,
    ws: PathBuf,
    tmp: PathBuf,
}

impl Drop for WorktreeGuard {
    fn drop(&mut self) {
        if !safefs::is_contained(&self.ws, &self.tmp) {
            warn!(ws = %self.ws.display(), "refusing to remove worktree outside tmp/");
            return;
        }
        if let Err(e) = self.git.worktree_remove(&self.repo, &self.ws) {
            warn!(ws = %self.ws.display(), error = %e, "worktree cleanup failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
