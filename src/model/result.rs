//! Result schema: the canonical record of one task's lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::task::Task;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Coarse outcome classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// All verification commands passed.
    Success,
    /// The task ran but a gate or verification failed.
    Failed,
    /// The task could not be run to completion.
    Error,
    /// A secret pattern appeared in some output stream.
    SecretDetected,
}

// ---------------------------------------------------------------------------
// ExitPath
// ---------------------------------------------------------------------------

/// The terminal transition of a task. Exactly one per result; the wire
/// names are a fixed contract with downstream consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPath {
    CompletedSuccess,
    CompletedFailed,
    WorkerLocked,
    SchemaInvalid,
    IdempotentSkip,
    BranchCheckoutFailed,
    RepoDirty,
    OpencodeTimeout,
    OpencodeCrashed,
    VerifyFailed,
    ScopeViolation,
    SecretDetected,
    InternalError,
}

impl ExitPath {
    /// The status recorded alongside this exit path.
    pub const fn status(self) -> TaskStatus {
        match self {
            Self::CompletedSuccess | Self::IdempotentSkip => TaskStatus::Success,
            Self::CompletedFailed | Self::VerifyFailed | Self::ScopeViolation | Self::RepoDirty => {
                TaskStatus::Failed
            }
            Self::SecretDetected => TaskStatus::SecretDetected,
            Self::WorkerLocked
            | Self::SchemaInvalid
            | Self::BranchCheckoutFailed
            | Self::OpencodeTimeout
            | Self::OpencodeCrashed
            | Self::InternalError => TaskStatus::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Verification outcome
// ---------------------------------------------------------------------------

/// Record of one verification command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    /// The command that ran.
    pub cmd: String,
    /// Its arguments.
    pub args: Vec<String>,
    /// Observed exit code.
    pub exit_code: i32,
    /// Exit code that counts as a pass.
    pub expected_exit: i32,
    /// Whether the command passed (matched exit, no timeout).
    pub passed: bool,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Captured stdout, capped at the result-record limit.
    #[serde(default)]
    pub stdout: String,
    /// Captured stderr, capped at the result-record limit.
    #[serde(default)]
    pub stderr: String,
    /// Whether either stream exceeded the cap (full payload spilled to
    /// `logs/`).
    pub output_truncated: bool,
}

// ---------------------------------------------------------------------------
// Artifacts & incidents
// ---------------------------------------------------------------------------

/// Paths (relative to the handoff root) of files produced for a task.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    /// First spilled overflow log, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    /// The post-execution patch, if one was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_path: Option<String>,
}

/// Record of a secret detection. Pattern names only — the matched bytes
/// are never persisted anywhere.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretIncident {
    /// Sorted, deduplicated catalog names that matched.
    pub patterns: Vec<String>,
    /// Total number of matches across all streams.
    pub match_count: u64,
    /// First 16 hex chars of SHA-256 over `task_id ',' patterns`;
    /// correlates duplicate incidents without revealing matched text.
    pub incident_hash: String,
}

impl SecretIncident {
    /// Build an incident from the matched pattern names.
    pub fn new(task_id: &str, mut patterns: Vec<String>, match_count: u64) -> Self {
        patterns.sort();
        patterns.dedup();

        let mut hasher = Sha256::new();
        hasher.update(task_id.as_bytes());
        hasher.update(b",");
        hasher.update(patterns.join(",").as_bytes());
        let digest = hasher.finalize();

        let mut hash = String::with_capacity(16);
        for byte in digest.iter().take(8) {
            hash.push_str(&format!("{byte:02x}"));
        }

        Self {
            patterns,
            match_count,
            incident_hash: hash,
        }
    }
}

// ---------------------------------------------------------------------------
// ResultRecord
// ---------------------------------------------------------------------------

/// The one durable record emitted per task.
///
/// Unknown fields are tolerated on read so additive schema growth does
/// not break older consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// The task's id.
    pub task_id: String,
    /// Full copy of the task as claimed, for audit. Absent only when the
    /// task file never parsed (`schema_invalid`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_snapshot: Option<Task>,
    /// Coarse outcome.
    pub status: TaskStatus,
    /// The terminal transition taken.
    pub exit_path: ExitPath,
    /// Human-readable explanation for non-success paths.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When processing began.
    pub started_at: DateTime<Utc>,
    /// When the result was finalized.
    pub completed_at: DateTime<Utc>,
    /// Total wall-clock milliseconds.
    pub duration_ms: u64,
    /// Per-command verification records, in execution order.
    pub verification: Vec<VerificationOutcome>,
    /// Branch the work ran on, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// `HEAD` before the executor ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_before: Option<String>,
    /// `HEAD` after the work was committed, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_after: Option<String>,
    /// Repository-relative paths the executor touched.
    pub files_changed: Vec<String>,
    /// Produced files under the handoff root.
    #[serde(default)]
    pub artifacts: Artifacts,
    /// Present iff `status` is `secret_detected`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_incident: Option<SecretIncident>,
    /// Whether the host-process runner was used. Must be `false` in
    /// production.
    pub insecure_runner_used: bool,
}

impl ResultRecord {
    /// Serialize to the canonical on-disk form.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parse a result file.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
