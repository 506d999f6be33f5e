//! Task schema and validation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskError
// ---------------------------------------------------------------------------

/// A task file that cannot be accepted.
#[derive(Debug)]
pub enum TaskError {
    /// The file is not valid JSON for the task schema.
    Parse(serde_json::Error),
    /// The JSON parsed but violates a schema invariant.
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "task file is not valid JSON: {e}"),
            Self::Invalid { field, reason } => {
                write!(f, "invalid task field '{field}': {reason}")
            }
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Parse(e) => Some(e),
            Self::Invalid { .. } => None,
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e)
    }
}

// ---------------------------------------------------------------------------
// VerifySpec
// ---------------------------------------------------------------------------

/// One verification command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifySpec {
    /// The command to run inside the sandbox.
    pub cmd: String,

    /// Arguments for the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Exit code counted as a pass (default 0).
    #[serde(default)]
    pub expected_exit: i32,

    /// Per-command wall-clock timeout in seconds (default 60).
    #[serde(default = "default_verify_timeout")]
    pub timeout_sec: u64,
}

const fn default_verify_timeout() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// An immutable description of one unit of work.
///
/// Producers drop `<id>.json` files into `tasks/`; the worker validates
/// them with [`Task::from_json`] before touching anything else.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    /// Unique path-safe identifier; primary key across queue directories.
    pub id: String,

    /// Producer-assigned creation time, used for age ordering.
    pub created_at: DateTime<Utc>,

    /// Opaque instructions for the executor.
    pub prompt: String,

    /// Repository-relative path patterns the executor may modify.
    pub scope: Vec<String>,

    /// Verification commands, run in order.
    pub verify: Vec<VerifySpec>,

    /// Higher runs first; ties broken by age then id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,

    /// Whether a failing task ends the current queue pass (default true).
    #[serde(default = "default_stop_on_failure")]
    pub stop_on_failure: bool,
}

const fn default_stop_on_failure() -> bool {
    true
}

impl Task {
    /// Parse and validate a task file.
    pub fn from_json(bytes: &[u8]) -> Result<Self, TaskError> {
        let task: Self = serde_json::from_slice(bytes)?;
        task.validate()?;
        Ok(task)
    }

    /// Enforce the schema invariants.
    pub fn validate(&self) -> Result<(), TaskError> {
        if !is_valid_id(&self.id) {
            return Err(TaskError::Invalid {
                field: "id",
                reason: format!(
                    "'{}' must be non-empty [A-Za-z0-9._-]+ without '..'",
                    self.id
                ),
            });
        }
        if self.scope.is_empty() {
            return Err(TaskError::Invalid {
                field: "scope",
                reason: "must list at least one path pattern".to_owned(),
            });
        }
        if self.scope.iter().any(String::is_empty) {
            return Err(TaskError::Invalid {
                field: "scope",
                reason: "entries must be non-empty".to_owned(),
            });
        }
        for (i, v) in self.verify.iter().enumerate() {
            if v.cmd.is_empty() {
                return Err(TaskError::Invalid {
                    field: "verify",
                    reason: format!("entry {i} has an empty cmd"),
                });
            }
            if v.timeout_sec == 0 {
                return Err(TaskError::Invalid {
                    field: "verify",
                    reason: format!("entry {i} has a zero timeout"),
                });
            }
        }
        Ok(())
    }

    /// Sort key for queue ordering: priority descending, then oldest
    /// first, then id.
    pub fn queue_key(&self) -> (i64, DateTime<Utc>, String) {
        (-self.priority.unwrap_or(0), self.created_at, self.id.clone())
    }
}

/// Path-safe id: `[A-Za-z0-9._-]+`, no `..`, not a bare dot.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && !id.contains("..")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> Task {
        Task {
            id: "t1".to_owned(),
            created_at: "2026-01-02T03:04:05Z".parse().unwrap(),
            prompt: "add a flag".to_owned(),
            scope: vec!["src/a.txt".to_owned()],
            verify: vec![VerifySpec {
                cmd: "true".to_owned(),
                args: vec![],
                expected_exit: 0,
                timeout_sec: 60,
            }],
            priority: None,
            stop_on_failure: true,
        }
    }

    // -- id validation --

    #[test]
    fn accepts_typical_ids() {
        for id in ["t1", "fix-login.2", "A_b-C.d", "0"] {
            assert!(is_valid_id(id), "{id} should be valid");
        }
    }

    #[test]
    fn rejects_path_hazards() {
        for id in ["", ".", "..", "a..b", "a/b", "a\\b", "a b", "ä"] {
            assert!(!is_valid_id(id), "{id:?} should be invalid");
        }
    }

    // -- schema --

    #[test]
    fn round_trip_preserves_value() {
        let task = sample();
        let json = serde_json::to_vec(&task).unwrap();
        let back = Task::from_json(&json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn defaults_are_applied() {
        let json = br#"{
            "id": "t2",
            "created_at": "2026-01-02T03:04:05Z",
            "prompt": "p",
            "scope": ["src"],
            "verify": [{"cmd": "true"}]
        }"#;
        let task = Task::from_json(json).unwrap();
        assert!(task.stop_on_failure);
        assert_eq!(task.priority, None);
        assert_eq!(task.verify[0].expected_exit, 0);
        assert_eq!(task.verify[0].timeout_sec, 60);
        assert!(task.verify[0].args.is_empty());
    }

    #[test]
    fn rejects_unknown_fields() {
        let json = br#"{
            "id": "t3",
            "created_at": "2026-01-02T03:04:05Z",
            "prompt": "p",
            "scope": ["src"],
            "verify": [],
            "surprise": 1
        }"#;
        assert!(matches!(
            Task::from_json(json).unwrap_err(),
            TaskError::Parse(_)
        ));
    }

    #[test]
    fn rejects_empty_scope() {
        let mut task = sample();
        task.scope.clear();
        assert!(matches!(
            task.validate().unwrap_err(),
            TaskError::Invalid { field: "scope", .. }
        ));
    }

    #[test]
    fn rejects_empty_verify_cmd() {
        let mut task = sample();
        task.verify[0].cmd.clear();
        assert!(matches!(
            task.validate().unwrap_err(),
            TaskError::Invalid { field: "verify", .. }
        ));
    }

    #[test]
    fn empty_verify_list_is_allowed() {
        let mut task = sample();
        task.verify.clear();
        task.validate().unwrap();
    }

    // -- ordering --

    #[test]
    fn queue_key_orders_priority_then_age_then_id() {
        let mut a = sample();
        a.id = "a".to_owned();
        let mut b = sample();
        b.id = "b".to_owned();
        b.priority = Some(5);
        let mut c = sample();
        c.id = "c".to_owned();
        c.created_at = "2025-01-01T00:00:00Z".parse().unwrap();

        let mut tasks = [a, b, c];
        tasks.sort_by_key(Task::queue_key);
        let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        // b: highest priority; c: older than a.
        assert_eq!(ids, vec!["b", "c", "a"]);
    }
}
