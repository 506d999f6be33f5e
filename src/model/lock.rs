//! Lock file contents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// JSON body of a worker or task lock file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Pid of the holder.
    pub pid: u32,
    /// Hostname of the holder.
    pub host: String,
    /// When the lock was taken.
    pub created_at: DateTime<Utc>,
    /// The task this lock covers; absent for the worker lock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Advisory TTL in seconds, reserved for future stale-lock recovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
}

impl LockRecord {
    /// A record for the current process.
    pub fn for_current_process(task_id: Option<String>) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_owned());
        Self {
            pid: std::process::id(),
            host,
            created_at: Utc::now(),
            task_id,
            timeout_sec: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let record = LockRecord {
            pid: 4242,
            host: "worker-1".to_owned(),
            created_at: "2026-01-02T03:04:05Z".parse().unwrap(),
            task_id: Some("t1".to_owned()),
            timeout_sec: None,
        };
        let json = serde_json::to_vec(&record).unwrap();
        let back: LockRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn current_process_record_has_live_pid() {
        let record = LockRecord::for_current_process(None);
        assert_eq!(record.pid, std::process::id());
        assert!(record.task_id.is_none());
        assert!(!record.host.is_empty());
    }

    #[test]
    fn optional_fields_are_omitted() {
        let record = LockRecord::for_current_process(None);
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("task_id"));
        assert!(!json.contains("timeout_sec"));
    }
}
