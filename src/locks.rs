//! Worker and per-task locks.
//!
//! Both lock kinds are create-or-fail files under `locks/` holding a
//! JSON [`LockRecord`]. Acquisition is non-blocking. The worker lock
//! supports stale-holder recovery (same host, dead pid); a present task
//! lock always means "skip for now" — TTL-based recovery is a future
//! extension.
//!
//! Guards remove their file on drop, so every exit path of a loop
//! iteration — including unexpected failure — releases deterministically.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::model::LockRecord;
use crate::queue::HandoffDir;

/// Fixed file name of the singleton worker lock.
pub const WORKER_LOCK_FILE: &str = "__worker__.lock";

// ---------------------------------------------------------------------------
// LockError
// ---------------------------------------------------------------------------

/// Why a lock could not be acquired.
#[derive(Debug)]
pub enum LockError {
    /// A live holder owns the lock.
    Busy {
        /// Path of the lock file.
        path: PathBuf,
        /// The holder's record, when it parsed.
        holder: Option<LockRecord>,
    },
    /// An I/O error while creating or inspecting the lock.
    Io {
        /// Path of the lock file.
        path: PathBuf,
        /// The underlying error.
        source: io::Error,
    },
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy { path, holder } => {
                write!(f, "lock '{}' is held", path.display())?;
                if let Some(h) = holder {
                    write!(f, " by pid {} on {}", h.pid, h.host)?;
                }
                Ok(())
            }
            Self::Io { path, source } => {
                write!(f, "lock I/O error at '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Busy { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Whether `pid` refers to a live process on this host.
///
/// On Linux this is a `/proc` lookup. Elsewhere the answer is a
/// conservative `true`, so stale locks are never reclaimed wrongly.
fn pid_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new("/proc").join(pid.to_string()).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        true
    }
}

fn this_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned())
}

/// Create the lock file exclusively. `Ok(false)` means it already exists.
fn try_create(path: &Path, record: &LockRecord) -> Result<bool, LockError> {
    let body = serde_json::to_vec_pretty(record).unwrap_or_default();
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(mut file) => {
            io::Write::write_all(&mut file, &body).map_err(|e| LockError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(LockError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn read_record(path: &Path) -> Option<LockRecord> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

// ---------------------------------------------------------------------------
// WorkerLock
// ---------------------------------------------------------------------------

/// Exclusive ownership of a handoff root. Removed on drop.
#[derive(Debug)]
pub struct WorkerLock {
    path: PathBuf,
    released: bool,
}

impl WorkerLock {
    /// Acquire the singleton worker lock.
    ///
    /// If the file exists, its holder is checked: same host with a live
    /// pid → [`LockError::Busy`]; anything else (dead pid, other host's
    /// leftover after a move, unparseable record) is treated as stale,
    /// removed, and acquisition retried once.
    pub fn acquire(handoff: &HandoffDir) -> Result<Self, LockError> {
        let path = handoff.locks_dir().join(WORKER_LOCK_FILE);
        let record = LockRecord::for_current_process(None);

        for _ in 0..2 {
            if try_create(&path, &record)? {
                return Ok(Self {
                    path,
                    released: false,
                });
            }

            match read_record(&path) {
                Some(holder) if holder.host == this_host() && pid_alive(holder.pid) => {
                    return Err(LockError::Busy {
                        path,
                        holder: Some(holder),
                    });
                }
                _ => {
                    // Stale (or unreadable) — remove and retry.
                    tracing::warn!(path = %path.display(), "removing stale worker lock");
                    if let Err(e) = fs::remove_file(&path)
                        && e.kind() != io::ErrorKind::NotFound
                    {
                        return Err(LockError::Io { path, source: e });
                    }
                }
            }
        }

        Err(LockError::Busy { path, holder: None })
    }

    /// Release explicitly (drop also releases).
    pub fn release(mut self) {
        self.unlink();
    }

    fn unlink(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

impl Drop for WorkerLock {
    fn drop(&mut self) {
        self.unlink();
    }
}

// ---------------------------------------------------------------------------
// TaskLock
// ---------------------------------------------------------------------------

/// Exclusive ownership of one task id. Removed on drop.
#[derive(Debug)]
pub struct TaskLock {
    path: PathBuf,
    released: bool,
}

impl TaskLock {
    /// Acquire `locks/<id>.lock`. Non-blocking: a present file means
    /// another operator holds the task, full stop.
    pub fn acquire(handoff: &HandoffDir, task_id: &str) -> Result<Self, LockError> {
        let path = handoff.locks_dir().join(format!("{task_id}.lock"));
        let record = LockRecord::for_current_process(Some(task_id.to_owned()));

        if try_create(&path, &record)? {
            Ok(Self {
                path,
                released: false,
            })
        } else {
            let holder = read_record(&path);
            Err(LockError::Busy { path, holder })
        }
    }

    fn unlink(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

impl Drop for TaskLock {
    fn drop(&mut self) {
        self.unlink();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn handoff() -> (TempDir, HandoffDir) {
        let dir = TempDir::new().unwrap();
        let h = HandoffDir::new(dir.path().join(".crucible"));
        h.ensure_layout().unwrap();
        (dir, h)
    }

    fn plant_lock(h: &HandoffDir, name: &str, pid: u32, host: &str) {
        let record = LockRecord {
            pid,
            host: host.to_owned(),
            created_at: Utc::now(),
            task_id: None,
            timeout_sec: None,
        };
        fs::write(
            h.locks_dir().join(name),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();
    }

    // A pid that cannot exist: beyond Linux's default pid_max.
    const DEAD_PID: u32 = 4_194_399;

    #[test]
    fn worker_lock_acquire_and_release() {
        let (_dir, h) = handoff();
        let lock = WorkerLock::acquire(&h).unwrap();
        let path = h.locks_dir().join(WORKER_LOCK_FILE);
        assert!(path.exists());

        let record = read_record(&path).unwrap();
        assert_eq!(record.pid, std::process::id());

        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn worker_lock_released_on_drop() {
        let (_dir, h) = handoff();
        {
            let _lock = WorkerLock::acquire(&h).unwrap();
        }
        assert!(!h.locks_dir().join(WORKER_LOCK_FILE).exists());
    }

    #[test]
    fn worker_lock_busy_for_live_holder() {
        let (_dir, h) = handoff();
        // Our own pid is definitely alive on this host.
        plant_lock(&h, WORKER_LOCK_FILE, std::process::id(), &this_host());

        let err = WorkerLock::acquire(&h).unwrap_err();
        assert!(matches!(err, LockError::Busy { .. }), "got {err}");
    }

    #[test]
    fn worker_lock_steals_from_dead_pid() {
        let (_dir, h) = handoff();
        plant_lock(&h, WORKER_LOCK_FILE, DEAD_PID, &this_host());

        let lock = WorkerLock::acquire(&h).unwrap();
        let record = read_record(&h.locks_dir().join(WORKER_LOCK_FILE)).unwrap();
        assert_eq!(record.pid, std::process::id());
        drop(lock);
    }

    #[test]
    fn worker_lock_steals_corrupt_record() {
        let (_dir, h) = handoff();
        fs::write(h.locks_dir().join(WORKER_LOCK_FILE), b"not json").unwrap();

        let lock = WorkerLock::acquire(&h);
        assert!(lock.is_ok(), "corrupt lock should be reclaimed");
    }

    #[test]
    fn task_lock_is_strictly_non_blocking() {
        let (_dir, h) = handoff();
        let _held = TaskLock::acquire(&h, "t1").unwrap();

        let err = TaskLock::acquire(&h, "t1").unwrap_err();
        assert!(matches!(err, LockError::Busy { .. }), "got {err}");
    }

    #[test]
    fn task_lock_never_steals_even_dead_holders() {
        let (_dir, h) = handoff();
        plant_lock(&h, "t1.lock", DEAD_PID, &this_host());

        // Unlike the worker lock, a present task lock always blocks.
        let err = TaskLock::acquire(&h, "t1").unwrap_err();
        assert!(matches!(err, LockError::Busy { .. }), "got {err}");
    }

    #[test]
    fn task_lock_records_task_id() {
        let (_dir, h) = handoff();
        let _lock = TaskLock::acquire(&h, "t9").unwrap();
        let record = read_record(&h.locks_dir().join("t9.lock")).unwrap();
        assert_eq!(record.task_id.as_deref(), Some("t9"));
    }

    #[test]
    fn distinct_task_locks_coexist() {
        let (_dir, h) = handoff();
        let _a = TaskLock::acquire(&h, "a").unwrap();
        let _b = TaskLock::acquire(&h, "b").unwrap();
    }
}
