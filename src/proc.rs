//! Subprocess execution with capture and a wall-clock deadline.
//!
//! Both the VCS layer and the sandbox runner spawn external commands and
//! need the same shape: stdout and stderr drained concurrently (so a
//! chatty child never deadlocks on a full pipe), a hard wall-clock
//! timeout, and `SIGKILL` on expiry with whatever output accumulated so
//! far still returned.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// How often the parent polls the child for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long to keep draining pipes after the child is gone. Orphaned
/// grandchildren can hold the write end open indefinitely; past this
/// grace period the reader threads are abandoned and the bytes collected
/// so far are returned.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured outcome of one subprocess run.
#[derive(Debug)]
pub struct Captured {
    /// Process exit code; `-1` if terminated by a signal.
    pub exit_code: i32,
    /// Accumulated stdout bytes.
    pub stdout: Vec<u8>,
    /// Accumulated stderr bytes.
    pub stderr: Vec<u8>,
    /// Whether the deadline expired and the child was killed.
    pub timed_out: bool,
    /// Wall-clock duration of the run.
    pub duration: Duration,
}

impl Captured {
    /// Duration in whole milliseconds, as recorded in result files.
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }

    /// Whether the child exited zero without timing out.
    pub const fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Run `cmd` to completion or until `timeout` elapses.
///
/// On expiry the child receives `SIGKILL` (`Child::kill`); the partial
/// output is still collected and returned with `timed_out = true`.
pub fn run_captured(cmd: &mut Command, timeout: Duration) -> std::io::Result<Captured> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let start = Instant::now();
    let mut child = cmd.spawn()?;

    let out_buf = Arc::new(Mutex::new(Vec::new()));
    let err_buf = Arc::new(Mutex::new(Vec::new()));

    let out_handle = spawn_drain(child.stdout.take(), Arc::clone(&out_buf));
    let err_handle = spawn_drain(child.stderr.take(), Arc::clone(&err_buf));

    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            timed_out = true;
            let _ = child.kill();
            break child.wait()?;
        }
        thread::sleep(POLL_INTERVAL);
    };

    // Let the readers finish; abandon them if a straggler keeps the pipe
    // open past the grace period.
    let drain_deadline = Instant::now() + DRAIN_GRACE;
    while (!out_handle.is_finished() || !err_handle.is_finished())
        && Instant::now() < drain_deadline
    {
        thread::sleep(POLL_INTERVAL);
    }

    let stdout = snapshot(&out_buf);
    let stderr = snapshot(&err_buf);

    Ok(Captured {
        exit_code: status.code().unwrap_or(-1),
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

fn spawn_drain<R: Read + Send + 'static>(
    pipe: Option<R>,
    buf: Arc<Mutex<Vec<u8>>>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let Some(mut pipe) = pipe else { return };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut b) = buf.lock() {
                        b.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

fn snapshot(buf: &Arc<Mutex<Vec<u8>>>) -> Vec<u8> {
    buf.lock().map(|b| b.clone()).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello; exit 3"]);
        let cap = run_captured(&mut cmd, Duration::from_secs(10)).unwrap();
        assert_eq!(cap.exit_code, 3);
        assert_eq!(cap.stdout, b"hello\n");
        assert!(!cap.timed_out);
    }

    #[test]
    fn captures_stderr_separately() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let cap = run_captured(&mut cmd, Duration::from_secs(10)).unwrap();
        assert_eq!(cap.stdout, b"out\n");
        assert_eq!(cap.stderr, b"err\n");
        assert!(cap.success());
    }

    #[test]
    fn kills_on_timeout_and_keeps_partial_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo started; sleep 30"]);
        let start = Instant::now();
        let cap = run_captured(&mut cmd, Duration::from_millis(300)).unwrap();
        assert!(cap.timed_out);
        assert_eq!(cap.stdout, b"started\n");
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "child was not killed promptly"
        );
    }

    #[test]
    fn large_output_does_not_deadlock() {
        // Well past the 64 KiB pipe buffer.
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "head -c 1048576 /dev/zero"]);
        let cap = run_captured(&mut cmd, Duration::from_secs(30)).unwrap();
        assert_eq!(cap.stdout.len(), 1_048_576);
        assert!(cap.success());
    }

    #[test]
    fn missing_binary_is_spawn_error() {
        let mut cmd = Command::new("definitely-not-a-real-binary-1b2c3");
        assert!(run_captured(&mut cmd, Duration::from_secs(1)).is_err());
    }
}
