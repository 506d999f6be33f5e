//! On-disk record types: tasks, results, locks.
//!
//! Everything crossing the handoff directory is UTF-8 JSON with the
//! schemas defined here. Tasks are validated strictly on read; results
//! are written canonically and readers tolerate additive fields.

mod lock;
mod result;
mod task;

pub use lock::LockRecord;
pub use result::{
    Artifacts, ExitPath, ResultRecord, SecretIncident, TaskStatus, VerificationOutcome,
};
pub use task::{Task, TaskError, VerifySpec, is_valid_id};
