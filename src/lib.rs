//! crucible library crate — the task-execution core.
//!
//! The primary interface is the `crucible` CLI binary; this crate
//! exposes the layered subsystems beneath it (safe filesystem, safe VCS,
//! stream scanner, sandbox runner, queue, locks, safety gates, and the
//! orchestration loop) for the binary and the integration tests.

pub mod config;
pub mod git;
pub mod locks;
pub mod model;
pub mod proc;
pub mod queue;
pub mod safefs;
pub mod safety;
pub mod sandbox;
pub mod scanner;
pub mod telemetry;
pub mod worker;
