//! Telemetry initialization.
//!
//! Structured events go to stderr. `RUST_LOG` controls the filter
//! (default `info`); `CRUCIBLE_LOG_FORMAT=json` switches to the JSON
//! formatter for machine consumption. Raw sandbox output is never
//! emitted as telemetry.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("CRUCIBLE_LOG_FORMAT").is_ok_and(|v| v == "json");

    if json {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }
}
