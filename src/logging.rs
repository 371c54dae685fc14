//! Tracing initialization.
//!
//! Structured logging via `tracing` with environment-based filtering. The
//! filter honors `ISI_LOG`, then `RUST_LOG`, then the provided default.
//! Development runs get the pretty human format; production runs a compact
//! single-line format suitable for log capture.

use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable overriding the log filter.
pub const LOG_ENV_VAR: &str = "ISI_LOG";

/// Initialize the global subscriber. Safe to call once per process;
/// repeated calls (e.g. in tests) are ignored.
pub fn init(default_level: &str, pretty: bool) {
    let filter = std::env::var(LOG_ENV_VAR)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());

    let builder = fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_thread_names(true);

    let result = if pretty {
        builder.pretty().try_init()
    } else {
        builder.compact().try_init()
    };

    // A second init (tests, embedding) is not an error worth surfacing.
    drop(result);
}
