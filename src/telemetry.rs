//! Tracing subscriber setup for binaries and tests embedding the orchestrator.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the host. `init` is a convenience for hosts that have none.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Environment variable holding the filter directive, e.g. `leader=debug`.
pub const LOG_ENV: &str = "LEADER_LOG";

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install a global subscriber. Returns `false` if one was already set.
pub fn init(format: LogFormat, default_directive: &str) -> bool {
    let registry = tracing_subscriber::registry().with(filter(default_directive));
    let result = match format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    result.is_ok()
}

/// Install a test-friendly subscriber writing through the test harness.
pub fn init_for_tests() {
    let _ = tracing_subscriber::registry()
        .with(filter("leader=debug"))
        .with(fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_for_tests();
        assert!(!init(LogFormat::Json, "info"));
    }
}
