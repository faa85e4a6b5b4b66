//! Diagnostic tracing to stderr.
//!
//! This is not the run log. Operator-facing output goes to
//! `logs/engine-{runId}.log` through [`crate::io::run_log`], which is always
//! written and always redacted. Tracing here is for debugging the engine
//! itself and is silent above `warn` unless asked.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "ENGINEO_LOG";

const DEFAULT_FILTER: &str = "warn";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the stderr subscriber, e.g. `ENGINEO_LOG=engine=debug engine run`.
///
/// Later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}
