//! Tracing setup shared by `podctl` and embedders of the core.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging at `info`, overridable with `RUST_LOG`.
pub fn init() {
    init_with_level("info")
}

/// Initialize logging with a specific default level
///
/// Pod command failures are logged at `error`, reconciliation actions
/// (splits, synthetic TBRs, recovered boluses) at `info`, and every executor
/// attempt at `debug`. `RUST_LOG` still takes precedence.
pub fn init_with_level(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A second init (e.g. library embedded in a host that already installed
    // a subscriber) is not an error for us.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init();
}

/// Initialize logging for testing (captures logs for test output)
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("debug"))
        .try_init();
}
