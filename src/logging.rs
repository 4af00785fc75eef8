//! Thin `tracing` init helper shared by the binary and the test suite.

use tracing_subscriber::EnvFilter;

/// Installs a process-wide `fmt` subscriber. Level defaults to `info` and
/// is overridable via `RUST_LOG`. Safe to call more than once; subsequent
/// calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
