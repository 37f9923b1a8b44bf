//! Tracing setup. Logs go to stderr so presenters can own stdout.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "rill_core=info";

/// Install the global subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
