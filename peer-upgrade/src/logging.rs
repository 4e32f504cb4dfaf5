//! Logging setup for the daemon.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. `RUST_LOG` wins; otherwise `info`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
