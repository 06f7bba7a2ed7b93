//! Tracing setup for the demo binaries.

use tracing_subscriber::EnvFilter;

/// Initializes a `tracing` subscriber reading `RUST_LOG`, defaulting to
/// `info` when unset. Call once at the top of `main`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
