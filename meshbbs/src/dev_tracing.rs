//! Minimal tracing setup for binaries and examples. Not used by the
//! library itself — callers own their own subscriber.

use tracing_subscriber::EnvFilter;

/// Install a `tracing_subscriber::fmt` layer filtered by `RUST_LOG`,
/// defaulting to `info` when unset.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
