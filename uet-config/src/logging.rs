//! Subscriber setup for binaries. The library itself only emits `tracing`
//! events and never installs a subscriber.

use tracing_subscriber::EnvFilter;

/// Installs a stderr formatter. `RUST_LOG` takes precedence over `default_filter`.
/// Calling it twice is harmless.
pub fn init(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
