//! Thin wrapper around `tracing-subscriber` initialization, matching the
//! way the forwarder and receiver binaries wire up logging. Library code
//! never calls this itself — only binaries and examples should.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing-subscriber` fmt layer driven by `RUST_LOG` (default
/// `info`). Safe to call once per process; a second call is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
