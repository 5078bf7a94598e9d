//! tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Log filter variable; `RUST_LOG` is read when it is unset.
pub const LOG_ENV: &str = "KEEL_LOG";

/// Install the stderr subscriber. `verbose` raises the fallback level to debug.
pub fn init(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
