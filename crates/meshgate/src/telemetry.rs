//! Subscriber setup for binaries embedding the gateway.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::util::TryInitError;

/// Installs a formatted subscriber filtered by `RUST_LOG`, falling back to
/// `default_directives` (e.g. `"meshgate=info"`) when the variable is unset.
pub fn init(default_directives: &str) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
}
