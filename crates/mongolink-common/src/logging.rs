//! Tracing bootstrap shared by binaries and tests

use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Install a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"mongolink=info"`).
pub fn init(default_directive: &str) -> Result<()> {
    let directive = default_directive
        .parse()
        .map_err(|e| Error::Config(format!("invalid log directive {default_directive:?}: {e}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .with_target(true)
        .try_init()
        .map_err(|e| Error::Internal(format!("failed to install tracing subscriber: {e}")))
}

/// Like [`init`] but writes through the test harness and ignores a
/// subscriber that is already installed.
pub fn try_init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mongolink=debug")),
        )
        .with_test_writer()
        .try_init();
}
