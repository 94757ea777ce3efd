//! Process-wide logging initialization, shared by every binary.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber reading `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}
