//! Tracing setup for binaries and tests embedding the detection core.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a registry with an `EnvFilter` (from `RUST_LOG`, else
/// `default_directive`) and a fmt layer. Returns false when a global
/// subscriber was already installed.
pub fn init_tracing(default_directive: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_directive.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Test-friendly variant writing through the libtest capture.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coordination_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
