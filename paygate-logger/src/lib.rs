//! Logger configuration for the paygate services.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{
    filter::Targets,
    layer::{Layer, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
};

/// Initialize the global `tracing` logger.
///
/// + Enabled events and spans are printed to stdout in compact form.
/// + The default level is INFO; set `RUST_LOG` to change the level or
///   filter per module (standard `tracing_subscriber::filter` syntax).
///
/// Panics if a logger is already initialized, so call this exactly once
/// from `main`.
pub fn init() {
    try_init().expect("Failed to set up logger");
}

/// Logger init for tests: no-op without `RUST_LOG`, and never panics when
/// multiple test threads race to install the global subscriber.
pub fn init_for_testing() {
    if std::env::var_os("RUST_LOG").is_none() {
        return;
    }
    let _ = try_init();
}

pub fn try_init() -> Result<(), TryInitError> {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|spec| Targets::from_str(&spec).ok())
        .unwrap_or_else(|| Targets::new().with_default(Level::INFO));

    let stdout_log = tracing_subscriber::fmt::layer()
        .compact()
        .with_level(true)
        .with_target(true)
        .with_filter(filter);

    tracing_subscriber::registry().with(stdout_log).try_init()
}
