//! Logging setup.
//!
//! The crate reports everything through [tracing]. Nothing is printed
//! unless the embedding application installs a subscriber. These helpers
//! install the formatting subscriber from [tracing_subscriber] the way the
//! test suite and simple applications want it.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Setup logging of events reported by the network core.
///
/// Use the RUST_LOG environment variable to override the defaults.
///
/// E.g. To enable debug level logging:
///   RUST_LOG=DEBUG
///
/// Or to log only what happens on inbound TCP connections:
///   RUST_LOG=recursor_net::net::server::stream=DEBUG
///
/// Or to enable trace level logging but not for the outgoing UDP path:
///   RUST_LOG=TRACE,recursor_net::net::client::udp=OFF
///
/// Calling this more than once is harmless, later calls do nothing.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .without_time()
        .try_init()
        .ok();
}

/// Setup logging with a default level used when RUST_LOG is not set.
///
/// Thread names are included because every thread runs its own worker.
pub fn init_logging_with_default(level: LevelFilter) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .try_init()
        .ok();
}
