//! framelog: a length-prefixed TCP message logger.
//!
//! The server accepts many concurrent connections, appends every received
//! message to a single shared log file and replies `OK`, until the log
//! reaches its size limit. It then replies `STOP`, stops accepting, drains
//! its connection workers and reports. A companion load generator drives it.
//!
//! Features:
//! - 4-byte big-endian length-prefixed UTF-8 frames
//! - Thread-per-connection or task-per-connection dispatch
//! - Once-only cooperative shutdown with a bounded drain
//! - Configuration via CLI arguments or TOML file

pub mod config;
pub mod connection;
pub mod frame;
pub mod loadgen;
pub mod runtime;
pub mod shutdown;
pub mod sink;

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` overrides `level`.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
