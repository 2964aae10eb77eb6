//! Load generator.
//!
//! Opens `workers` concurrent connections, each sending messages of roughly
//! `payload_bytes` and timing every round trip. The first worker to receive
//! `STOP` stops the whole run: its siblings check the shared stop switch
//! before each send and during the inter-message delay. Connection faults end
//! only the worker that hit them.

mod payload;
mod task;
mod thread;
mod timing;

pub use payload::build_payload;
pub use timing::{TimingStats, TimingSummary};

use crate::config::{LoadConfig, RuntimeType};
use crate::shutdown::Shutdown;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Result of one load generator run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadReport {
    /// Messages that received a reply
    pub sent: u64,
    pub elapsed: Duration,
    pub timing: TimingSummary,
    /// Whether the run ended because the server answered `STOP`
    pub stopped_by_server: bool,
}

impl LoadReport {
    /// Messages per second over the whole run.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.sent as f64 / secs
        } else {
            0.0
        }
    }
}

/// State shared by every load worker.
pub(crate) struct LoadContext {
    pub config: LoadConfig,
    pub stop: Arc<Shutdown>,
    pub timing: TimingStats,
    sent: AtomicU64,
    stopped_by_server: AtomicBool,
}

impl LoadContext {
    fn new(config: LoadConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            stop: Shutdown::new(),
            timing: TimingStats::new(),
            sent: AtomicU64::new(0),
            stopped_by_server: AtomicBool::new(false),
        })
    }

    /// Record one completed round trip.
    pub fn record(&self, elapsed: Duration) {
        self.timing.add_sample(elapsed);
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// The server told `worker` to stop; end the run for everyone.
    pub fn server_stopped(&self, worker: usize) {
        self.stopped_by_server.store(true, Ordering::Release);
        if self.stop.request("server replied STOP") {
            info!(worker, "Server replied STOP, stopping all workers");
        }
    }

    fn report(&self, elapsed: Duration) -> LoadReport {
        LoadReport {
            sent: self.sent.load(Ordering::Relaxed),
            elapsed,
            timing: self.timing.summarize(),
            stopped_by_server: self.stopped_by_server.load(Ordering::Acquire),
        }
    }
}

/// Drive the server until it answers `STOP` or every connection has ended.
pub fn run(config: LoadConfig) -> io::Result<LoadReport> {
    info!(
        server = %config.server_addr(),
        workers = config.workers,
        payload_bytes = config.payload_bytes,
        delay_ms = config.delay.as_millis() as u64,
        runtime = ?config.runtime,
        "Starting load generator"
    );

    let runtime = config.runtime;
    let ctx = LoadContext::new(config);
    let started = Instant::now();

    match runtime {
        RuntimeType::Thread => thread::run(Arc::clone(&ctx))?,
        RuntimeType::Task => task::run(Arc::clone(&ctx))?,
    }

    Ok(ctx.report(started.elapsed()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_stop_is_recorded_once() {
        let ctx = LoadContext::new(LoadConfig::default());
        ctx.record(Duration::from_millis(1));
        ctx.server_stopped(0);
        ctx.server_stopped(1);

        let report = ctx.report(Duration::from_secs(1));
        assert!(report.stopped_by_server);
        assert!(ctx.stop.is_requested());
        assert_eq!(report.sent, 1);
        assert_eq!(report.timing.count, 1);
        assert!((report.throughput() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unreachable_server_ends_quietly() {
        // Grab a free port, then release it so nothing listens there.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = LoadConfig {
            port,
            workers: 3,
            ..Default::default()
        };
        let report = run(config).unwrap();
        assert_eq!(report.sent, 0);
        assert!(!report.stopped_by_server);
    }
}
