//! Connection dispatch.
//!
//! Two interchangeable strategies, picked by `RuntimeType`:
//! - `thread`: one OS thread per connection over blocking sockets
//! - `task`: one tokio task per connection on a multi-threaded runtime
//!
//! Both share the same listener setup, the `ConnState` machine and the
//! `ServerContext`, and both end the same way: stop accepting, wait a
//! bounded grace period for workers, close the message log, report.

mod task;
mod thread;

use crate::config::{Config, RuntimeType};
use crate::connection::ServerContext;
use crate::shutdown::Shutdown;
use crate::sink::LogSink;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Listen backlog for the accept socket.
const BACKLOG: i32 = 1024;

/// How often the drain re-checks worker completion.
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Why the accept loop stopped.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The listener was stopped by a shutdown request.
    #[error("listener stopped")]
    Stopped,
    /// The listener failed for a reason unrelated to shutdown.
    #[error("accept failed: {0}")]
    Fatal(#[source] io::Error),
}

impl AcceptError {
    /// Classify an `accept` failure. `None` means retry.
    fn from_io(err: io::Error, shutdown: &Shutdown) -> Option<Self> {
        if shutdown.is_requested() {
            return Some(AcceptError::Stopped);
        }
        match err.kind() {
            // Per-connection failures, not listener failures.
            io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset => None,
            _ => Some(AcceptError::Fatal(err)),
        }
    }
}

/// Final counters of a server run.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub messages: u64,
    pub connections: u64,
    pub log_bytes: u64,
    /// The message log that was written
    pub log_path: PathBuf,
    pub elapsed: Duration,
}

impl Report {
    /// Messages per second over the whole run.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.messages as f64 / secs
        } else {
            0.0
        }
    }
}

/// Cloneable handle for stopping a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<Shutdown>,
}

impl ServerHandle {
    pub fn request_shutdown(&self, reason: &str) -> bool {
        self.shutdown.request(reason)
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_requested()
    }
}

/// A bound, not yet running server.
pub struct Server {
    config: Config,
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: Arc<ServerContext>,
}

impl Server {
    /// Open the message log and bind the listener.
    ///
    /// Fails before any connection is accepted if either is unusable.
    pub fn bind(config: Config) -> io::Result<Self> {
        let sink = LogSink::open_for_append(&config.log_path)?;
        let listener = create_listener(&config.listen_addr())?;
        let local_addr = listener.local_addr()?;

        let ctx = ServerContext::new(
            sink,
            Shutdown::new(),
            config.max_log_bytes,
            config.max_message_bytes,
        );

        Ok(Server {
            config,
            listener,
            local_addr,
            ctx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.ctx.shutdown),
        }
    }

    /// Serve until shutdown, then drain workers and close the log.
    pub fn run(self) -> io::Result<Report> {
        let Server {
            config,
            listener,
            local_addr,
            ctx,
        } = self;

        info!(
            address = %local_addr,
            runtime = ?config.runtime,
            max_log_bytes = config.max_log_bytes,
            log_path = %config.log_path.display(),
            "Server listening"
        );

        let started = Instant::now();
        let result = match config.runtime {
            RuntimeType::Thread => thread::run(listener, Arc::clone(&ctx), &config),
            RuntimeType::Task => task::run(listener, Arc::clone(&ctx), &config),
        };
        if let Err(e) = &result {
            error!(error = %e, "Runtime failed");
            ctx.shutdown.request("runtime failed");
        }

        let log_bytes = match ctx.sink.close() {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "Failed to close message log");
                ctx.sink.current_size()
            }
        };
        result?;

        Ok(Report {
            messages: ctx.messages(),
            connections: ctx.connections(),
            log_bytes,
            log_path: ctx.sink.path().to_path_buf(),
            elapsed: started.elapsed(),
        })
    }
}

/// Create a blocking listener with `SO_REUSEADDR`.
fn create_listener(addr: &str) -> io::Result<TcpListener> {
    let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("no address for {addr}"))
    })?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// Address a local client can use to reach `listen_addr`.
fn loopback_for(listen_addr: SocketAddr) -> SocketAddr {
    match listen_addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listen_addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), listen_addr.port())
        }
        _ => listen_addr,
    }
}
