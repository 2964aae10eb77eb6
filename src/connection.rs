//! Connection state machine shared by both runtimes.
//!
//! Each connection cycles `Receiving -> Processing -> Responding` until the
//! peer leaves, a protocol error occurs, or the server answers `STOP`. The
//! runtimes own the sockets and perform the I/O; the transitions and the
//! per-message work live here so thread and task workers behave identically.

use crate::frame::{FrameError, REPLY_OK, REPLY_STOP};
use crate::shutdown::Shutdown;
use crate::sink::LogSink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Current state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the next frame.
    Receiving,
    /// A frame arrived and must be logged.
    Processing(String),
    /// The reply to send.
    Responding(Reply),
    /// The connection is finished and will be closed.
    Done,
}

impl ConnState {
    /// Transition out of `Receiving` given the outcome of a frame read.
    ///
    /// An idle timeout keeps the connection waiting unless shutdown has been
    /// requested in the meantime, in which case the peer is told `STOP`
    /// before the connection closes.
    pub fn after_receive(
        result: Result<String, FrameError>,
        shutdown: &Shutdown,
        peer: &str,
    ) -> ConnState {
        match result {
            Ok(message) => ConnState::Processing(message),
            Err(FrameError::Timeout) => {
                if shutdown.is_requested() {
                    debug!(peer, "Stopping idle connection for shutdown");
                    ConnState::Responding(Reply::Stop)
                } else {
                    ConnState::Receiving
                }
            }
            Err(FrameError::ConnectionClosed) => {
                trace!(peer, "Connection closed by client");
                ConnState::Done
            }
            Err(e) if e.is_protocol() => {
                warn!(peer, error = %e, "Protocol error");
                ConnState::Done
            }
            Err(e) => {
                debug!(peer, error = %e, "Receive failed");
                ConnState::Done
            }
        }
    }

    /// Transition out of `Responding` given the outcome of the reply write.
    pub fn after_send(reply: Reply, result: Result<(), FrameError>, peer: &str) -> ConnState {
        if let Err(e) = result {
            debug!(peer, error = %e, "Send failed");
            return ConnState::Done;
        }
        match reply {
            Reply::Ok => ConnState::Receiving,
            Reply::Stop => {
                debug!(peer, "Sent STOP");
                ConnState::Done
            }
        }
    }
}

/// Reply to a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Stop,
}

impl Reply {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::Ok => REPLY_OK,
            Reply::Stop => REPLY_STOP,
        }
    }
}

/// State shared by the dispatcher and every connection worker.
pub struct ServerContext {
    pub sink: LogSink,
    pub shutdown: Arc<Shutdown>,
    /// Log size at which shutdown is requested
    pub max_log_bytes: u64,
    pub max_message_bytes: usize,
    messages: AtomicU64,
    connections: AtomicU64,
}

impl ServerContext {
    pub fn new(
        sink: LogSink,
        shutdown: Arc<Shutdown>,
        max_log_bytes: u64,
        max_message_bytes: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            shutdown,
            max_log_bytes,
            max_message_bytes,
            messages: AtomicU64::new(0),
            connections: AtomicU64::new(0),
        })
    }

    /// Log one received message and decide the reply.
    ///
    /// A failed append requests shutdown but the message is still answered.
    /// The size check reads the cached size, so a few concurrent messages may
    /// land past the limit before every worker sees the flag.
    pub fn process(&self, peer: &str, message: &str) -> Reply {
        if let Err(e) = self.sink.append(peer, message) {
            error!(peer, error = %e, "Failed to append to message log");
            self.shutdown.request("message log write failed");
        }

        self.messages.fetch_add(1, Ordering::Relaxed);

        if self.sink.current_size() >= self.max_log_bytes {
            self.shutdown.request("message log reached size limit");
        }

        if self.shutdown.is_requested() {
            Reply::Stop
        } else {
            Reply::Ok
        }
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}
