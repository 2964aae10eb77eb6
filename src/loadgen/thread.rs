//! Thread-per-connection load workers.

use super::{build_payload, LoadContext};
use crate::frame::{self, REPLY_STOP};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Longest single sleep while waiting out the inter-message delay.
const DELAY_SLICE: Duration = Duration::from_millis(50);

pub(super) fn run(ctx: Arc<LoadContext>) -> io::Result<()> {
    let mut handles = Vec::with_capacity(ctx.config.workers);

    for worker in 0..ctx.config.workers {
        let ctx = Arc::clone(&ctx);
        let handle = thread::Builder::new()
            .name(format!("load-{worker}"))
            .spawn(move || drive(worker, &ctx))?;
        handles.push(handle);
    }

    for handle in handles {
        if handle.join().is_err() {
            error!("Load worker panicked");
        }
    }
    Ok(())
}

fn drive(worker: usize, ctx: &LoadContext) {
    let config = &ctx.config;
    let mut stream = match connect(&config.server_addr(), config.reply_timeout) {
        Ok(stream) => stream,
        Err(e) => {
            debug!(worker, error = %e, "Connect failed");
            return;
        }
    };

    let mut seq = 0u64;
    while !ctx.stop.is_requested() {
        let payload = build_payload(worker, seq, config.payload_bytes);
        let started = Instant::now();

        if let Err(e) = frame::write_frame(&mut stream, &payload, config.max_message_bytes) {
            debug!(worker, error = %e, "Send failed");
            return;
        }
        let reply = match frame::read_frame(&mut stream, config.max_message_bytes) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(worker, error = %e, "Receive failed");
                return;
            }
        };

        ctx.record(started.elapsed());
        seq += 1;

        if reply == REPLY_STOP {
            ctx.server_stopped(worker);
            return;
        }
        if !config.delay.is_zero() {
            pause(ctx, config.delay);
        }
    }
}

/// Connect with `timeout` bounding both the connect and every later I/O call.
fn connect(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for resolved in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&resolved, timeout) {
            Ok(stream) => return configure(stream, timeout),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("no address for {addr}"))
    }))
}

fn configure(stream: TcpStream, timeout: Duration) -> io::Result<TcpStream> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(stream)
}

/// Sleep for `delay`, returning early if the run is stopped.
fn pause(ctx: &LoadContext, delay: Duration) {
    let deadline = Instant::now() + delay;
    loop {
        let now = Instant::now();
        if now >= deadline || ctx.stop.is_requested() {
            return;
        }
        thread::sleep((deadline - now).min(DELAY_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_connect_applies_timeouts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let timeout = Duration::from_millis(750);

        let stream = connect(&addr, timeout).unwrap();
        assert_eq!(stream.read_timeout().unwrap(), Some(timeout));
        assert_eq!(stream.write_timeout().unwrap(), Some(timeout));
        assert!(stream.nodelay().unwrap());
    }

    #[test]
    fn test_connect_rejects_malformed_address() {
        assert!(connect("no-port-here", Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_connect_refused() {
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .to_string();
        // The listener is gone, so nothing accepts on that port.
        assert!(connect(&addr, Duration::from_millis(500)).is_err());
    }
}
