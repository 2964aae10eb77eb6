//! Thread-per-connection runtime.
//!
//! Blocking sockets with short read timeouts: a worker idle in `read` wakes
//! every `read_timeout` to check for shutdown. The accept loop is unblocked
//! on shutdown by a loopback connection, after which it sees the flag.

use super::{loopback_for, AcceptError, DRAIN_POLL};
use crate::config::Config;
use crate::connection::{ConnState, ServerContext};
use crate::frame;
use crate::shutdown::Shutdown;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Bound on the connect that wakes a blocked `accept`.
const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

pub(super) fn run(listener: TcpListener, ctx: Arc<ServerContext>, config: &Config) -> io::Result<()> {
    let wake_addr = loopback_for(listener.local_addr()?);
    ctx.shutdown.on_stop(move || {
        if let Err(e) = TcpStream::connect_timeout(&wake_addr, WAKE_TIMEOUT) {
            debug!(error = %e, "Listener wake-up connect failed");
        }
    });

    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    loop {
        match accept(&listener, &ctx.shutdown) {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "New connection");
                ctx.connection_opened();

                let worker_ctx = Arc::clone(&ctx);
                let read_timeout = config.read_timeout;
                let write_timeout = config.write_timeout;
                let spawned = thread::Builder::new()
                    .name(format!("conn-{peer}"))
                    .spawn(move || serve(stream, peer, worker_ctx, read_timeout, write_timeout));

                match spawned {
                    Ok(handle) => workers.push(handle),
                    Err(e) => error!(peer = %peer, error = %e, "Failed to spawn connection thread"),
                }
            }
            Err(AcceptError::Stopped) => {
                info!("Listener stopped");
                break;
            }
            Err(e) => {
                error!(error = %e, "Accept loop failed");
                ctx.shutdown.request("accept failed");
                break;
            }
        }

        reap(&mut workers);
    }

    drop(listener);
    drain(workers, config.drain_grace);
    Ok(())
}

/// Accept the next connection, or report why accepting is over.
fn accept(listener: &TcpListener, shutdown: &Shutdown) -> Result<(TcpStream, SocketAddr), AcceptError> {
    loop {
        match listener.accept() {
            // Also catches the wake-up connection.
            Ok(_) if shutdown.is_requested() => return Err(AcceptError::Stopped),
            Ok(conn) => return Ok(conn),
            Err(e) => match AcceptError::from_io(e, shutdown) {
                Some(err) => return Err(err),
                None => continue,
            },
        }
    }
}

/// Run one connection to completion. The socket closes when `stream` drops.
fn serve(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    read_timeout: Duration,
    write_timeout: Duration,
) {
    if let Err(e) = configure(&stream, read_timeout, write_timeout) {
        warn!(peer = %peer, error = %e, "Failed to configure connection");
        return;
    }

    let peer = peer.to_string();
    let max = ctx.max_message_bytes;
    let mut state = ConnState::Receiving;

    loop {
        state = match state {
            ConnState::Receiving => ConnState::after_receive(
                frame::read_frame(&mut stream, max),
                &ctx.shutdown,
                &peer,
            ),
            ConnState::Processing(message) => ConnState::Responding(ctx.process(&peer, &message)),
            ConnState::Responding(reply) => ConnState::after_send(
                reply,
                frame::write_frame(&mut stream, reply.as_str(), max),
                &peer,
            ),
            ConnState::Done => break,
        };
    }

    debug!(peer = %peer, "Connection finished");
}

fn configure(stream: &TcpStream, read_timeout: Duration, write_timeout: Duration) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(read_timeout))?;
    stream.set_write_timeout(Some(write_timeout))?;
    Ok(())
}

/// Join workers that already finished so the set only holds live ones.
fn reap(workers: &mut Vec<JoinHandle<()>>) {
    let mut i = 0;
    while i < workers.len() {
        if workers[i].is_finished() {
            join_logged(workers.swap_remove(i));
        } else {
            i += 1;
        }
    }
}

/// Wait up to `grace` for every worker; stragglers are left running.
fn drain(mut workers: Vec<JoinHandle<()>>, grace: Duration) {
    let deadline = Instant::now() + grace;
    info!(workers = workers.len(), "Draining connection workers");

    loop {
        reap(&mut workers);
        if workers.is_empty() {
            info!("All connection workers finished");
            return;
        }
        if Instant::now() >= deadline {
            warn!(
                abandoned = workers.len(),
                "Grace period elapsed with workers still running"
            );
            return;
        }
        thread::sleep(DRAIN_POLL);
    }
}

fn join_logged(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("conn").to_string();
    if handle.join().is_err() {
        error!(worker = %name, "Connection worker panicked");
    }
}
