//! Task-per-connection runtime.
//!
//! A multi-threaded tokio runtime runs the accept loop and one task per
//! connection. Accept is raced against the shutdown broadcast; idle reads
//! are bounded by `read_timeout` so workers poll the flag the same way the
//! thread runtime does.
//!
//! Tasks still running when the drain grace elapses are not aborted. The
//! runtime is handed to a background thread that keeps driving them until
//! they finish, the way abandoned worker threads keep running in the thread
//! runtime. Only process exit stops them early.

use super::AcceptError;
use crate::config::Config;
use crate::connection::{ConnState, ServerContext};
use crate::frame::{self, FrameError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

pub(super) fn run(
    listener: std::net::TcpListener,
    ctx: Arc<ServerContext>,
    config: &Config,
) -> io::Result<()> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("framelog-task");
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    let stragglers = runtime.block_on(accept_loop(listener, ctx, config.clone()))?;
    if let Some(stragglers) = stragglers {
        keep_running(runtime, stragglers);
    }
    Ok(())
}

/// Move the runtime to its own thread so abandoned workers run to completion.
fn keep_running(runtime: tokio::runtime::Runtime, mut stragglers: JoinSet<()>) {
    let spawned = std::thread::Builder::new()
        .name("framelog-stragglers".into())
        .spawn(move || {
            runtime.block_on(async {
                while let Some(result) = stragglers.join_next().await {
                    log_join(result);
                }
            });
            debug!("Abandoned connection workers finished");
        });
    if let Err(e) = spawned {
        // The closure, runtime and tasks were dropped with the failed spawn.
        error!(error = %e, "Failed to keep abandoned workers running");
    }
}

async fn accept_loop(
    listener: std::net::TcpListener,
    ctx: Arc<ServerContext>,
    config: Config,
) -> io::Result<Option<JoinSet<()>>> {
    listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(listener)?;
    let mut workers = JoinSet::new();

    loop {
        match accept(&listener, &ctx).await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "New connection");
                ctx.connection_opened();
                workers.spawn(serve(
                    stream,
                    peer,
                    Arc::clone(&ctx),
                    config.read_timeout,
                    config.write_timeout,
                ));
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

        while let Some(result) = workers.try_join_next() {
            log_join(result);
        }
    }

    drop(listener);
    Ok(drain(workers, config.drain_grace).await)
}

async fn accept(
    listener: &TcpListener,
    ctx: &ServerContext,
) -> Result<(TcpStream, SocketAddr), AcceptError> {
    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.wait() => return Err(AcceptError::Stopped),
            accepted = listener.accept() => match accepted {
                Ok(conn) => return Ok(conn),
                Err(e) => match AcceptError::from_io(e, &ctx.shutdown) {
                    Some(err) => return Err(err),
                    None => continue,
                },
            },
        }
    }
}

/// Run one connection to completion. The socket closes when `stream` drops.
async fn serve(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
    read_timeout: Duration,
    write_timeout: Duration,
) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!(peer = %peer, error = %e, "Failed to configure connection");
        return;
    }

    let peer = peer.to_string();
    let max = ctx.max_message_bytes;
    let mut state = ConnState::Receiving;

    loop {
        state = match state {
            ConnState::Receiving => ConnState::after_receive(
                frame::read_frame_async(&mut stream, max, Some(read_timeout)).await,
                &ctx.shutdown,
                &peer,
            ),
            // The append is blocking file I/O under a std mutex.
            ConnState::Processing(message) => ConnState::Responding(tokio::task::block_in_place(
                || ctx.process(&peer, &message),
            )),
            ConnState::Responding(reply) => {
                let sent = match tokio::time::timeout(
                    write_timeout,
                    frame::write_frame_async(&mut stream, reply.as_str(), max),
                )
                .await
                {
                    Ok(sent) => sent,
                    Err(_) => Err(FrameError::Io(io::ErrorKind::TimedOut.into())),
                };
                ConnState::after_send(reply, sent, &peer)
            }
            ConnState::Done => break,
        };
    }

    debug!(peer = %peer, "Connection finished");
}

/// Wait up to `grace` for every worker. Returns the stragglers, if any.
async fn drain(mut workers: JoinSet<()>, grace: Duration) -> Option<JoinSet<()>> {
    info!(workers = workers.len(), "Draining connection workers");

    let joined = tokio::time::timeout(grace, async {
        while let Some(result) = workers.join_next().await {
            log_join(result);
        }
    })
    .await;

    match joined {
        Ok(()) => {
            info!("All connection workers finished");
            None
        }
        Err(_) => {
            warn!(
                abandoned = workers.len(),
                "Grace period elapsed with workers still running"
            );
            Some(workers)
        }
    }
}

fn log_join(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Connection worker panicked");
        }
    }
}
