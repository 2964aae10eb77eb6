//! Task-per-connection load workers.

use super::{build_payload, LoadContext};
use crate::frame::{self, REPLY_STOP};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, error};

pub(super) fn run(ctx: Arc<LoadContext>) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("framelog-load")
        .build()?;

    runtime.block_on(async move {
        let mut workers = JoinSet::new();
        for worker in 0..ctx.config.workers {
            workers.spawn(drive(worker, Arc::clone(&ctx)));
        }
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Load worker failed");
            }
        }
    });
    Ok(())
}

async fn drive(worker: usize, ctx: Arc<LoadContext>) {
    let config = &ctx.config;
    let mut stream = match connect(&config.server_addr(), config.reply_timeout).await {
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

        let sent = tokio::time::timeout(
            config.reply_timeout,
            frame::write_frame_async(&mut stream, &payload, config.max_message_bytes),
        )
        .await;
        if !matches!(sent, Ok(Ok(()))) {
            debug!(worker, "Send failed");
            return;
        }
        let reply = match frame::read_frame_async(
            &mut stream,
            config.max_message_bytes,
            Some(config.reply_timeout),
        )
        .await
        {
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
            tokio::select! {
                _ = tokio::time::sleep(config.delay) => {}
                _ = ctx.stop.wait() => return,
            }
        }
    }
}

async fn connect(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(stream) => stream?,
        Err(_) => return Err(io::ErrorKind::TimedOut.into()),
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}
