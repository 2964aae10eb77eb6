//! framelog server binary.
//!
//! Logs every received message until the log reaches its size limit, then
//! tells clients to stop, drains connections and prints a summary.

use framelog::config::Config;
use framelog::runtime::{Server, ServerHandle};
use std::thread;
use tracing::{info, warn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    framelog::init_tracing(&config.log_level);

    info!(
        host = %config.host,
        port = config.port,
        runtime = ?config.runtime,
        max_log_bytes = config.max_log_bytes,
        log_path = %config.log_path.display(),
        "Starting framelog server"
    );

    let server = Server::bind(config)?;
    watch_ctrl_c(server.handle());

    let report = server.run()?;

    info!(
        messages = report.messages,
        connections = report.connections,
        log_bytes = report.log_bytes,
        log_path = %report.log_path.display(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Server stopped"
    );
    println!("Messages received: {}", report.messages);
    println!("Connections:       {}", report.connections);
    println!("Message log:       {}", report.log_path.display());
    println!("Final log size:    {} bytes", report.log_bytes);
    println!("Elapsed:           {:.3} s", report.elapsed.as_secs_f64());
    println!("Throughput:        {:.1} msg/s", report.throughput());
    Ok(())
}

/// Request shutdown on Ctrl-C so an interrupted run still drains and reports.
fn watch_ctrl_c(handle: ServerHandle) {
    let spawned = thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(error = %e, "Ctrl-C handler unavailable");
                    return;
                }
            };
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                handle.request_shutdown("interrupted");
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Ctrl-C handler unavailable");
    }
}
