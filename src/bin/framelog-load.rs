//! framelog load generator binary.

use framelog::config::LoadConfig;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = LoadConfig::load()?;
    framelog::init_tracing(&config.log_level);

    let report = framelog::loadgen::run(config)?;

    info!(
        sent = report.sent,
        stopped_by_server = report.stopped_by_server,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Load generator finished"
    );
    println!("Messages sent:  {}", report.sent);
    println!("Elapsed:        {:.3} s", report.elapsed.as_secs_f64());
    println!("Throughput:     {:.1} msg/s", report.throughput());
    println!(
        "Round trip ms:  avg {:.3}  min {:.3}  max {:.3}",
        report.timing.avg_ms, report.timing.min_ms, report.timing.max_ms
    );
    if !report.stopped_by_server {
        println!("Note: all connections ended without a STOP from the server");
    }
    Ok(())
}
