//! Message bodies for the load generator.

use chrono::Utc;

/// Filler byte appended after the header.
const FILLER: char = 'x';

/// Build a message of `target` bytes: a header naming the worker, sequence
/// number and send time, padded with filler.
///
/// The header is always sent whole, so a target smaller than the header
/// yields just the header.
pub fn build_payload(worker: usize, seq: u64, target: usize) -> String {
    let mut payload = format!(
        "worker={worker} seq={seq} ts={} |",
        Utc::now().timestamp_millis()
    );
    if payload.len() < target {
        let filler = target - payload.len();
        payload.reserve(filler);
        payload.extend(std::iter::repeat(FILLER).take(filler));
    }
    payload
}
