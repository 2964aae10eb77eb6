//! Round-trip timing accumulator.

use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct Samples {
    count: u64,
    sum: Duration,
    min: Option<Duration>,
    max: Duration,
}

/// Running count/sum/min/max of elapsed durations, shared by all workers.
#[derive(Debug, Default)]
pub struct TimingStats {
    samples: Mutex<Samples>,
}

/// Snapshot of [`TimingStats`] in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TimingSummary {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl TimingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sample(&self, elapsed: Duration) {
        let mut samples = self
            .samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        samples.count += 1;
        samples.sum += elapsed;
        samples.min = Some(samples.min.map_or(elapsed, |min| min.min(elapsed)));
        samples.max = samples.max.max(elapsed);
    }

    /// Summarize; an empty set yields all zeros.
    ///
    /// Times are always reported in milliseconds, so no unit is taken.
    pub fn summarize(&self) -> TimingSummary {
        let samples = self
            .samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if samples.count == 0 {
            return TimingSummary::default();
        }
        TimingSummary {
            count: samples.count,
            avg_ms: as_ms(samples.sum) / samples.count as f64,
            min_ms: samples.min.map_or(0.0, as_ms),
            max_ms: as_ms(samples.max),
        }
    }
}

fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_summary() {
        assert_eq!(TimingStats::new().summarize(), TimingSummary::default());
    }

    #[test]
    fn test_min_max_avg() {
        let stats = TimingStats::new();
        stats.add_sample(Duration::from_millis(4));
        stats.add_sample(Duration::from_millis(2));
        stats.add_sample(Duration::from_millis(6));

        let summary = stats.summarize();
        assert_eq!(summary.count, 3);
        assert!((summary.avg_ms - 4.0).abs() < 1e-9);
        assert!((summary.min_ms - 2.0).abs() < 1e-9);
        assert!((summary.max_ms - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_samples_are_all_counted() {
        let stats = Arc::new(TimingStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for i in 1..=250 {
                        stats.add_sample(Duration::from_micros(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let summary = stats.summarize();
        assert_eq!(summary.count, 1000);
        assert!((summary.min_ms - 0.001).abs() < 1e-9);
        assert!((summary.max_ms - 0.25).abs() < 1e-9);
    }
}
