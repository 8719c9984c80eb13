//! Rolling latency and request-rate figures reported to the dispatcher.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const LATENCY_WINDOW: usize = 10;
pub const RATE_WINDOW: Duration = Duration::from_secs(10);
const RATE_CAPACITY: usize = 5000;
pub const SLOW_QUERY_MS: f64 = 5000.0;

/// Last ten query latencies. Unfilled slots count as zero.
#[derive(Clone, Debug, Default)]
pub struct LatencyWindow {
    samples: [f64; LATENCY_WINDOW],
    index: usize,
}

impl LatencyWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, elapsed: Duration) {
        self.index = (self.index + 1) % LATENCY_WINDOW;
        self.samples[self.index] = elapsed.as_secs_f64() * 1000.0;
    }

    pub fn average_ms(&self) -> f64 {
        self.samples.iter().sum::<f64>() / LATENCY_WINDOW as f64
    }

    pub fn report(&self) -> LatencyReport {
        LatencyReport::classify(self.average_ms())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LatencyReport {
    Slow(f64),
    Normal(f64),
}

impl LatencyReport {
    pub fn classify(average_ms: f64) -> Self {
        if average_ms > SLOW_QUERY_MS {
            LatencyReport::Slow(average_ms)
        } else {
            LatencyReport::Normal(average_ms)
        }
    }
}

/// Timestamps of the most recent requests.
#[derive(Clone, Debug, Default)]
pub struct RequestRate {
    stamps: VecDeque<Instant>,
}

impl RequestRate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, at: Instant) {
        if self.stamps.len() == RATE_CAPACITY {
            self.stamps.pop_front();
        }
        self.stamps.push_back(at);
    }

    /// Requests per second over the ten seconds before `now`.
    pub fn per_second(&self, now: Instant) -> f64 {
        let recent = self
            .stamps
            .iter()
            .filter(|stamp| now.saturating_duration_since(**stamp) <= RATE_WINDOW)
            .count();
        recent as f64 / RATE_WINDOW.as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_divides_by_full_window() {
        let mut window = LatencyWindow::new();
        window.record(Duration::from_millis(100));
        window.record(Duration::from_millis(300));
        assert!((window.average_ms() - 40.0).abs() < 1e-9);
        assert_eq!(window.report(), LatencyReport::Normal(window.average_ms()));
    }

    #[test]
    fn eleventh_sample_overwrites_the_oldest() {
        let mut window = LatencyWindow::new();
        window.record(Duration::from_millis(60_000));
        for _ in 0..10 {
            window.record(Duration::from_millis(10));
        }
        assert!((window.average_ms() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn slow_threshold_is_exclusive() {
        assert_eq!(LatencyReport::classify(5000.0), LatencyReport::Normal(5000.0));
        assert_eq!(LatencyReport::classify(5000.5), LatencyReport::Slow(5000.5));
    }

    #[test]
    fn rate_counts_only_the_last_ten_seconds() {
        let start = Instant::now();
        let mut rate = RequestRate::new();
        rate.record(start);
        for i in 0..20 {
            rate.record(start + Duration::from_secs(15) + Duration::from_millis(i));
        }
        let now = start + Duration::from_secs(20);
        assert!((rate.per_second(now) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn rate_keeps_a_bounded_history() {
        let now = Instant::now();
        let mut rate = RequestRate::new();
        for _ in 0..(RATE_CAPACITY + 100) {
            rate.record(now);
        }
        assert!((rate.per_second(now) - 500.0).abs() < 1e-9);
    }
}
