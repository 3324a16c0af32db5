//! Request latency statistics.

use std::time::Duration;

use serde::Serialize;

/// Latencies of completed requests.
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    samples: Vec<Duration>,
}

/// Summary of recorded latencies, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencySummary {
    pub count: usize,
    pub mean_us: f64,
    pub std_dev_us: f64,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, latency: Duration) {
        self.samples.push(latency);
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[Duration] {
        &self.samples
    }

    /// Mean latency (zero when empty).
    pub fn mean(&self) -> Duration {
        Duration::from_secs_f64(self.mean_secs())
    }

    /// Population standard deviation (zero when empty).
    pub fn std_dev(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mean = self.mean_secs();
        let variance = self
            .samples
            .iter()
            .map(|s| {
                let d = s.as_secs_f64() - mean;
                d * d
            })
            .sum::<f64>()
            / self.samples.len() as f64;
        Duration::from_secs_f64(variance.sqrt())
    }

    pub fn summary(&self) -> LatencySummary {
        LatencySummary {
            count: self.count(),
            mean_us: self.mean().as_secs_f64() * 1e6,
            std_dev_us: self.std_dev().as_secs_f64() * 1e6,
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    fn mean_secs(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(Duration::as_secs_f64).sum::<f64>() / self.samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        let stats = LatencyStats::new();
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.mean(), Duration::ZERO);
        assert_eq!(stats.std_dev(), Duration::ZERO);
    }

    #[test]
    fn test_mean_and_std_dev() {
        let mut stats = LatencyStats::new();
        for ms in [2, 4, 4, 4, 5, 5, 7, 9] {
            stats.record(Duration::from_millis(ms));
        }
        let summary = stats.summary();
        assert_eq!(summary.count, 8);
        assert!((summary.mean_us - 5000.0).abs() < 1e-3);
        assert!((summary.std_dev_us - 2000.0).abs() < 1e-3);

        stats.clear();
        assert_eq!(stats.count(), 0);
    }
}
