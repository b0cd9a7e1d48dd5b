//! Gateway Metrics
//!
//! Lock-free counters describing session and request traffic of one shard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Atomic counter for thread-safe incrementing
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Atomic gauge for values that go up and down
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement, saturating at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket latency histogram
#[derive(Debug)]
pub struct Histogram {
    /// Bucket upper bounds in microseconds
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    overflow: AtomicU64,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s
    pub fn new_latency() -> Self {
        let buckets = vec![
            1000, 5000, 10000, 25000, 50000, 100000, 250000, 500000, 1000000, 5000000,
        ];
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            buckets,
            counts,
            overflow: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let micros = duration.as_micros() as u64;
        self.sum.fetch_add(micros, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        match self.buckets.iter().position(|&bound| micros <= bound) {
            Some(i) => {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean_ms(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
    }

    /// Non-cumulative per-bucket counts
    pub fn bucket_counts(&self) -> Vec<u64> {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new_latency()
    }
}

/// All gateway metrics
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub connections_accepted: Counter,
    pub connections_closed: Counter,
    pub active_connections: Gauge,

    pub requests_total: Counter,
    pub requests_failed: Counter,
    pub responses_undelivered: Counter,
    pub dispatch_latency: Histogram,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.get(),
            connections_closed: self.connections_closed.get(),
            active_connections: self.active_connections.get(),
            requests_total: self.requests_total.get(),
            requests_failed: self.requests_failed.get(),
            responses_undelivered: self.responses_undelivered.get(),
            dispatch_latency_ms: self.dispatch_latency.mean_ms(),
        }
    }
}

/// Point-in-time snapshot of the gateway metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub active_connections: u64,
    pub requests_total: u64,
    pub requests_failed: u64,
    pub responses_undelivered: u64,
    pub dispatch_latency_ms: f64,
}

/// Helper for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record to histogram and return elapsed
    pub fn record(self, histogram: &Histogram) -> Duration {
        let elapsed = self.elapsed();
        histogram.observe(elapsed);
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_saturates() {
        let gauge = Gauge::new();
        gauge.inc();
        gauge.dec();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_histogram_buckets() {
        let hist = Histogram::new_latency();
        hist.observe(Duration::from_micros(500));
        hist.observe(Duration::from_millis(30));
        hist.observe(Duration::from_secs(10));

        assert_eq!(hist.count(), 3);
        let counts = hist.bucket_counts();
        assert_eq!(counts[0], 1);
        assert_eq!(counts[4], 1);
        assert_eq!(hist.overflow_count(), 1);
    }

    #[test]
    fn test_timer() {
        let hist = Histogram::new_latency();
        let timer = Timer::start();
        std::thread::sleep(Duration::from_millis(5));
        let elapsed = timer.record(&hist);
        assert!(elapsed >= Duration::from_millis(5));
        assert_eq!(hist.count(), 1);
        assert!(hist.mean_ms() >= 5.0);
    }

    #[test]
    fn test_snapshot() {
        let metrics = GatewayMetrics::new();
        metrics.connections_accepted.add(3);
        metrics.active_connections.inc();
        metrics.requests_total.add(10);
        metrics.requests_failed.inc();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_accepted, 3);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.requests_total, 10);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.dispatch_latency_ms, 0.0);
    }
}
