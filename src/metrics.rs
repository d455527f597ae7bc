use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window of latency measurements
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    measurements: Arc<Mutex<VecDeque<u64>>>,
    window_size: usize,
}

impl PercentileTracker {
    pub fn new(window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            measurements: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
        }
    }

    /// Record a measurement (in nanoseconds)
    pub fn record(&self, nanos: u64) {
        let mut measurements = self.measurements.lock();
        if measurements.len() >= self.window_size {
            measurements.pop_front();
        }
        measurements.push_back(nanos);
    }

    /// The `p` quantile (0.0-1.0) in microseconds, 0 when empty
    pub fn percentile_us(&self, p: f64) -> f64 {
        let measurements = self.measurements.lock();
        let mut sorted: Vec<_> = measurements.iter().copied().collect();
        drop(measurements);
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * p).ceil() as usize)
            .saturating_sub(1)
            .min(sorted.len() - 1);
        sorted[idx] as f64 / 1000.0
    }

    pub fn count(&self) -> usize {
        self.measurements.lock().len()
    }
}

/// Counters for one run of the ingestion bridge.
///
/// Clones share the same counters, so the producer and consumer threads each
/// hold one.
#[derive(Debug, Clone)]
pub struct FeedMetrics {
    lines_received: Arc<AtomicU64>,
    items_delivered: Arc<AtomicU64>,
    items_skipped: Arc<AtomicU64>,
    reconnects: Arc<AtomicU64>,
    queue_blocks: Arc<AtomicU64>,
    /// Time the consumer spends pushing one item through the chain
    push_latency: PercentileTracker,
    start_time: Instant,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self {
            lines_received: Arc::new(AtomicU64::new(0)),
            items_delivered: Arc::new(AtomicU64::new(0)),
            items_skipped: Arc::new(AtomicU64::new(0)),
            reconnects: Arc::new(AtomicU64::new(0)),
            queue_blocks: Arc::new(AtomicU64::new(0)),
            push_latency: PercentileTracker::new(1000),
            start_time: Instant::now(),
        }
    }

    pub fn record_received(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, latency: Duration) {
        self.items_delivered.fetch_add(1, Ordering::Relaxed);
        self.push_latency
            .record(u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX));
    }

    pub fn record_skipped(&self) {
        self.items_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_blocks(&self, blocks: u64) {
        self.queue_blocks.store(blocks, Ordering::Relaxed);
    }

    pub fn lines_received(&self) -> u64 {
        self.lines_received.load(Ordering::Relaxed)
    }

    pub fn items_delivered(&self) -> u64 {
        self.items_delivered.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let elapsed = self.start_time.elapsed();
        let delivered = self.items_delivered();
        MetricsSnapshot {
            lines_received: self.lines_received(),
            items_delivered: delivered,
            items_skipped: self.items_skipped.load(Ordering::Relaxed),
            reconnects: self.reconnects(),
            queue_blocks: self.queue_blocks.load(Ordering::Relaxed),
            throughput_ips: if elapsed.is_zero() {
                0.0
            } else {
                delivered as f64 / elapsed.as_secs_f64()
            },
            latency_p50_us: self.push_latency.percentile_us(0.50),
            latency_p99_us: self.push_latency.percentile_us(0.99),
            elapsed,
        }
    }
}

impl Default for FeedMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`FeedMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub lines_received: u64,
    pub items_delivered: u64,
    pub items_skipped: u64,
    pub reconnects: u64,
    pub queue_blocks: u64,
    pub throughput_ips: f64,
    pub latency_p50_us: f64,
    pub latency_p99_us: f64,
    pub elapsed: Duration,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Received: {}, Delivered: {}, Skipped: {}, Reconnects: {}, Queue blocks: {}, \
             Throughput: {:.2} items/s, Push latency P50: {:.2}µs, P99: {:.2}µs, Elapsed: {:.2}s",
            self.lines_received,
            self.items_delivered,
            self.items_skipped,
            self.reconnects,
            self.queue_blocks,
            self.throughput_ips,
            self.latency_p50_us,
            self.latency_p99_us,
            self.elapsed.as_secs_f64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_tracker() {
        let tracker = PercentileTracker::new(10);
        assert_eq!(tracker.percentile_us(0.5), 0.0);
        for i in 1..=10 {
            tracker.record(i * 1000);
        }
        assert_eq!(tracker.percentile_us(0.5), 5.0);
        assert_eq!(tracker.percentile_us(0.99), 10.0);

        tracker.record(20_000);
        assert_eq!(tracker.count(), 10);
    }

    #[test]
    fn test_feed_metrics_snapshot() {
        let metrics = FeedMetrics::new();
        let consumer = metrics.clone();
        for _ in 0..3 {
            metrics.record_received();
        }
        consumer.record_delivered(Duration::from_micros(2));
        consumer.record_delivered(Duration::from_micros(4));
        consumer.record_skipped();
        metrics.record_reconnect();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.lines_received, 3);
        assert_eq!(snapshot.items_delivered, 2);
        assert_eq!(snapshot.items_skipped, 1);
        assert_eq!(snapshot.reconnects, 1);
        assert_eq!(snapshot.latency_p99_us, 4.0);
        assert!(snapshot.to_string().starts_with("Received: 3, Delivered: 2"));
    }
}
