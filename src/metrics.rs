//! Metrics collection using HdrHistogram for accurate percentile calculations.

use hdrhistogram::Histogram;
use std::time::{Duration, Instant};

/// Burst latencies are recorded in microseconds, up to 10 minutes
const HISTOGRAM_MAX_US: u64 = 600_000_000;

/// Metrics for one benchmark run.
///
/// Owned by the driver and only touched from the event loop, so no interior
/// mutability is needed.
pub struct MetricsCollector {
    /// Histogram of per-burst latency (microseconds)
    burst_histogram: Histogram<u64>,
    /// Completed bursts
    bursts: u64,
    /// Sum of completed burst durations
    total_burst_time: Duration,
    /// Deliveries counted towards a burst
    deliveries: u64,
    /// Deliveries seen before the run was ready
    stray_deliveries: u64,
    /// Deliveries the server said would never arrive
    lost_deliveries: u64,
    /// Successful PUBLISH replies
    publish_acks: u64,
    /// Failed PUBLISH commands
    publish_errors: u64,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            // 3 significant figures
            burst_histogram: Histogram::new_with_bounds(1, HISTOGRAM_MAX_US, 3)
                .expect("static histogram bounds are valid"),
            bursts: 0,
            total_burst_time: Duration::ZERO,
            deliveries: 0,
            stray_deliveries: 0,
            lost_deliveries: 0,
            publish_acks: 0,
            publish_errors: 0,
            start_time: None,
            end_time: None,
        }
    }

    /// Mark the start of the measured phase
    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// Mark the end of the measured phase
    pub fn stop(&mut self) {
        if self.start_time.is_some() && self.end_time.is_none() {
            self.end_time = Some(Instant::now());
        }
    }

    /// Record a completed burst
    pub fn record_burst(&mut self, latency: Duration) {
        let latency_us = (latency.as_micros() as u64).clamp(1, HISTOGRAM_MAX_US);
        let _ = self.burst_histogram.record(latency_us);
        self.bursts += 1;
        self.total_burst_time += latency;
    }

    pub fn record_delivery(&mut self) {
        self.deliveries += 1;
    }

    pub fn record_stray_delivery(&mut self) {
        self.stray_deliveries += 1;
    }

    pub fn record_lost(&mut self, count: u64) {
        self.lost_deliveries += count;
    }

    pub fn record_publish_ack(&mut self) {
        self.publish_acks += 1;
    }

    pub fn record_publish_error(&mut self) {
        self.publish_errors += 1;
    }

    pub fn bursts(&self) -> u64 {
        self.bursts
    }

    pub fn deliveries(&self) -> u64 {
        self.deliveries
    }

    pub fn lost_deliveries(&self) -> u64 {
        self.lost_deliveries
    }

    pub fn publish_errors(&self) -> u64 {
        self.publish_errors
    }

    /// Running mean of burst latency in milliseconds
    pub fn mean_burst_ms(&self) -> f64 {
        if self.bursts == 0 {
            return 0.0;
        }
        self.total_burst_time.as_secs_f64() * 1000.0 / self.bursts as f64
    }

    /// Burst latency percentile in milliseconds
    pub fn burst_percentile(&self, percentile: f64) -> f64 {
        self.burst_histogram.value_at_percentile(percentile) as f64 / 1000.0
    }

    /// Get the elapsed duration of the measured phase
    pub fn elapsed(&self) -> Duration {
        match (self.start_time, self.end_time) {
            (Some(s), Some(e)) => e.duration_since(s),
            (Some(s), None) => s.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Delivery throughput
    pub fn deliveries_per_second(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.deliveries as f64 / elapsed
    }

    /// Create a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let has_bursts = self.bursts > 0;
        MetricsSnapshot {
            bursts: self.bursts,
            deliveries: self.deliveries,
            stray_deliveries: self.stray_deliveries,
            lost_deliveries: self.lost_deliveries,
            publish_acks: self.publish_acks,
            publish_errors: self.publish_errors,
            latency_mean: self.mean_burst_ms(),
            latency_min: if has_bursts {
                self.burst_histogram.min() as f64 / 1000.0
            } else {
                0.0
            },
            latency_p50: self.burst_percentile(50.0),
            latency_p95: self.burst_percentile(95.0),
            latency_p99: self.burst_percentile(99.0),
            latency_max: self.burst_histogram.max() as f64 / 1000.0,
            deliveries_per_second: self.deliveries_per_second(),
            elapsed_secs: self.elapsed().as_secs_f64(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of metrics at a point in time (latencies in milliseconds)
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub bursts: u64,
    pub deliveries: u64,
    pub stray_deliveries: u64,
    pub lost_deliveries: u64,
    pub publish_acks: u64,
    pub publish_errors: u64,
    pub latency_mean: f64,
    pub latency_min: f64,
    pub latency_p50: f64,
    pub latency_p95: f64,
    pub latency_p99: f64,
    pub latency_max: f64,
    pub deliveries_per_second: f64,
    pub elapsed_secs: f64,
}
