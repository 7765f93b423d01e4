//! Report generation for benchmark results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BenchConfig;
use crate::driver::Phase;
use crate::metrics::MetricsSnapshot;

/// Complete benchmark report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    /// Unique id of this run
    pub run_id: String,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Machine the benchmark ran on
    pub hostname: String,
    /// Server address ("host:port")
    pub server: String,
    pub channel: String,
    pub subscribers: usize,
    pub publishers: usize,
    pub deliveries_per_burst: u64,
    /// Phase the run had reached when it ended
    pub phase: Phase,
    /// Why the run ended early, if it did
    pub error: Option<String>,
    /// Burst latency statistics
    pub latency: LatencyStats,
    pub deliveries: u64,
    pub lost_deliveries: u64,
    pub stray_deliveries: u64,
    pub publish_acks: u64,
    pub publish_errors: u64,
    pub deliveries_per_second: f64,
    pub elapsed_secs: f64,
}

/// Burst latency statistics in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyStats {
    pub bursts: u64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl BenchmarkReport {
    /// Create a report from a finished run
    pub fn new(
        config: &BenchConfig,
        started_at: DateTime<Utc>,
        phase: Phase,
        snapshot: &MetricsSnapshot,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            started_at,
            hostname: local_hostname(),
            server: config.addr(),
            channel: config.channel.clone(),
            subscribers: config.subscribers,
            publishers: config.publishers,
            deliveries_per_burst: config.expected_deliveries(),
            phase,
            error: None,
            latency: LatencyStats {
                bursts: snapshot.bursts,
                mean_ms: snapshot.latency_mean,
                min_ms: snapshot.latency_min,
                p50_ms: snapshot.latency_p50,
                p95_ms: snapshot.latency_p95,
                p99_ms: snapshot.latency_p99,
                max_ms: snapshot.latency_max,
            },
            deliveries: snapshot.deliveries,
            lost_deliveries: snapshot.lost_deliveries,
            stray_deliveries: snapshot.stray_deliveries,
            publish_acks: snapshot.publish_acks,
            publish_errors: snapshot.publish_errors,
            deliveries_per_second: snapshot.deliveries_per_second,
            elapsed_secs: snapshot.elapsed_secs,
        }
    }

    /// Record the error that ended the run
    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    /// Percentage of expected deliveries that actually arrived
    pub fn delivery_rate(&self) -> f64 {
        let expected = self.deliveries + self.lost_deliveries;
        if expected == 0 {
            return 100.0;
        }
        (self.deliveries as f64 / expected as f64) * 100.0
    }

    /// Print the report as an ASCII table
    pub fn print_table(&self) {
        println!();
        println!("╔══════════════════════════════════════════════════════════════════════════╗");
        println!("║                     PUB/SUB FAN-OUT LATENCY RESULTS                      ║");
        println!("╚══════════════════════════════════════════════════════════════════════════╝");
        println!();
        println!("  Server:       {} (channel '{}')", self.server, self.channel);
        println!(
            "  Workload:     {} subscribers × {} publishers = {} deliveries/burst",
            self.subscribers, self.publishers, self.deliveries_per_burst
        );
        println!("  Phase:        {}", self.phase);
        println!();
        println!("┌──────────┬──────────┬──────────┬──────────┬──────────┬──────────┬──────────┐");
        println!("│  Bursts  │ mean(ms) │  min(ms) │  p50(ms) │  p95(ms) │  p99(ms) │  max(ms) │");
        println!("├──────────┼──────────┼──────────┼──────────┼──────────┼──────────┼──────────┤");
        println!(
            "│ {:>8} │ {:>8.2} │ {:>8.2} │ {:>8.2} │ {:>8.2} │ {:>8.2} │ {:>8.2} │",
            self.latency.bursts,
            self.latency.mean_ms,
            self.latency.min_ms,
            self.latency.p50_ms,
            self.latency.p95_ms,
            self.latency.p99_ms,
            self.latency.max_ms
        );
        println!("└──────────┴──────────┴──────────┴──────────┴──────────┴──────────┴──────────┘");
        println!();
        println!(
            "Deliveries: {} ({:.1}/s), lost: {}, delivery rate: {:.2}%",
            self.deliveries,
            self.deliveries_per_second,
            self.lost_deliveries,
            self.delivery_rate()
        );
        println!(
            "Publishes: {} acknowledged, {} failed",
            self.publish_acks, self.publish_errors
        );
        if self.stray_deliveries > 0 {
            println!("Stray deliveries before ready: {}", self.stray_deliveries);
        }
        if let Some(error) = &self.error {
            println!("Run aborted: {}", error);
        }
        println!();
    }

    /// Export the report as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
