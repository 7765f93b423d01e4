use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Publish/subscribe fan-out latency benchmark
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Print the final report as JSON instead of a table
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// How log lines are rendered on stderr
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Benchmark an existing server
    Run {
        #[command(flatten)]
        server: ServerArgs,

        #[command(flatten)]
        workload: WorkloadArgs,
    },

    /// Start an in-process mock broker and benchmark it
    Standalone {
        #[command(flatten)]
        workload: WorkloadArgs,

        /// Mock broker PUBLISH error rate (0.0 to 1.0)
        #[arg(long, default_value = "0.0")]
        error_rate: f64,
    },
}

/// Where the server lives
#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Server host address
    #[arg(short = 'H', long, env = "BENCH_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port
    #[arg(short, long, env = "BENCH_PORT", default_value = "6379")]
    pub port: u16,
}

/// Shape of the benchmark workload
#[derive(Args, Debug, Clone)]
pub struct WorkloadArgs {
    /// Number of subscriber connections
    #[arg(short = 's', long, env = "BENCH_SUBSCRIBERS", default_value = "9000")]
    pub subscribers: usize,

    /// Number of publisher connections
    #[arg(short = 'P', long, env = "BENCH_PUBLISHERS", default_value = "1000")]
    pub publishers: usize,

    /// Channel to subscribe and publish on
    #[arg(short, long, env = "BENCH_CHANNEL", default_value = "eventName")]
    pub channel: String,

    /// Message payload
    #[arg(long, env = "BENCH_PAYLOAD", default_value = "a")]
    pub payload: String,

    /// Connection attempts allowed in flight at once
    #[arg(long, env = "BENCH_CONNECT_CONCURRENCY", default_value = "1")]
    pub connect_concurrency: usize,

    /// Stop after this many bursts (runs forever when omitted)
    #[arg(short = 'n', long, env = "BENCH_ITERATIONS")]
    pub iterations: Option<u64>,

    /// Connect timeout in seconds
    #[arg(long, env = "BENCH_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    /// Abort when no event arrives for this many seconds (0 disables)
    #[arg(long, env = "BENCH_STALL_TIMEOUT", default_value = "0")]
    pub stall_timeout: u64,
}

/// Parse the command line after loading `.env`
pub fn load_args() -> CliArgs {
    dotenvy::dotenv().ok();
    CliArgs::parse()
}

/// Configuration for a benchmark run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Subscriber connections to open
    pub subscribers: usize,
    /// Publisher connections to open
    pub publishers: usize,
    /// Channel name
    pub channel: String,
    /// Payload published on every burst
    pub payload: String,
    /// Maximum in-flight connection attempts
    pub connect_concurrency: usize,
    /// Optional burst limit
    pub iterations: Option<u64>,
    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Stall timeout in seconds, 0 disables
    pub stall_timeout_secs: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            subscribers: 9000,
            publishers: 1000,
            channel: "eventName".to_string(),
            payload: "a".to_string(),
            connect_concurrency: 1,
            iterations: None,
            connect_timeout_secs: 10,
            stall_timeout_secs: 0,
        }
    }
}

impl BenchConfig {
    /// Build a config from parsed arguments
    pub fn from_args(server: &ServerArgs, workload: &WorkloadArgs) -> Self {
        Self {
            host: server.host.clone(),
            port: server.port,
            ..Self::from_workload(workload)
        }
    }

    /// Build a config from workload arguments, keeping the default server
    pub fn from_workload(workload: &WorkloadArgs) -> Self {
        Self {
            subscribers: workload.subscribers,
            publishers: workload.publishers,
            channel: workload.channel.clone(),
            payload: workload.payload.clone(),
            connect_concurrency: workload.connect_concurrency,
            iterations: workload.iterations,
            connect_timeout_secs: workload.connect_timeout,
            stall_timeout_secs: workload.stall_timeout,
            ..Default::default()
        }
    }

    /// Point the config at the given local port (standalone mode)
    pub fn with_local_port(self, port: u16) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port,
            ..self
        }
    }

    /// "host:port" address of the server
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Deliveries expected per burst
    pub fn expected_deliveries(&self) -> u64 {
        self.subscribers as u64 * self.publishers as u64
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        (self.stall_timeout_secs > 0).then(|| Duration::from_secs(self.stall_timeout_secs))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.subscribers == 0 {
            anyhow::bail!("subscriber count must be at least 1");
        }
        if self.publishers == 0 {
            anyhow::bail!("publisher count must be at least 1");
        }
        if self.connect_concurrency == 0 {
            anyhow::bail!("connect concurrency must be at least 1");
        }
        if self.channel.is_empty() {
            anyhow::bail!("channel name cannot be empty");
        }
        if self.iterations == Some(0) {
            anyhow::bail!("iteration limit must be at least 1 when set");
        }
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("connect timeout must be at least 1 second");
        }

        Ok(())
    }
}

/// Configuration for the mock broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockBrokerConfig {
    /// Port to listen on (0 for random)
    pub port: u16,
    /// Fraction of PUBLISH commands answered with an error (0.0 to 1.0)
    pub error_rate: f64,
}

impl Default for MockBrokerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            error_rate: 0.0,
        }
    }
}

impl MockBrokerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.error_rate) {
            anyhow::bail!("error rate must be between 0.0 and 1.0, got {}", self.error_rate);
        }
        Ok(())
    }
}
