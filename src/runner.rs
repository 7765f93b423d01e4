//! Benchmark runner: the event loop that feeds the driver.

use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::broker::{BrokerEvent, TcpBroker};
use crate::config::BenchConfig;
use crate::driver::{BenchmarkDriver, BurstSummary};
use crate::error::{BenchError, Result};
use crate::report::BenchmarkReport;

/// Runs the benchmark against a RESP server
pub struct BenchmarkRunner {
    config: BenchConfig,
}

impl BenchmarkRunner {
    /// Create a new benchmark runner
    pub fn new(config: BenchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// Run until Ctrl+C, SIGTERM, the iteration limit or a fatal error,
    /// printing one latency line per burst.
    pub async fn run(&self) -> Result<BenchmarkReport> {
        self.run_until(shutdown_signal(), |summary| {
            println!("{}", summary.latency_line());
        })
        .await
    }

    /// Run until `shutdown` resolves, handing every burst to `on_burst`.
    ///
    /// Errors raised after setup do not fail the call: they end the run and
    /// are recorded in the returned report.
    pub async fn run_until<S, F>(&self, shutdown: S, mut on_burst: F) -> Result<BenchmarkReport>
    where
        S: Future<Output = ()>,
        F: FnMut(&BurstSummary),
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let broker = TcpBroker::new(self.config.addr(), self.config.connect_timeout(), tx);
        let mut driver = BenchmarkDriver::new(broker, &self.config)?;

        tracing::info!("Benchmarking {}", driver.broker().addr());
        let started_at = Utc::now();
        driver.start();

        tokio::pin!(shutdown);
        let stall_timeout = self.config.stall_timeout();
        let mut failure: Option<BenchError> = None;

        loop {
            let next = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, stopping benchmark");
                    break;
                }
                next = next_event(&mut rx, stall_timeout) => next,
            };

            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(timeout) => {
                    failure = Some(driver.stalled(timeout));
                    break;
                }
            };

            match driver.handle(event) {
                Ok(Some(summary)) => {
                    on_burst(&summary);
                    if driver.is_finished() {
                        tracing::info!("Completed {} bursts", summary.iteration);
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        driver.broker_mut().shutdown();
        let phase = driver.phase();
        let snapshot = driver.finish();
        let report = BenchmarkReport::new(&self.config, started_at, phase, &snapshot);

        Ok(match failure {
            Some(err) => {
                tracing::error!("❌ Benchmark aborted: {}", err);
                report.with_error(err)
            }
            None => report,
        })
    }
}

/// Next event, or the stall timeout that elapsed waiting for it
async fn next_event<P>(
    rx: &mut mpsc::UnboundedReceiver<BrokerEvent<P>>,
    stall_timeout: Option<Duration>,
) -> std::result::Result<Option<BrokerEvent<P>>, Duration> {
    match stall_timeout {
        Some(timeout) => tokio::time::timeout(timeout, rx.recv())
            .await
            .map_err(|_| timeout),
        None => Ok(rx.recv().await),
    }
}

/// Resolve on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal");
        },
    }
}
