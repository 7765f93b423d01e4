//! Benchmark driver.
//!
//! The driver sequences connection setup, issues publish bursts and counts
//! deliveries. It owns all benchmark state and is fed [`BrokerEvent`]s one at
//! a time from a single event loop; every side effect goes through the
//! [`Broker`] it was built with, which makes it testable without a server.
//!
//! Lifecycle: `ConnectingSubscribers` → `ConnectingPublishers` → `Ready`.
//! `Ready` is entered exactly once, when every subscriber has been
//! acknowledged and every publisher has connected, and from then on bursts
//! repeat back to back.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::broker::{Broker, BrokerEvent};
use crate::config::BenchConfig;
use crate::error::{BenchError, Result};
use crate::metrics::{MetricsCollector, MetricsSnapshot};

/// Log connection progress every this many established connections
const PROGRESS_EVERY: usize = 1000;

/// Connection phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ConnectingSubscribers,
    ConnectingPublishers,
    Ready,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::ConnectingSubscribers => write!(f, "connecting subscribers"),
            Phase::ConnectingPublishers => write!(f, "connecting publishers"),
            Phase::Ready => write!(f, "ready"),
        }
    }
}

/// Counters and handles shared by every step of a run
#[derive(Debug)]
pub struct BenchmarkState<P> {
    /// Subscribers not yet acknowledged
    pub remaining_subs: usize,
    /// Publishers not yet connected
    pub remaining_pubs: usize,
    /// Established publishers, in connect order
    pub pubs: Vec<P>,
    /// Deliveries still expected in the current burst
    pub remaining_messages: u64,
    /// Deliveries expected per burst
    pub num_messages: u64,
    /// Completed bursts
    pub iterations: u64,
    /// Start of the current burst
    pub start: Option<Instant>,
    /// Sum of completed burst durations
    pub total_elapsed: Duration,
    /// Sequence number of the current burst, 0 before the first
    pub burst: u64,
    /// Deliveries declared lost in the current burst
    pub burst_lost: u64,
}

impl<P> BenchmarkState<P> {
    fn new(subscribers: usize, publishers: usize) -> Self {
        let num_messages = subscribers as u64 * publishers as u64;
        Self {
            remaining_subs: subscribers,
            remaining_pubs: publishers,
            pubs: Vec::with_capacity(publishers),
            remaining_messages: num_messages,
            num_messages,
            iterations: 0,
            start: None,
            total_elapsed: Duration::ZERO,
            burst: 0,
            burst_lost: 0,
        }
    }
}

/// Outcome of one completed burst
#[derive(Debug, Clone, PartialEq)]
pub struct BurstSummary {
    /// 1-based burst number
    pub iteration: u64,
    /// Wall-clock time of this burst
    pub elapsed: Duration,
    /// Running mean over all bursts so far, in milliseconds
    pub mean_ms: f64,
    /// Deliveries declared lost in this burst
    pub lost: u64,
}

impl BurstSummary {
    /// The per-burst output line
    pub fn latency_line(&self) -> String {
        format!("Latency: {:.3} ms", self.mean_ms)
    }
}

/// Drives one benchmark run over a [`Broker`]
pub struct BenchmarkDriver<B: Broker> {
    broker: B,
    channel: String,
    payload: Bytes,
    subscribers: usize,
    publishers: usize,
    connect_concurrency: usize,
    /// Stop issuing bursts after this many
    iteration_limit: Option<u64>,
    phase: Phase,
    state: BenchmarkState<B::Publisher>,
    /// Connections not yet requested from the broker
    subs_to_open: usize,
    pubs_to_open: usize,
    /// Requested connections without a completion yet
    in_flight: usize,
    metrics: MetricsCollector,
}

impl<B: Broker> BenchmarkDriver<B> {
    /// Create a driver for `config`.
    ///
    /// Workloads without subscribers or publishers are rejected: a burst
    /// with zero expected deliveries would never be observable.
    pub fn new(broker: B, config: &BenchConfig) -> Result<Self> {
        if config.subscribers == 0 {
            return Err(BenchError::Config(
                "subscriber count must be at least 1".to_string(),
            ));
        }
        if config.publishers == 0 {
            return Err(BenchError::Config(
                "publisher count must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            broker,
            channel: config.channel.clone(),
            payload: Bytes::from(config.payload.clone()),
            subscribers: config.subscribers,
            publishers: config.publishers,
            connect_concurrency: config.connect_concurrency.max(1),
            iteration_limit: config.iterations,
            phase: Phase::ConnectingSubscribers,
            state: BenchmarkState::new(config.subscribers, config.publishers),
            subs_to_open: config.subscribers,
            pubs_to_open: config.publishers,
            in_flight: 0,
            metrics: MetricsCollector::new(),
        })
    }

    /// Open the first connection(s)
    pub fn start(&mut self) {
        tracing::info!(
            "Connecting {} subscribers and {} publishers on channel '{}'",
            self.subscribers,
            self.publishers,
            self.channel
        );
        self.fill();
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// True once the iteration limit has been reached
    pub fn is_finished(&self) -> bool {
        self.iteration_limit
            .is_some_and(|limit| self.state.iterations >= limit)
    }

    pub fn state(&self) -> &BenchmarkState<B::Publisher> {
        &self.state
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    /// Apply one event. Returns a summary when it completed a burst.
    pub fn handle(&mut self, event: BrokerEvent<B::Publisher>) -> Result<Option<BurstSummary>> {
        let exhausted = match &event {
            BrokerEvent::Subscribed { .. } => self.state.remaining_subs == 0,
            BrokerEvent::PublisherConnected { .. } => self.state.remaining_pubs == 0,
            _ => false,
        };
        if exhausted {
            return Err(BenchError::UnexpectedEvent {
                event: event.name(),
                phase: self.phase,
            });
        }

        match event {
            BrokerEvent::Subscribed { id } => {
                self.on_subscribed(id);
                Ok(None)
            }
            BrokerEvent::PublisherConnected { id, handle } => {
                self.on_publisher_connected(id, handle);
                Ok(None)
            }
            BrokerEvent::Delivery { .. } => Ok(self.on_delivery()),
            BrokerEvent::PublishReplied { burst, receivers } => {
                Ok(self.on_publish_replied(burst, receivers))
            }
            BrokerEvent::PublishFailed { burst, reason } => {
                Ok(self.on_publish_failed(burst, &reason))
            }
            BrokerEvent::Fault(err) => Err(err),
        }
    }

    /// Error describing where the run got stuck
    pub fn stalled(&self, timeout: Duration) -> BenchError {
        BenchError::Stalled {
            timeout,
            phase: self.phase,
            remaining_subs: self.state.remaining_subs,
            remaining_pubs: self.state.remaining_pubs,
            remaining_messages: self.state.remaining_messages,
        }
    }

    /// Stop the clock and snapshot the metrics
    pub fn finish(&mut self) -> MetricsSnapshot {
        self.metrics.stop();
        self.metrics.snapshot()
    }

    fn on_subscribed(&mut self, id: usize) {
        self.state.remaining_subs -= 1;
        self.in_flight = self.in_flight.saturating_sub(1);

        let acked = self.subscribers - self.state.remaining_subs;
        if acked % PROGRESS_EVERY == 0 {
            tracing::info!("{}/{} subscribers acknowledged", acked, self.subscribers);
        }
        tracing::trace!("Subscriber #{} acknowledged", id);

        self.advance();
    }

    fn on_publisher_connected(&mut self, id: usize, handle: B::Publisher) {
        self.state.pubs.push(handle);
        self.state.remaining_pubs -= 1;
        self.in_flight = self.in_flight.saturating_sub(1);

        let connected = self.state.pubs.len();
        if connected % PROGRESS_EVERY == 0 {
            tracing::info!("{}/{} publishers connected", connected, self.publishers);
        }
        tracing::trace!("Publisher #{} connected", id);

        self.advance();
    }

    fn on_delivery(&mut self) -> Option<BurstSummary> {
        if self.phase != Phase::Ready || self.is_finished() {
            // Somebody else is publishing on our channel
            self.metrics.record_stray_delivery();
            tracing::debug!("Ignoring delivery received outside a burst");
            return None;
        }
        self.metrics.record_delivery();
        self.consume(1)
    }

    fn on_publish_replied(&mut self, burst: u64, receivers: u64) -> Option<BurstSummary> {
        self.metrics.record_publish_ack();
        if !self.is_current(burst) {
            return None;
        }

        let expected = self.subscribers as u64;
        if receivers >= expected {
            return None;
        }
        let shortfall = expected - receivers;
        tracing::warn!(
            "Publish in burst {} reached {} of {} subscribers; counting {} deliveries as lost",
            burst,
            receivers,
            expected,
            shortfall
        );
        self.declare_lost(shortfall)
    }

    fn on_publish_failed(&mut self, burst: u64, reason: &str) -> Option<BurstSummary> {
        self.metrics.record_publish_error();
        if !self.is_current(burst) {
            tracing::debug!("Ignoring failure from finished burst {}: {}", burst, reason);
            return None;
        }

        tracing::warn!("Publish failed in burst {}: {}", burst, reason);
        self.declare_lost(self.subscribers as u64)
    }

    fn is_current(&self, burst: u64) -> bool {
        self.phase == Phase::Ready && !self.is_finished() && burst == self.state.burst
    }

    /// Request connections until the in-flight limit is reached.
    /// Publishers are only requested once every subscriber has been.
    fn fill(&mut self) {
        while self.in_flight < self.connect_concurrency {
            if self.subs_to_open > 0 {
                let id = self.subscribers - self.subs_to_open;
                self.subs_to_open -= 1;
                self.broker.open_subscriber(id, &self.channel);
            } else if self.pubs_to_open > 0 {
                let id = self.publishers - self.pubs_to_open;
                self.pubs_to_open -= 1;
                self.broker.open_publisher(id);
            } else {
                break;
            }
            self.in_flight += 1;
        }
    }

    /// Re-evaluate the phase after a connection completed
    fn advance(&mut self) {
        if self.state.remaining_subs == 0 && self.state.remaining_pubs == 0 {
            self.enter_ready();
            return;
        }

        if self.state.remaining_subs == 0 && self.phase == Phase::ConnectingSubscribers {
            tracing::info!(
                "All {} subscribers acknowledged, connecting {} publishers",
                self.subscribers,
                self.state.remaining_pubs
            );
            self.phase = Phase::ConnectingPublishers;
        }
        self.fill();
    }

    fn enter_ready(&mut self) {
        if self.phase == Phase::Ready {
            return;
        }
        tracing::info!(
            "All connections established, expecting {} deliveries per burst",
            self.state.num_messages
        );
        self.phase = Phase::Ready;
        self.state.remaining_messages = self.state.num_messages;
        self.metrics.start();
        self.begin_burst();
    }

    fn begin_burst(&mut self) {
        self.state.burst += 1;
        self.state.burst_lost = 0;
        self.state.start = Some(Instant::now());

        for publisher in &self.state.pubs {
            self.broker
                .publish(publisher, self.state.burst, &self.channel, &self.payload);
        }
    }

    fn declare_lost(&mut self, count: u64) -> Option<BurstSummary> {
        let count = count.min(self.state.remaining_messages);
        self.metrics.record_lost(count);
        self.state.burst_lost += count;
        self.consume(count)
    }

    fn consume(&mut self, count: u64) -> Option<BurstSummary> {
        self.state.remaining_messages = self.state.remaining_messages.saturating_sub(count);
        if self.state.remaining_messages > 0 {
            return None;
        }
        Some(self.complete_burst())
    }

    fn complete_burst(&mut self) -> BurstSummary {
        let elapsed = self
            .state
            .start
            .map(|start| start.elapsed())
            .unwrap_or_default();

        self.state.iterations += 1;
        self.state.total_elapsed += elapsed;
        self.metrics.record_burst(elapsed);

        let summary = BurstSummary {
            iteration: self.state.iterations,
            elapsed,
            mean_ms: self.state.total_elapsed.as_secs_f64() * 1000.0
                / self.state.iterations as f64,
            lost: self.state.burst_lost,
        };

        self.state.remaining_messages = self.state.num_messages;
        if !self.is_finished() {
            self.begin_burst();
        }
        summary
    }
}
