//! Message broker collaborator.
//!
//! The driver never performs I/O itself. It asks a [`Broker`] to open
//! connections and to publish, and the broker reports completions back as
//! [`BrokerEvent`]s on the single event loop. This module provides:
//! - RESP frame codec
//! - TCP implementation of the broker client
//! - In-process mock broker server for standalone runs and tests

pub mod mock;
pub mod resp;
pub mod tcp;

use bytes::Bytes;

use crate::error::BenchError;

pub use mock::MockBroker;
pub use tcp::{PublisherHandle, TcpBroker};

/// Which side of the benchmark a connection belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Subscriber,
    Publisher,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Subscriber => write!(f, "subscriber"),
            Role::Publisher => write!(f, "publisher"),
        }
    }
}

/// Asynchronous client operations the driver relies on.
///
/// Every method returns immediately; outcomes arrive later as events.
pub trait Broker {
    /// Handle for an established publisher connection
    type Publisher;

    /// Open connection `id` and subscribe it to `channel`.
    /// Completion: [`BrokerEvent::Subscribed`], then one
    /// [`BrokerEvent::Delivery`] per message received.
    fn open_subscriber(&mut self, id: usize, channel: &str);

    /// Open publisher connection `id`.
    /// Completion: [`BrokerEvent::PublisherConnected`].
    fn open_publisher(&mut self, id: usize);

    /// Issue `PUBLISH channel payload` on `publisher`, tagged with `burst`.
    /// Completion: [`BrokerEvent::PublishReplied`] or [`BrokerEvent::PublishFailed`].
    fn publish(&mut self, publisher: &Self::Publisher, burst: u64, channel: &str, payload: &Bytes);
}

/// Completion reported by a [`Broker`]
#[derive(Debug)]
pub enum BrokerEvent<P> {
    /// Subscriber `id` has its SUBSCRIBE acknowledged
    Subscribed { id: usize },
    /// Publisher `id` finished connecting
    PublisherConnected { id: usize, handle: P },
    /// Subscriber `id` received one message
    Delivery { id: usize },
    /// Server accepted a publish and fanned it out to `receivers` subscribers
    PublishReplied { burst: u64, receivers: u64 },
    /// Publish was rejected or could not be sent
    PublishFailed { burst: u64, reason: String },
    /// Connect, subscribe or connection failure; fatal for the run
    Fault(BenchError),
}

impl<P> BrokerEvent<P> {
    /// Short name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            BrokerEvent::Subscribed { .. } => "subscribe ack",
            BrokerEvent::PublisherConnected { .. } => "publisher connect",
            BrokerEvent::Delivery { .. } => "delivery",
            BrokerEvent::PublishReplied { .. } => "publish reply",
            BrokerEvent::PublishFailed { .. } => "publish failure",
            BrokerEvent::Fault(_) => "fault",
        }
    }
}
