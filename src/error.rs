// Error handling module
// Defines the error types raised while driving a benchmark run

use std::time::Duration;
use thiserror::Error;

use crate::broker::Role;
use crate::driver::Phase;

/// Errors that can occur while setting up or running a benchmark
#[derive(Error, Debug)]
pub enum BenchError {
    /// Invalid workload configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// TCP connect failed
    #[error("Failed to connect {role} #{id}: {source}")]
    Connect {
        role: Role,
        id: usize,
        #[source]
        source: std::io::Error,
    },

    /// TCP connect did not finish in time
    #[error("Timed out connecting {role} #{id} after {timeout:?}")]
    ConnectTimeout {
        role: Role,
        id: usize,
        timeout: Duration,
    },

    /// Server answered SUBSCRIBE with something other than an ack
    #[error("Subscribe rejected on subscriber #{id}: {message}")]
    SubscribeRejected { id: usize, message: String },

    /// An established connection went away
    #[error("Connection lost on {role} #{id}: {reason}")]
    ConnectionLost {
        role: Role,
        id: usize,
        reason: String,
    },

    /// Malformed RESP data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Event that the current phase cannot account for
    #[error("Unexpected {event} during {phase}")]
    UnexpectedEvent { event: &'static str, phase: Phase },

    /// No event arrived within the stall timeout
    #[error(
        "No progress for {timeout:?} during {phase} \
         (remaining subscribers: {remaining_subs}, publishers: {remaining_pubs}, messages: {remaining_messages})"
    )]
    Stalled {
        timeout: Duration,
        phase: Phase,
        remaining_subs: usize,
        remaining_pubs: usize,
        remaining_messages: u64,
    },

    /// Raw I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for benchmark operations
pub type Result<T> = std::result::Result<T, BenchError>;
