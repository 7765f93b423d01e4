// pubsub-latency - library root for the binary and integration tests

pub mod broker;
pub mod config;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod report;
pub mod runner;
