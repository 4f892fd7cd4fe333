//! Relay and consumer statistics

pub mod metrics;

pub use metrics::{RelayStats, SinkStats};
