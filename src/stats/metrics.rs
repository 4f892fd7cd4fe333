//! Statistics for the relay and its consumers

use std::time::{Duration, Instant};

use crate::registry::SinkId;

/// Per-consumer statistics
#[derive(Debug, Clone)]
pub struct SinkStats {
    /// Consumer id
    pub id: SinkId,
    /// Total bytes queued to this consumer
    pub bytes_queued: u64,
    /// Number of chunks queued to this consumer
    pub chunks_queued: u64,
    /// Time since the consumer attached
    pub duration: Duration,
}

impl SinkStats {
    /// Average delivered bitrate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.duration.as_secs();
        if secs > 0 {
            (self.bytes_queued * 8) / secs
        } else {
            0
        }
    }
}

/// Relay-wide statistics
#[derive(Debug, Clone)]
pub struct RelayStats {
    /// When the relay started
    pub started_at: Instant,
    /// Encoder processes spawned (initial and restarts)
    pub spawns: u64,
    /// Spawns triggered by the restart timer
    pub restarts: u64,
    /// Spawn attempts that failed outright
    pub spawn_failures: u64,
    /// Encoder exits while consumers were attached
    pub unexpected_exits: u64,
    /// Chunks read from the encoder
    pub chunks: u64,
    /// Bytes read from the encoder
    pub bytes_broadcast: u64,
    /// Consumers ever attached
    pub total_sinks: u64,
    /// Consumers currently attached
    pub active_sinks: u64,
    /// Consumers closed for exceeding their backlog cap
    pub slow_consumer_disconnects: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            spawns: 0,
            restarts: 0,
            spawn_failures: 0,
            unexpected_exits: 0,
            chunks: 0,
            bytes_broadcast: 0,
            total_sinks: 0,
            active_sinks: 0,
            slow_consumer_disconnects: 0,
        }
    }

    /// Time since the relay started
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Record one chunk read from the encoder
    pub fn record_chunk(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes_broadcast += len as u64;
    }

    /// Average encoder output bitrate over the relay's lifetime
    pub fn bitrate(&self) -> u64 {
        let secs = self.uptime().as_secs();
        if secs > 0 {
            (self.bytes_broadcast * 8) / secs
        } else {
            0
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}
