//! Broadcast multiplexer
//!
//! Writes one encoder chunk to every sink in a registry snapshot. Writes
//! never block and never remove sinks: a failing sink is signalled closed
//! (slow consumer) or left for its connection to detach (already gone).

use bytes::Bytes;

use crate::registry::{SinkCloseReason, SinkId, SinkWriteError, Snapshot};

/// Result of one broadcast pass
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    /// Sinks the chunk was queued to
    pub delivered: usize,
    /// Sinks that were newly closed as slow consumers during this pass
    pub slow_consumers: usize,
    /// Per-sink failures, in snapshot order
    pub failures: Vec<(SinkId, SinkWriteError)>,
}

/// Queue `chunk` to every sink in `snapshot`
pub fn broadcast(snapshot: &Snapshot<'_>, chunk: &Bytes) -> BroadcastOutcome {
    let mut outcome = BroadcastOutcome::default();

    for sink in snapshot.iter() {
        match sink.try_write(chunk) {
            Ok(()) => outcome.delivered += 1,
            Err(err) => {
                match err {
                    SinkWriteError::SlowConsumer { pending, limit } => {
                        if sink.close(SinkCloseReason::SlowConsumer) {
                            tracing::warn!(
                                sink_id = %sink.id(),
                                pending_bytes = pending,
                                limit_bytes = limit,
                                "Slow consumer disconnected"
                            );
                            outcome.slow_consumers += 1;
                        }
                    }
                    SinkWriteError::Closed => {
                        tracing::trace!(sink_id = %sink.id(), "Write to closed sink, awaiting detach");
                    }
                }
                outcome.failures.push((sink.id(), err));
            }
        }
    }

    outcome
}
