//! Client sink types
//!
//! A sink is split in two halves when a consumer connects:
//!
//! - [`ClientSink`] is the writer half. It lives in the registry and is
//!   what the multiplexer writes chunks into.
//! - [`SinkReceiver`] is the reader half. The HTTP layer turns it into the
//!   response body, so it lives exactly as long as the connection does.
//!
//! Chunks are `bytes::Bytes`, so handing the same chunk to every sink only
//! bumps a reference count.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::stats::SinkStats;

/// Identifier of an attached consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

impl SinkId {
    /// Wrap a raw id
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric id
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sink-{}", self.0)
    }
}

/// Hands out monotonically increasing sink ids, starting at 1
#[derive(Debug)]
pub struct SinkIdAllocator {
    next: AtomicU64,
}

impl SinkIdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id
    pub fn next_id(&self) -> SinkId {
        SinkId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SinkIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a sink was closed from the relay side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkCloseReason {
    /// Outstanding bytes exceeded the per-sink cap
    SlowConsumer,
    /// The relay is shutting down
    Shutdown,
}

/// Failure to queue a chunk for one sink
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkWriteError {
    /// The consumer connection is gone or was closed by the relay
    #[error("consumer connection closed")]
    Closed,
    /// Queuing the chunk would push the backlog over the cap
    #[error("consumer backlog of {pending} bytes exceeds limit of {limit} bytes")]
    SlowConsumer { pending: usize, limit: usize },
}

/// Writer half of a consumer connection
#[derive(Debug)]
pub struct ClientSink {
    id: SinkId,
    attached_at: Instant,
    tx: mpsc::UnboundedSender<Bytes>,
    close_tx: watch::Sender<Option<SinkCloseReason>>,
    /// Bytes queued but not yet taken by the reader
    pending: Arc<AtomicUsize>,
    /// 0 = unlimited
    max_pending_bytes: usize,
    bytes_queued: AtomicU64,
    chunks_queued: AtomicU64,
}

impl ClientSink {
    /// Create a connected writer/reader pair
    ///
    /// `max_pending_bytes` caps the backlog a consumer may accumulate before
    /// it is treated as a slow consumer. `0` disables the cap.
    pub fn channel(id: SinkId, max_pending_bytes: usize) -> (ClientSink, SinkReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(None);
        let pending = Arc::new(AtomicUsize::new(0));

        let sink = ClientSink {
            id,
            attached_at: Instant::now(),
            tx,
            close_tx,
            pending: Arc::clone(&pending),
            max_pending_bytes,
            bytes_queued: AtomicU64::new(0),
            chunks_queued: AtomicU64::new(0),
        };

        let receiver = SinkReceiver {
            id,
            rx,
            close_rx,
            close_dropped: false,
            pending,
        };

        (sink, receiver)
    }

    pub fn id(&self) -> SinkId {
        self.id
    }

    /// Bytes currently queued for this consumer
    pub fn pending_bytes(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Whether the reader is gone or the relay closed this sink
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.close_tx.borrow().is_some()
    }

    /// Queue a chunk without blocking
    ///
    /// A single chunk larger than the cap is still accepted when nothing
    /// else is pending, so a small cap cannot starve every consumer.
    pub fn try_write(&self, chunk: &Bytes) -> Result<(), SinkWriteError> {
        if self.is_closed() {
            return Err(SinkWriteError::Closed);
        }

        let len = chunk.len();
        if self.max_pending_bytes > 0 {
            let pending = self.pending.load(Ordering::Relaxed);
            if pending > 0 && pending + len > self.max_pending_bytes {
                return Err(SinkWriteError::SlowConsumer {
                    pending: pending + len,
                    limit: self.max_pending_bytes,
                });
            }
        }

        self.pending.fetch_add(len, Ordering::Relaxed);
        if self.tx.send(chunk.clone()).is_err() {
            self.pending.fetch_sub(len, Ordering::Relaxed);
            return Err(SinkWriteError::Closed);
        }

        self.bytes_queued.fetch_add(len as u64, Ordering::Relaxed);
        self.chunks_queued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Signal the reader to end the connection
    ///
    /// Returns `true` only for the call that actually closed the sink.
    pub fn close(&self, reason: SinkCloseReason) -> bool {
        self.close_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    /// Reason the sink was closed by the relay, if it was
    pub fn close_reason(&self) -> Option<SinkCloseReason> {
        *self.close_tx.borrow()
    }

    /// Snapshot of this sink's counters
    pub fn stats(&self) -> SinkStats {
        SinkStats {
            id: self.id,
            bytes_queued: self.bytes_queued.load(Ordering::Relaxed),
            chunks_queued: self.chunks_queued.load(Ordering::Relaxed),
            duration: self.attached_at.elapsed(),
        }
    }
}

/// Reader half of a consumer connection
#[derive(Debug)]
pub struct SinkReceiver {
    id: SinkId,
    rx: mpsc::UnboundedReceiver<Bytes>,
    close_rx: watch::Receiver<Option<SinkCloseReason>>,
    close_dropped: bool,
    pending: Arc<AtomicUsize>,
}

impl SinkReceiver {
    pub fn id(&self) -> SinkId {
        self.id
    }

    /// Next chunk for this consumer
    ///
    /// Returns `None` once the relay closes the sink (queued chunks are
    /// discarded) or the writer half is dropped and drained.
    pub async fn recv(&mut self) -> Option<Bytes> {
        loop {
            if self.close_rx.borrow_and_update().is_some() {
                return None;
            }

            tokio::select! {
                biased;

                changed = self.close_rx.changed(), if !self.close_dropped => {
                    if changed.is_err() {
                        self.close_dropped = true;
                    }
                }
                chunk = self.rx.recv() => {
                    let chunk = chunk?;
                    self.pending.fetch_sub(chunk.len(), Ordering::Relaxed);
                    return Some(chunk);
                }
            }
        }
    }
}
