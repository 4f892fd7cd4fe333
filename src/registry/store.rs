//! Client registry implementation
//!
//! Authoritative membership of attached sinks. The registry is owned by the
//! relay event loop, so it is a plain map with no interior locking; every
//! mutation happens as one synchronous step of that loop.

use std::collections::HashMap;

use super::error::RegistryError;
use super::sink::{ClientSink, SinkId};

/// Demand transition raised by the registry
///
/// Only the empty/non-empty boundary is reported. Interior size changes
/// (1→2, 2→1) produce no edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemandEdge {
    /// Size went 0 → 1
    BecameNonEmpty,
    /// Size went N → 0, N ≥ 1
    BecameEmpty,
}

/// Result of removing a sink
#[derive(Debug)]
pub struct Detached {
    /// The removed writer half
    pub sink: ClientSink,
    /// `Some(BecameEmpty)` if this was the last sink
    pub edge: Option<DemandEdge>,
}

/// Sinks to deliver one chunk to
///
/// Borrowed from the registry for a single broadcast pass, so membership
/// cannot change while a chunk is being dispatched.
pub struct Snapshot<'a> {
    sinks: Vec<&'a ClientSink>,
}

impl<'a> Snapshot<'a> {
    pub fn iter(&self) -> impl Iterator<Item = &'a ClientSink> + '_ {
        self.sinks.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

/// Set of attached sinks keyed by id
#[derive(Debug, Default)]
pub struct ClientRegistry {
    sinks: HashMap<SinkId, ClientSink>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a sink
    ///
    /// Emits [`DemandEdge::BecameNonEmpty`] when this is the first member.
    /// Attaching an id that is already present is refused and leaves the
    /// existing membership untouched.
    pub fn attach(&mut self, sink: ClientSink) -> Result<Option<DemandEdge>, RegistryError> {
        let id = sink.id();
        if self.sinks.contains_key(&id) {
            return Err(RegistryError::DuplicateSink(id));
        }

        let was_empty = self.sinks.is_empty();
        self.sinks.insert(id, sink);

        tracing::info!(sink_id = %id, clients = self.sinks.len(), "Sink attached");

        Ok(was_empty.then_some(DemandEdge::BecameNonEmpty))
    }

    /// Detach a sink
    ///
    /// Absent ids are a silent no-op: disconnects can race with shutdown.
    pub fn detach(&mut self, id: SinkId) -> Option<Detached> {
        let sink = self.sinks.remove(&id)?;
        let edge = self.sinks.is_empty().then_some(DemandEdge::BecameEmpty);

        tracing::info!(sink_id = %id, clients = self.sinks.len(), "Sink detached");

        Some(Detached { sink, edge })
    }

    /// Current members for one broadcast pass
    pub fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            sinks: self.sinks.values().collect(),
        }
    }

    /// Remove every sink, reporting the empty edge if any were present
    pub fn drain(&mut self) -> (Vec<ClientSink>, Option<DemandEdge>) {
        let edge = (!self.sinks.is_empty()).then_some(DemandEdge::BecameEmpty);
        let sinks = self.sinks.drain().map(|(_, sink)| sink).collect();
        (sinks, edge)
    }

    pub fn contains(&self, id: SinkId) -> bool {
        self.sinks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}
