//! Client registry for demand tracking
//!
//! The registry holds the writer half of every attached consumer and reports
//! the two demand edges that drive the encoder lifecycle.
//!
//! # Architecture
//!
//! ```text
//!      GET /stream                          ClientRegistry
//!          │                         ┌─────────────────────────┐
//!          ├── ClientSink ──attach──►│ sinks: HashMap<SinkId,  │──► BecameNonEmpty
//!          │                         │        ClientSink>      │──► BecameEmpty
//!          ▼                         └────────────┬────────────┘
//!    SinkReceiver                                 │ snapshot()
//!    (response body)                              ▼
//!          ▲                               multiplex::broadcast
//!          └──────────── Bytes ◄──────────────────┘
//! ```
//!
//! # Zero-Copy Fan-out
//!
//! Chunks are `bytes::Bytes`; every sink receives a reference-counted clone
//! of the same allocation.

pub mod error;
pub mod sink;
pub mod store;

pub use error::RegistryError;
pub use sink::{
    ClientSink, SinkCloseReason, SinkId, SinkIdAllocator, SinkReceiver, SinkWriteError,
};
pub use store::{ClientRegistry, DemandEdge, Detached, Snapshot};
