//! Relay event loop
//!
//! A single task owns the client registry, the encoder supervisor and the
//! relay statistics. HTTP connections talk to it through a cloneable
//! [`RelayHandle`]; encoder pump tasks talk to it through [`EncoderEvent`]s.
//! Every state change happens on this task, so attach, detach, chunk
//! dispatch, exits and restart timers are totally ordered.
//!
//! ```text
//!   RelayHandle ──RelayCommand──┐
//!                               ▼
//!   pump task ──EncoderEvent──► Relay::run ──► Supervisor ──► Spawner
//!                               │    ▲
//!                   broadcast ◄─┘    └── restart deadline
//! ```

pub mod multiplex;

use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::encoder::{
    EncoderConfig, EncoderEvent, EncoderPhase, Spawner, Supervisor, Transition,
};
use crate::registry::{
    ClientRegistry, ClientSink, DemandEdge, RegistryError, SinkCloseReason, SinkId,
    SinkIdAllocator, SinkReceiver,
};
use crate::stats::RelayStats;

pub use multiplex::{broadcast, BroadcastOutcome};

/// Capacity of the encoder event channel
const ENCODER_EVENT_CAPACITY: usize = 64;

/// Errors returned to relay callers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// New consumers are refused once shutdown has begun
    #[error("relay is shutting down")]
    ShuttingDown,

    /// The event loop is gone
    #[error("relay event loop is not running")]
    Closed,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Liveness report served on `/health`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub ok: bool,
    /// True only while an encoder instance is live
    pub encoder: bool,
    #[serde(skip)]
    pub phase: EncoderPhase,
    #[serde(skip)]
    pub clients: usize,
}

/// Requests handled by the event loop
#[derive(Debug)]
pub enum RelayCommand {
    Attach {
        sink: ClientSink,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    Detach {
        id: SinkId,
    },
    Health {
        reply: oneshot::Sender<HealthReport>,
    },
    Stats {
        reply: oneshot::Sender<RelayStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running [`Relay`]
#[derive(Debug, Clone)]
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<RelayCommand>,
    ids: Arc<SinkIdAllocator>,
}

impl RelayHandle {
    /// Allocate a fresh sink id
    pub fn next_sink_id(&self) -> SinkId {
        self.ids.next_id()
    }

    /// Register `sink`; starts the encoder if it is the first consumer
    pub async fn attach(&self, sink: ClientSink) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RelayCommand::Attach { sink, reply })
            .map_err(|_| RelayError::Closed)?;
        rx.await.map_err(|_| RelayError::Closed)?
    }

    /// Remove a sink; stops the encoder if it was the last consumer
    ///
    /// Fire-and-forget so it can run from `Drop`. Unknown ids are ignored.
    pub fn detach(&self, id: SinkId) {
        if self.commands.send(RelayCommand::Detach { id }).is_err() {
            tracing::trace!(sink_id = %id, "Detach after relay stopped");
        }
    }

    /// Open a sink, attach it and wrap the reader half in a [`Subscription`]
    ///
    /// The guard is armed before the attach is sent, so dropping this future
    /// at any await point still detaches the sink.
    pub async fn subscribe(&self, max_pending_bytes: usize) -> Result<Subscription, RelayError> {
        let (sink, receiver) = ClientSink::channel(self.next_sink_id(), max_pending_bytes);
        let mut subscription = Subscription {
            receiver,
            handle: self.clone(),
            armed: true,
        };

        if let Err(e) = self.attach(sink).await {
            // Never attached; a detach could hit another sink with this id
            subscription.armed = false;
            return Err(e);
        }

        tracing::debug!(sink_id = %subscription.id(), "Subscribed");
        Ok(subscription)
    }

    pub async fn health(&self) -> Result<HealthReport, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RelayCommand::Health { reply })
            .map_err(|_| RelayError::Closed)?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    pub async fn stats(&self) -> Result<RelayStats, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RelayCommand::Stats { reply })
            .map_err(|_| RelayError::Closed)?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    /// Close every sink, stop the encoder and refuse new consumers
    ///
    /// Idempotent. Resolves once the event loop has applied it.
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RelayCommand::Shutdown { reply })
            .map_err(|_| RelayError::Closed)?;
        rx.await.map_err(|_| RelayError::Closed)
    }
}

/// An attached consumer
///
/// Detaches from the relay when dropped, however the connection ends.
#[derive(Debug)]
pub struct Subscription {
    receiver: SinkReceiver,
    handle: RelayHandle,
    armed: bool,
}

impl Subscription {
    pub fn id(&self) -> SinkId {
        self.receiver.id()
    }

    /// Next chunk, or `None` once the relay closed this consumer
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Body stream for a streaming HTTP response
    ///
    /// Dropping the stream, or reaching its end, detaches the consumer.
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|chunk| (Ok(chunk), sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.armed {
            self.handle.detach(self.receiver.id());
        }
    }
}

/// The relay event loop
pub struct Relay<S: Spawner> {
    registry: ClientRegistry,
    supervisor: Supervisor<S>,
    stats: RelayStats,
    commands: mpsc::UnboundedReceiver<RelayCommand>,
    encoder_events: mpsc::Receiver<EncoderEvent>,
    shutting_down: bool,
}

impl<S: Spawner> Relay<S> {
    /// Create the event loop and a handle to it
    ///
    /// Nothing runs until [`Relay::run`] is polled.
    pub fn new(config: Arc<EncoderConfig>, spawner: S) -> (Self, RelayHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(ENCODER_EVENT_CAPACITY);

        let relay = Self {
            registry: ClientRegistry::new(),
            supervisor: Supervisor::new(config, spawner, event_tx),
            stats: RelayStats::new(),
            commands: command_rx,
            encoder_events: event_rx,
            shutting_down: false,
        };
        let handle = RelayHandle {
            commands: command_tx,
            ids: Arc::new(SinkIdAllocator::new()),
        };

        (relay, handle)
    }

    /// Run until every [`RelayHandle`] is dropped
    pub async fn run(mut self) -> RelayStats {
        loop {
            let restart = self.supervisor.restart_deadline();

            tokio::select! {
                // Encoder output first, so anything the encoder said before a
                // command was sent is applied before that command
                biased;

                Some(event) = self.encoder_events.recv() => self.handle_encoder_event(event),
                ticket = restart_timer(restart) => self.handle_restart_timer(ticket),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }

        self.begin_shutdown();
        tracing::debug!("Relay event loop stopped");
        self.snapshot_stats()
    }

    fn handle_command(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Attach { sink, reply } => {
                let result = self.attach(sink);
                let _ = reply.send(result);
            }
            RelayCommand::Detach { id } => self.detach(id),
            RelayCommand::Health { reply } => {
                let _ = reply.send(HealthReport {
                    ok: true,
                    encoder: self.supervisor.is_running(),
                    phase: self.supervisor.phase(),
                    clients: self.registry.len(),
                });
            }
            RelayCommand::Stats { reply } => {
                let _ = reply.send(self.snapshot_stats());
            }
            RelayCommand::Shutdown { reply } => {
                self.begin_shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn attach(&mut self, sink: ClientSink) -> Result<(), RelayError> {
        if self.shutting_down {
            tracing::debug!(sink_id = %sink.id(), "Refusing consumer during shutdown");
            return Err(RelayError::ShuttingDown);
        }

        let edge = self.registry.attach(sink).map_err(|e| {
            tracing::error!(error = %e, "Consumer attach refused");
            debug_assert!(
                !matches!(e, RegistryError::DuplicateSink(_)),
                "sink ids must be unique: {}",
                e
            );
            e
        })?;
        self.stats.total_sinks += 1;

        if edge == Some(DemandEdge::BecameNonEmpty) {
            let transition = self.supervisor.on_demand();
            self.record(&transition);
        }
        Ok(())
    }

    fn detach(&mut self, id: SinkId) {
        let Some(detached) = self.registry.detach(id) else {
            return;
        };

        let stats = detached.sink.stats();
        tracing::debug!(
            sink_id = %id,
            bytes = stats.bytes_queued,
            chunks = stats.chunks_queued,
            duration_ms = stats.duration.as_millis() as u64,
            close_reason = ?detached.sink.close_reason(),
            "Consumer detached"
        );

        if detached.edge == Some(DemandEdge::BecameEmpty) {
            let transition = self.supervisor.on_idle();
            self.record(&transition);
        }
    }

    fn handle_encoder_event(&mut self, event: EncoderEvent) {
        match event {
            EncoderEvent::Chunk { instance, data } => {
                if !self.supervisor.accepts(instance) {
                    tracing::trace!(instance = %instance, len = data.len(), "Dropping chunk from retired encoder");
                    return;
                }

                self.stats.record_chunk(data.len());
                let outcome = multiplex::broadcast(&self.registry.snapshot(), &data);
                self.stats.slow_consumer_disconnects += outcome.slow_consumers as u64;
            }
            EncoderEvent::Exited { instance, reason } => {
                let demand = !self.registry.is_empty();
                let transition = self.supervisor.on_exit(instance, reason, demand);
                self.record(&transition);
            }
        }
    }

    fn handle_restart_timer(&mut self, ticket: u64) {
        let demand = !self.registry.is_empty();
        let transition = self.supervisor.on_restart_timer(ticket, demand);
        self.record(&transition);
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        let (sinks, _) = self.registry.drain();
        for sink in &sinks {
            sink.close(SinkCloseReason::Shutdown);
        }

        let transition = self.supervisor.on_idle();
        self.record(&transition);

        let stats = self.snapshot_stats();
        tracing::info!(
            closed_consumers = sinks.len(),
            spawns = stats.spawns,
            restarts = stats.restarts,
            bytes = stats.bytes_broadcast,
            uptime_secs = stats.uptime().as_secs(),
            "Relay shutting down"
        );
    }

    fn record(&mut self, transition: &Transition) {
        match transition {
            Transition::Spawned { restart, .. } => {
                self.stats.spawns += 1;
                if *restart {
                    self.stats.restarts += 1;
                }
            }
            Transition::SpawnFailed { .. } => self.stats.spawn_failures += 1,
            Transition::RestartScheduled { .. } => self.stats.unexpected_exits += 1,
            Transition::Terminated { .. }
            | Transition::Stopped { .. }
            | Transition::RestartCancelled
            | Transition::Ignored => {}
        }
    }

    fn snapshot_stats(&self) -> RelayStats {
        let mut stats = self.stats.clone();
        stats.active_sinks = self.registry.len() as u64;
        stats
    }
}

/// Resolves with the ticket once the pending restart is due
async fn restart_timer(pending: Option<(u64, Instant)>) -> u64 {
    match pending {
        Some((ticket, deadline)) => {
            tokio::time::sleep_until(deadline).await;
            ticket
        }
        None => std::future::pending().await,
    }
}
