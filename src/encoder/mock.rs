//! Mock encoder spawner for testing without ffmpeg or a display.
//!
//! Records every spawn and termination, can be told to fail spawns, and
//! lets tests play the part of the encoder by injecting chunks and exits
//! for a given instance.
//!
//! # Example
//!
//! ```
//! use encoder_relay::encoder::{MockSpawner, Spawner, EncoderConfig, InstanceId};
//!
//! # #[tokio::main] async fn main() {
//! let mut spawner = MockSpawner::new();
//! let (tx, mut rx) = tokio::sync::mpsc::channel(8);
//!
//! let _handle = spawner
//!     .spawn(InstanceId::new(1), &EncoderConfig::default(), tx)
//!     .unwrap();
//! assert!(spawner.emit_chunk(InstanceId::new(1), &b"webm"[..]).await);
//! assert!(rx.recv().await.is_some());
//! # }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::config::EncoderConfig;
use super::error::EncoderError;
use super::process::{EncoderEvent, EncoderHandle, ExitReason, InstanceId, Spawner};

/// Base for fake pids
const MOCK_PID_BASE: u32 = 40_000;

/// Record of one spawn
#[derive(Debug, Clone)]
pub struct MockSpawn {
    pub instance: InstanceId,
    pub pid: u32,
    pub args: Vec<String>,
    events: mpsc::Sender<EncoderEvent>,
}

#[derive(Debug, Default)]
struct MockState {
    spawned: Vec<MockSpawn>,
    terminated: Vec<InstanceId>,
    fail_next: usize,
}

/// Spawner that creates no processes
#[derive(Debug, Clone, Default)]
pub struct MockSpawner {
    state: Arc<Mutex<MockState>>,
}

impl MockSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the recorded history
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `n` spawns fail as if the binary were missing
    pub fn fail_next_spawns(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Number of successful spawns
    pub fn spawn_count(&self) -> usize {
        self.lock().spawned.len()
    }

    /// All successful spawns, oldest first
    pub fn spawned(&self) -> Vec<MockSpawn> {
        self.lock().spawned.clone()
    }

    /// Most recent successful spawn
    pub fn last_instance(&self) -> Option<InstanceId> {
        self.lock().spawned.last().map(|s| s.instance)
    }

    /// Instances that were asked to terminate, in order
    pub fn terminated(&self) -> Vec<InstanceId> {
        self.lock().terminated.clone()
    }

    fn events_for(&self, instance: InstanceId) -> Option<mpsc::Sender<EncoderEvent>> {
        self.lock()
            .spawned
            .iter()
            .find(|s| s.instance == instance)
            .map(|s| s.events.clone())
    }

    /// Emit a chunk as `instance`; `false` if unknown or the relay is gone
    pub async fn emit_chunk(&self, instance: InstanceId, data: impl Into<Bytes>) -> bool {
        let Some(events) = self.events_for(instance) else {
            return false;
        };
        events
            .send(EncoderEvent::Chunk {
                instance,
                data: data.into(),
            })
            .await
            .is_ok()
    }

    /// Emit an exit as `instance`
    pub async fn emit_exit(&self, instance: InstanceId, reason: ExitReason) -> bool {
        let Some(events) = self.events_for(instance) else {
            return false;
        };
        events
            .send(EncoderEvent::Exited { instance, reason })
            .await
            .is_ok()
    }
}

impl Spawner for MockSpawner {
    type Handle = MockProcess;

    fn spawn(
        &mut self,
        instance: InstanceId,
        config: &EncoderConfig,
        events: mpsc::Sender<EncoderEvent>,
    ) -> Result<MockProcess, EncoderError> {
        let mut state = self.lock();

        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(EncoderError::Spawn {
                program: config.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "mock spawn failure"),
            });
        }

        let pid = MOCK_PID_BASE + instance.get() as u32;
        state.spawned.push(MockSpawn {
            instance,
            pid,
            args: config.args(),
            events,
        });

        Ok(MockProcess {
            instance,
            pid,
            state: Arc::clone(&self.state),
        })
    }
}

/// Handle returned by [`MockSpawner`]
#[derive(Debug)]
pub struct MockProcess {
    instance: InstanceId,
    pid: u32,
    state: Arc<Mutex<MockState>>,
}

impl EncoderHandle for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn terminate(self) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .terminated
            .push(self.instance);
    }
}
