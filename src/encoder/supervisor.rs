//! Encoder supervisor state machine
//!
//! Owns the single encoder instance and moves it between phases in response
//! to demand edges, exits and restart deadlines. Every transition is a
//! synchronous method call, so the whole lifecycle can be driven step by
//! step in tests without real processes or timers.
//!
//! ```text
//!              on_demand                      on_exit (demand)
//!  NotRunning ──────────► Running ─────────────────────────► RestartPending
//!      ▲                  │   ▲                                   │
//!      │  on_idle /       │   └───── on_restart_timer (demand) ───┤
//!      │  on_exit (idle)  │                                       │
//!      └──────────────────┘◄─── on_idle / on_restart_timer (idle)─┘
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use super::config::EncoderConfig;
use super::process::{EncoderEvent, EncoderHandle, ExitReason, InstanceId, Spawner};

/// Lifecycle phase of the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderPhase {
    /// No process and no restart scheduled
    NotRunning,
    /// A process has been spawned and not yet reported an exit
    Running,
    /// The process crashed with consumers attached; a restart is scheduled
    RestartPending,
}

/// What a transition did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A new instance was spawned
    Spawned {
        instance: InstanceId,
        pid: Option<u32>,
        restart: bool,
    },
    /// Spawning failed; treated as an immediate exit and a restart scheduled
    SpawnFailed {
        instance: InstanceId,
        error: String,
        retry_in: Duration,
    },
    /// The running instance was asked to terminate
    Terminated { instance: InstanceId },
    /// The instance exited with no consumers attached
    Stopped { instance: InstanceId },
    /// The instance exited with consumers attached; restart scheduled
    RestartScheduled {
        instance: InstanceId,
        reason: ExitReason,
        delay: Duration,
    },
    /// A pending restart was dropped because demand went away
    RestartCancelled,
    /// Event did not apply to the current state
    Ignored,
}

enum State<H> {
    NotRunning,
    Running { instance: InstanceId, handle: H },
    RestartPending { ticket: u64, deadline: Instant },
}

/// Owns the encoder subprocess lifecycle
pub struct Supervisor<S: Spawner> {
    config: Arc<EncoderConfig>,
    spawner: S,
    events: mpsc::Sender<EncoderEvent>,
    state: State<S::Handle>,
    next_instance: u64,
    next_ticket: u64,
}

impl<S: Spawner> Supervisor<S> {
    /// Create a supervisor in `NotRunning`
    ///
    /// Every spawned instance reports chunks and exits to `events`.
    pub fn new(config: Arc<EncoderConfig>, spawner: S, events: mpsc::Sender<EncoderEvent>) -> Self {
        Self {
            config,
            spawner,
            events,
            state: State::NotRunning,
            next_instance: 1,
            next_ticket: 1,
        }
    }

    /// Current phase
    pub fn phase(&self) -> EncoderPhase {
        match self.state {
            State::NotRunning => EncoderPhase::NotRunning,
            State::Running { .. } => EncoderPhase::Running,
            State::RestartPending { .. } => EncoderPhase::RestartPending,
        }
    }

    /// Whether an encoder instance is live
    pub fn is_running(&self) -> bool {
        self.phase() == EncoderPhase::Running
    }

    /// Id of the live instance
    pub fn instance(&self) -> Option<InstanceId> {
        match self.state {
            State::Running { instance, .. } => Some(instance),
            _ => None,
        }
    }

    /// OS pid of the live instance
    pub fn pid(&self) -> Option<u32> {
        match &self.state {
            State::Running { handle, .. } => handle.pid(),
            _ => None,
        }
    }

    /// Ticket and deadline of the pending restart
    pub fn restart_deadline(&self) -> Option<(u64, Instant)> {
        match self.state {
            State::RestartPending { ticket, deadline } => Some((ticket, deadline)),
            _ => None,
        }
    }

    /// Whether chunks from `instance` should be delivered
    pub fn accepts(&self, instance: InstanceId) -> bool {
        self.instance() == Some(instance)
    }

    /// Registry became non-empty
    pub fn on_demand(&mut self) -> Transition {
        match self.state {
            State::NotRunning => self.start(false),
            // Already running, or a restart will pick the demand up
            State::Running { .. } | State::RestartPending { .. } => Transition::Ignored,
        }
    }

    /// Registry became empty
    ///
    /// Termination is requested and the handle dropped immediately; the
    /// eventual exit event of that instance is ignored.
    pub fn on_idle(&mut self) -> Transition {
        match std::mem::replace(&mut self.state, State::NotRunning) {
            State::Running { instance, handle } => {
                tracing::info!(instance = %instance, pid = ?handle.pid(), "No consumers left, stopping encoder");
                handle.terminate();
                Transition::Terminated { instance }
            }
            State::RestartPending { ticket, .. } => {
                tracing::info!(ticket = ticket, "No consumers left, cancelling encoder restart");
                Transition::RestartCancelled
            }
            State::NotRunning => Transition::Ignored,
        }
    }

    /// An instance exited
    ///
    /// `demand` is whether the registry is currently non-empty.
    pub fn on_exit(&mut self, instance: InstanceId, reason: ExitReason, demand: bool) -> Transition {
        if !self.accepts(instance) {
            tracing::debug!(instance = %instance, reason = %reason, "Ignoring exit of retired encoder");
            return Transition::Ignored;
        }

        self.state = State::NotRunning;

        if demand {
            tracing::warn!(
                instance = %instance,
                reason = %reason,
                restart_in_ms = self.config.restart_delay.as_millis() as u64,
                "Encoder exited unexpectedly, scheduling restart"
            );
            let delay = self.schedule_restart();
            Transition::RestartScheduled {
                instance,
                reason,
                delay,
            }
        } else {
            tracing::info!(instance = %instance, reason = %reason, "Encoder exited with no consumers");
            Transition::Stopped { instance }
        }
    }

    /// The restart deadline for `ticket` passed
    pub fn on_restart_timer(&mut self, ticket: u64, demand: bool) -> Transition {
        match self.state {
            State::RestartPending { ticket: pending, .. } if pending == ticket => {}
            _ => return Transition::Ignored,
        }

        self.state = State::NotRunning;

        if demand {
            self.start(true)
        } else {
            Transition::RestartCancelled
        }
    }

    fn start(&mut self, restart: bool) -> Transition {
        let instance = InstanceId::new(self.next_instance);
        self.next_instance += 1;

        match self
            .spawner
            .spawn(instance, &self.config, self.events.clone())
        {
            Ok(handle) => {
                let pid = handle.pid();
                tracing::info!(
                    instance = %instance,
                    pid = ?pid,
                    restart = restart,
                    size = %self.config.video_size(),
                    fps = self.config.framerate,
                    bitrate = %self.config.bitrate,
                    "Encoder started"
                );
                self.state = State::Running { instance, handle };
                Transition::Spawned {
                    instance,
                    pid,
                    restart,
                }
            }
            Err(e) => {
                // Spawns only happen under demand, so this folds into the
                // crash path
                tracing::error!(instance = %instance, error = %e, "Failed to spawn encoder");
                let retry_in = self.schedule_restart();
                Transition::SpawnFailed {
                    instance,
                    error: e.to_string(),
                    retry_in,
                }
            }
        }
    }

    fn schedule_restart(&mut self) -> Duration {
        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let delay = self.config.restart_delay;
        self.state = State::RestartPending {
            ticket,
            deadline: Instant::now() + delay,
        };
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::mock::MockSpawner;

    fn supervisor() -> (Supervisor<MockSpawner>, MockSpawner) {
        let (tx, _rx) = mpsc::channel(16);
        let spawner = MockSpawner::new();
        let config = Arc::new(EncoderConfig::default());
        (Supervisor::new(config, spawner.clone(), tx), spawner)
    }

    fn crashed() -> ExitReason {
        ExitReason::Exited { code: Some(1) }
    }

    #[test]
    fn test_demand_spawns_once() {
        let (mut sup, spawner) = supervisor();
        assert_eq!(sup.phase(), EncoderPhase::NotRunning);

        let t = sup.on_demand();
        assert!(matches!(t, Transition::Spawned { restart: false, .. }));
        assert_eq!(sup.phase(), EncoderPhase::Running);

        // Repeated demand while running does not spawn again
        assert_eq!(sup.on_demand(), Transition::Ignored);
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[test]
    fn test_spawn_uses_config_args() {
        let (mut sup, spawner) = supervisor();
        sup.on_demand();

        let spawned = spawner.spawned();
        assert_eq!(spawned[0].args, EncoderConfig::default().args());
        assert!(spawned[0].args.contains(&"1920x1080".to_string()));
    }

    #[test]
    fn test_idle_terminates_without_restart() {
        let (mut sup, spawner) = supervisor();
        sup.on_demand();
        let instance = sup.instance().unwrap();

        assert_eq!(sup.on_idle(), Transition::Terminated { instance });
        assert_eq!(sup.phase(), EncoderPhase::NotRunning);
        assert!(sup.restart_deadline().is_none());
        assert_eq!(spawner.terminated(), vec![instance]);
    }

    #[test]
    fn test_late_exit_after_teardown_is_noop() {
        let (mut sup, _spawner) = supervisor();
        sup.on_demand();
        let old = sup.instance().unwrap();
        sup.on_idle();

        // Rapid re-attach spawns a fresh instance before the old exit lands
        sup.on_demand();
        let new = sup.instance().unwrap();
        assert_ne!(old, new);

        assert_eq!(sup.on_exit(old, ExitReason::Exited { code: None }, true), Transition::Ignored);
        assert_eq!(sup.phase(), EncoderPhase::Running);
        assert_eq!(sup.instance(), Some(new));
    }

    #[test]
    fn test_new_instance_after_cycle_is_distinct() {
        let (mut sup, spawner) = supervisor();
        sup.on_demand();
        let first_pid = sup.pid();
        sup.on_idle();
        sup.on_demand();

        assert_ne!(sup.pid(), first_pid);
        assert_eq!(spawner.spawn_count(), 2);
    }

    #[test]
    fn test_exit_without_demand_does_not_restart() {
        let (mut sup, _spawner) = supervisor();
        sup.on_demand();
        let instance = sup.instance().unwrap();

        assert_eq!(sup.on_exit(instance, crashed(), false), Transition::Stopped { instance });
        assert_eq!(sup.phase(), EncoderPhase::NotRunning);
        assert!(sup.restart_deadline().is_none());
    }

    #[test]
    fn test_crash_with_demand_schedules_one_restart() {
        let (mut sup, spawner) = supervisor();
        sup.on_demand();
        let instance = sup.instance().unwrap();

        let t = sup.on_exit(instance, crashed(), true);
        assert_eq!(
            t,
            Transition::RestartScheduled {
                instance,
                reason: crashed(),
                delay: Duration::from_millis(1000),
            }
        );
        assert_eq!(sup.phase(), EncoderPhase::RestartPending);
        assert!(!sup.is_running());

        let (ticket, _) = sup.restart_deadline().unwrap();
        let t = sup.on_restart_timer(ticket, true);
        assert!(matches!(t, Transition::Spawned { restart: true, .. }));

        // Same ticket firing twice does nothing
        assert_eq!(sup.on_restart_timer(ticket, true), Transition::Ignored);
        assert_eq!(spawner.spawn_count(), 2);

        let spawned = spawner.spawned();
        assert_eq!(spawned[0].args, spawned[1].args);
    }

    #[test]
    fn test_restart_timer_without_demand() {
        let (mut sup, spawner) = supervisor();
        sup.on_demand();
        let instance = sup.instance().unwrap();
        sup.on_exit(instance, crashed(), true);

        let (ticket, _) = sup.restart_deadline().unwrap();
        assert_eq!(sup.on_restart_timer(ticket, false), Transition::RestartCancelled);
        assert_eq!(sup.phase(), EncoderPhase::NotRunning);
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[test]
    fn test_idle_cancels_pending_restart() {
        let (mut sup, spawner) = supervisor();
        sup.on_demand();
        let instance = sup.instance().unwrap();
        sup.on_exit(instance, crashed(), true);
        let (ticket, _) = sup.restart_deadline().unwrap();

        assert_eq!(sup.on_idle(), Transition::RestartCancelled);
        assert!(sup.restart_deadline().is_none());

        // A stale timer for the cancelled restart is ignored
        assert_eq!(sup.on_restart_timer(ticket, true), Transition::Ignored);
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[test]
    fn test_spawn_failure_folds_into_restart() {
        let (mut sup, spawner) = supervisor();
        spawner.fail_next_spawns(1);

        let t = sup.on_demand();
        assert!(matches!(t, Transition::SpawnFailed { .. }));
        assert_eq!(sup.phase(), EncoderPhase::RestartPending);

        let (ticket, _) = sup.restart_deadline().unwrap();
        assert!(matches!(
            sup.on_restart_timer(ticket, true),
            Transition::Spawned { restart: true, .. }
        ));
        assert_eq!(sup.phase(), EncoderPhase::Running);
    }

    #[test]
    fn test_demand_during_restart_pending_waits_for_timer() {
        let (mut sup, spawner) = supervisor();
        sup.on_demand();
        let instance = sup.instance().unwrap();
        sup.on_exit(instance, crashed(), true);

        assert_eq!(sup.on_demand(), Transition::Ignored);
        assert_eq!(sup.phase(), EncoderPhase::RestartPending);
        assert_eq!(spawner.spawn_count(), 1);
    }
}
