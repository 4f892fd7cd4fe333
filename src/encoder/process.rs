//! Encoder subprocess plumbing
//!
//! [`Spawner`] is the seam between the supervisor and the operating system.
//! [`FfmpegSpawner`] launches the real encoder; tests use
//! [`MockSpawner`](super::mock::MockSpawner).
//!
//! Each spawned process gets a pump task that owns the `Child`. The pump
//! forwards stdout as [`EncoderEvent::Chunk`] and then reports exactly one
//! [`EncoderEvent::Exited`], always after the last chunk.

use std::process::Stdio;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

use super::config::EncoderConfig;
use super::error::EncoderError;
use super::monitor::FfmpegMonitor;

/// Read buffer size for encoder stdout
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Identifies one spawned encoder instance
///
/// Fresh for every spawn, so events from a torn-down process can be told
/// apart from those of its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "encoder-{}", self.0)
    }
}

/// How an encoder instance ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Process exited; `None` when killed by a signal
    Exited { code: Option<i32> },
    /// Process could not be spawned
    SpawnFailed(String),
    /// Waiting on the process failed
    WaitFailed(String),
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Exited { code: Some(code) } => write!(f, "exited with status {}", code),
            ExitReason::Exited { code: None } => write!(f, "terminated by signal"),
            ExitReason::SpawnFailed(e) => write!(f, "spawn failed: {}", e),
            ExitReason::WaitFailed(e) => write!(f, "wait failed: {}", e),
        }
    }
}

/// Event emitted by a running encoder instance
#[derive(Debug, Clone)]
pub enum EncoderEvent {
    /// A chunk of encoded output, in stdout order
    Chunk { instance: InstanceId, data: Bytes },
    /// The instance is gone; no further chunks follow
    Exited {
        instance: InstanceId,
        reason: ExitReason,
    },
}

/// Handle to a live encoder instance
pub trait EncoderHandle: Send + 'static {
    /// OS process id, when known
    fn pid(&self) -> Option<u32>;

    /// Request graceful termination without waiting for it
    fn terminate(self);
}

/// Creates encoder instances
pub trait Spawner: Send + 'static {
    type Handle: EncoderHandle;

    /// Start an instance that reports to `events`
    fn spawn(
        &mut self,
        instance: InstanceId,
        config: &EncoderConfig,
        events: mpsc::Sender<EncoderEvent>,
    ) -> Result<Self::Handle, EncoderError>;
}

/// Spawns the real ffmpeg process
#[derive(Debug, Default, Clone)]
pub struct FfmpegSpawner;

impl FfmpegSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl Spawner for FfmpegSpawner {
    type Handle = FfmpegProcess;

    fn spawn(
        &mut self,
        instance: InstanceId,
        config: &EncoderConfig,
        events: mpsc::Sender<EncoderEvent>,
    ) -> Result<FfmpegProcess, EncoderError> {
        let args = config.args();
        tracing::debug!(instance = %instance, program = %config.program, args = ?args, "Spawning encoder");

        let mut child = Command::new(&config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                program: config.program.clone(),
                source,
            })?;

        let pid = child.id();
        let stdout = child.stdout.take().ok_or(EncoderError::MissingStdout)?;

        if let Some(stderr) = child.stderr.take() {
            FfmpegMonitor::start(stderr, Some(config.bitrate.clone()), instance.to_string());
        }

        let (terminate_tx, terminate_rx) = oneshot::channel();
        tokio::spawn(pump(
            instance,
            child,
            stdout,
            events,
            terminate_rx,
            config.kill_timeout,
        ));

        Ok(FfmpegProcess {
            pid,
            terminate_tx: Some(terminate_tx),
        })
    }
}

/// Handle to a spawned ffmpeg process
///
/// Dropping the handle requests termination just like [`terminate`].
///
/// [`terminate`]: EncoderHandle::terminate
#[derive(Debug)]
pub struct FfmpegProcess {
    pid: Option<u32>,
    terminate_tx: Option<oneshot::Sender<()>>,
}

impl EncoderHandle for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(mut self) {
        if let Some(tx) = self.terminate_tx.take() {
            // The pump may already have seen the process exit
            let _ = tx.send(());
        }
    }
}

/// Owns the child until it exits, then reports the exit
async fn pump(
    instance: InstanceId,
    mut child: Child,
    stdout: ChildStdout,
    events: mpsc::Sender<EncoderEvent>,
    mut terminate_rx: oneshot::Receiver<()>,
    kill_timeout: Duration,
) {
    let reader = tokio::spawn(read_stdout(instance, stdout, events.clone()));

    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut terminate_rx => terminate(&mut child, instance, kill_timeout).await,
    };

    // stdout hits EOF once the process is gone; join so the exit is ordered
    // after every chunk
    if let Err(e) = reader.await {
        tracing::warn!(instance = %instance, error = %e, "Encoder stdout reader panicked");
    }

    let reason = match status {
        Ok(status) => ExitReason::Exited {
            code: status.code(),
        },
        Err(e) => ExitReason::WaitFailed(e.to_string()),
    };

    tracing::debug!(instance = %instance, reason = %reason, "Encoder process ended");
    let _ = events.send(EncoderEvent::Exited { instance, reason }).await;
}

async fn read_stdout(
    instance: InstanceId,
    mut stdout: ChildStdout,
    events: mpsc::Sender<EncoderEvent>,
) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

    loop {
        buf.reserve(READ_CHUNK_SIZE);
        match stdout.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let data = buf.split().freeze();
                if events
                    .send(EncoderEvent::Chunk { instance, data })
                    .await
                    .is_err()
                {
                    // Relay is gone
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(instance = %instance, error = %e, "Failed to read encoder output");
                break;
            }
        }
    }
}

/// Graceful stop, escalating to a kill after `kill_timeout` (if non-zero)
async fn terminate(
    child: &mut Child,
    instance: InstanceId,
    kill_timeout: Duration,
) -> std::io::Result<std::process::ExitStatus> {
    tracing::info!(instance = %instance, pid = ?child.id(), "Terminating encoder");
    send_sigterm(child);

    if kill_timeout.is_zero() {
        return child.wait().await;
    }

    match tokio::time::timeout(kill_timeout, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(
                instance = %instance,
                timeout_ms = kill_timeout.as_millis() as u64,
                "Encoder did not terminate gracefully, forcing kill"
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(pid = pid, error = %e, "SIGTERM failed");
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    // No SIGTERM outside unix
    let _ = child.start_kill();
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use super::*;

    /// Write an executable script that ignores the ffmpeg arguments
    fn fake_encoder(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "encoder-relay-{}-{}.sh",
            name,
            std::process::id()
        ));
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config_for(path: &PathBuf) -> EncoderConfig {
        EncoderConfig::default()
            .program(path.to_string_lossy())
            .kill_timeout(Duration::from_secs(2))
    }

    async fn collect(rx: &mut mpsc::Receiver<EncoderEvent>) -> (Vec<u8>, ExitReason) {
        let mut output = Vec::new();
        loop {
            match rx.recv().await {
                Some(EncoderEvent::Chunk { data, .. }) => output.extend_from_slice(&data),
                Some(EncoderEvent::Exited { reason, .. }) => return (output, reason),
                None => panic!("pump dropped without an exit event"),
            }
        }
    }

    #[test]
    fn test_exit_reason_display() {
        assert_eq!(
            ExitReason::Exited { code: Some(1) }.to_string(),
            "exited with status 1"
        );
        assert_eq!(
            ExitReason::Exited { code: None }.to_string(),
            "terminated by signal"
        );
    }

    #[test]
    fn test_instance_display() {
        assert_eq!(InstanceId::new(3).to_string(), "encoder-3");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let (tx, _rx) = mpsc::channel(8);
        let config = EncoderConfig::default().program("/nonexistent/encoder-binary");

        let result = FfmpegSpawner::new().spawn(InstanceId::new(1), &config, tx);
        assert!(matches!(result, Err(EncoderError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_output_then_exit_status() {
        let script = fake_encoder("exit", "printf 'webm-bytes'; exit 3");
        let (tx, mut rx) = mpsc::channel(8);

        let handle = FfmpegSpawner::new()
            .spawn(InstanceId::new(2), &config_for(&script), tx)
            .unwrap();
        assert!(handle.pid().is_some());

        let (output, reason) = collect(&mut rx).await;
        assert_eq!(output, b"webm-bytes");
        assert_eq!(reason, ExitReason::Exited { code: Some(3) });

        let _ = std::fs::remove_file(script);
    }

    #[tokio::test]
    async fn test_terminate_reports_exit() {
        let script = fake_encoder("sleep", "printf 'x'; exec sleep 30");
        let (tx, mut rx) = mpsc::channel(8);

        let handle = FfmpegSpawner::new()
            .spawn(InstanceId::new(9), &config_for(&script), tx)
            .unwrap();

        // Wait for the first chunk so the script is past its printf
        match rx.recv().await {
            Some(EncoderEvent::Chunk { instance, .. }) => assert_eq!(instance, InstanceId::new(9)),
            other => panic!("expected a chunk, got {:?}", other),
        }

        handle.terminate();

        let (_, reason) = collect(&mut rx).await;
        // SIGTERM kills `sleep`, so there is no exit code
        assert_eq!(reason, ExitReason::Exited { code: None });

        let _ = std::fs::remove_file(script);
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        // The shell ignores SIGTERM and `exec` keeps the disposition for sleep
        let script = fake_encoder("stubborn", "trap '' TERM; printf 'x'; exec sleep 30");
        let config = config_for(&script).kill_timeout(Duration::from_millis(300));
        let (tx, mut rx) = mpsc::channel(8);

        let handle = FfmpegSpawner::new()
            .spawn(InstanceId::new(4), &config, tx)
            .unwrap();
        assert!(matches!(rx.recv().await, Some(EncoderEvent::Chunk { .. })));

        let started = std::time::Instant::now();
        handle.terminate();

        let (_, reason) = collect(&mut rx).await;
        let elapsed = started.elapsed();
        assert_eq!(reason, ExitReason::Exited { code: None });
        assert!(elapsed >= Duration::from_millis(300), "killed after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "killed after {:?}", elapsed);

        let _ = std::fs::remove_file(script);
    }

    #[tokio::test]
    async fn test_zero_kill_timeout_sends_single_signal() {
        let script = fake_encoder(
            "graceful",
            "trap 'exit 7' TERM; printf 'x'; while :; do sleep 0.1; done",
        );
        let config = config_for(&script).kill_timeout(Duration::ZERO);
        let (tx, mut rx) = mpsc::channel(8);

        let handle = FfmpegSpawner::new()
            .spawn(InstanceId::new(5), &config, tx)
            .unwrap();
        assert!(matches!(rx.recv().await, Some(EncoderEvent::Chunk { .. })));

        handle.terminate();

        // Exit status comes from the trap, so no SIGKILL was sent
        let (_, reason) = collect(&mut rx).await;
        assert_eq!(reason, ExitReason::Exited { code: Some(7) });

        let _ = std::fs::remove_file(script);
    }
}
