//! Upstream encoder management
//!
//! This module provides:
//! - Encoder configuration and argument construction
//! - The subprocess seam ([`Spawner`]) with the real ffmpeg implementation
//! - stderr monitoring
//! - The demand-driven supervisor state machine
//! - A mock spawner for tests

pub mod config;
pub mod error;
pub mod mock;
pub mod monitor;
pub mod process;
pub mod supervisor;

pub use config::EncoderConfig;
pub use error::EncoderError;
pub use mock::{MockProcess, MockSpawn, MockSpawner};
pub use process::{
    EncoderEvent, EncoderHandle, ExitReason, FfmpegProcess, FfmpegSpawner, InstanceId, Spawner,
};
pub use supervisor::{EncoderPhase, Supervisor, Transition};
