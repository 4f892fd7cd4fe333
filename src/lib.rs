//! # encoder-relay
//!
//! A demand-driven live encoder relay. One ffmpeg process captures an X11
//! display and writes a WebM stream to stdout; the relay fans that stream out
//! to every HTTP consumer of `GET /stream`.
//!
//! The encoder only runs while someone is watching. The first consumer starts
//! it, the last one to leave stops it, and a crash while consumers are
//! attached is followed by a restart after a fixed delay.
//!
//! ## Layout
//!
//! - [`registry`]: attached consumers and the demand edges they produce
//! - [`encoder`]: subprocess spawning, stderr monitoring and the supervisor
//! - [`relay`]: the single event loop and the broadcast multiplexer
//! - [`server`]: the HTTP surface
//! - [`config`]: environment configuration
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use encoder_relay::{encoder::FfmpegSpawner, relay::Relay, server::HttpServer, RelayConfig};
//!
//! # async fn run() -> encoder_relay::Result<()> {
//! let config = RelayConfig::from_env();
//! let (relay, handle) = Relay::new(Arc::new(config.encoder), FfmpegSpawner::new());
//! tokio::spawn(relay.run());
//!
//! HttpServer::new(config.server, handle)
//!     .run_until(async { let _ = tokio::signal::ctrl_c().await; })
//!     .await
//! # }
//! ```

pub mod config;
pub mod encoder;
pub mod error;
pub mod registry;
pub mod relay;
pub mod server;
pub mod stats;

pub use config::RelayConfig;
pub use error::{Error, Result};
pub use relay::{Relay, RelayHandle};
pub use server::{HttpServer, ServerConfig};
