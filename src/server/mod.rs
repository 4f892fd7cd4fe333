//! HTTP server
//!
//! Accepts consumer connections and exposes the stream and health endpoints.

pub mod config;
pub mod http;
pub mod listener;

pub use config::ServerConfig;
pub use listener::HttpServer;
