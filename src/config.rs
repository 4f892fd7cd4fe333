//! Relay configuration from the environment
//!
//! Every setting has a default; unset variables keep it, and values that do
//! not parse are logged and ignored.

use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::encoder::EncoderConfig;
use crate::server::ServerConfig;

/// Complete relay configuration
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub encoder: EncoderConfig,
}

impl RelayConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RelayConfig::default();
        let env = Lookup(lookup);

        // Server
        let mut host = config.server.bind_addr.ip();
        let mut port = config.server.bind_addr.port();
        env.parse_into("STREAM_HOST", &mut host);
        env.parse_into("STREAM_PORT", &mut port);
        config.server.bind_addr = SocketAddr::new(host, port);
        env.parse_into("STREAM_MAX_PENDING_BYTES", &mut config.server.max_pending_bytes);

        // Encoder
        let encoder = &mut config.encoder;
        env.string_into("FFMPEG_BIN", &mut encoder.program);
        env.string_into("DISPLAY", &mut encoder.display);
        env.positive_into("STREAM_WIDTH", &mut encoder.width);
        env.positive_into("STREAM_HEIGHT", &mut encoder.height);
        env.positive_into("STREAM_FPS", &mut encoder.framerate);
        env.string_into("STREAM_BITRATE", &mut encoder.bitrate);
        env.string_into("STREAM_MAXRATE", &mut encoder.maxrate);
        env.string_into("STREAM_BUFSIZE", &mut encoder.bufsize);
        env.string_into("STREAM_CODEC", &mut encoder.codec);
        env.string_into("STREAM_DEADLINE", &mut encoder.deadline);
        env.parse_into("STREAM_CPU_USED", &mut encoder.cpu_used);
        env.positive_into("STREAM_THREADS", &mut encoder.threads);
        env.string_into("STREAM_FFMPEG_LOGLEVEL", &mut encoder.loglevel);
        env.millis_into("STREAM_RESTART_DELAY_MS", &mut encoder.restart_delay);
        env.millis_into("STREAM_KILL_TIMEOUT_MS", &mut encoder.kill_timeout);

        config
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string_into(&self, key: &str, target: &mut String) {
        if let Some(value) = self.get(key) {
            *target = value;
        }
    }

    fn parse_into<T>(&self, key: &str, target: &mut T)
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(value) = self.get(key) {
            match value.parse() {
                Ok(v) => *target = v,
                Err(e) => {
                    tracing::warn!(key = key, value = %value, error = %e, "Ignoring invalid setting");
                }
            }
        }
    }

    fn positive_into(&self, key: &str, target: &mut u32) {
        let mut value = *target;
        self.parse_into(key, &mut value);
        if value == 0 {
            tracing::warn!(key = key, "Ignoring zero setting");
        } else {
            *target = value;
        }
    }

    fn millis_into(&self, key: &str, target: &mut Duration) {
        let mut millis = target.as_millis() as u64;
        self.parse_into(key, &mut millis);
        *target = Duration::from_millis(millis);
    }
}

/// Resolved bind host, for logging
pub fn describe_bind(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => format!("http://localhost:{}", addr.port()),
        _ => format!("http://{}", addr),
    }
}
