//! Server configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 8090;

/// Default per-consumer backlog cap (8 MiB)
pub const DEFAULT_MAX_PENDING_BYTES: usize = 8 * 1024 * 1024;

/// HTTP server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Bytes a consumer may fall behind before it is disconnected (0 = unlimited)
    pub max_pending_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            max_pending_bytes: DEFAULT_MAX_PENDING_BYTES,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the per-consumer backlog cap
    pub fn max_pending_bytes(mut self, bytes: usize) -> Self {
        self.max_pending_bytes = bytes;
        self
    }
}
