use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8000;

/// Settings for a [`HeartbeatServer`](crate::HeartbeatServer)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub addr: SocketAddr,
    /// Pause between two heartbeat lines on one connection
    pub interval: Duration,
    /// How long shutdown waits for open connections to say goodbye
    pub shutdown_timeout: Duration,
    /// Request head bytes read before the stream starts regardless
    pub max_request_head: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            max_request_head: 8 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_request_head(mut self, bytes: usize) -> Self {
        self.max_request_head = bytes;
        self
    }
}
