//! Member transport settings
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config_error;
use crate::error::Result;
use crate::member::MemberIdentity;
use crate::transport::ChannelRole;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STANDARD_PORT_GOSSIP: u16 = 9090;
pub const DEFAULT_PORT_GOSSIP: &str = "9090";
pub const STANDARD_PORT_DATA: u16 = 9091;
pub const DEFAULT_PORT_DATA: &str = "9091";

pub const DEFAULT_BACKLOG: u32 = 128;
pub const DEFAULT_ACCEPTOR_THREADS: usize = 1;
pub const DEFAULT_WORKER_THREADS: usize = 2;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Settings {
    // Address both channel servers bind to
    pub listen_address: String,

    // TCP port for the gossip channel
    pub gossip_port: u16,

    // TCP port for the data channel
    pub data_port: u16,

    // Accept queue depth for both listening sockets
    pub backlog: u32,

    // SO_KEEPALIVE on accepted connections
    pub keepalive: bool,

    // Threads per channel accepting new connections
    pub acceptor_threads: usize,

    // Threads per channel servicing connection I/O and decoding
    pub worker_threads: usize,

    // Upper bound on each graceful shutdown step
    pub shutdown_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            gossip_port: STANDARD_PORT_GOSSIP,
            data_port: STANDARD_PORT_DATA,
            backlog: DEFAULT_BACKLOG,
            keepalive: true,
            acceptor_threads: DEFAULT_ACCEPTOR_THREADS,
            worker_threads: DEFAULT_WORKER_THREADS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl Settings {
    /// Settings for an ephemeral loopback member, used by tests and demos
    pub fn loopback() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            gossip_port: 0,
            data_port: 0,
            ..Self::default()
        }
    }

    pub fn identity(&self) -> MemberIdentity {
        MemberIdentity::new(self.listen_address.clone(), self.gossip_port, self.data_port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn channel_config(&self, role: ChannelRole) -> ChannelConfig {
        let port = match role {
            ChannelRole::Gossip => self.gossip_port,
            ChannelRole::Data => self.data_port,
        };
        ChannelConfig {
            role,
            listen_address: self.listen_address.clone(),
            port,
            backlog: self.backlog,
            keepalive: self.keepalive,
            acceptor_threads: self.acceptor_threads,
            worker_threads: self.worker_threads,
            shutdown_timeout: self.shutdown_timeout(),
        }
    }

    /// Reject settings the servers cannot run with.
    ///
    /// Port 0 is allowed for both channels (ephemeral ports); otherwise the
    /// two channels must not share a port.
    pub fn validate(&self) -> Result<()> {
        self.listen_address
            .parse::<std::net::IpAddr>()
            .map_err(|e| config_error!("Invalid listen address {}: {}", self.listen_address, e))?;
        if self.gossip_port != 0 && self.gossip_port == self.data_port {
            return Err(config_error!(
                "Gossip and data channels cannot share port {}",
                self.gossip_port
            ));
        }
        if self.backlog == 0 {
            return Err(config_error!("Backlog must be at least 1"));
        }
        if self.acceptor_threads == 0 || self.worker_threads == 0 {
            return Err(config_error!("Thread pool sizes must be at least 1"));
        }
        Ok(())
    }
}

/// Per-channel server configuration. Each channel gets its own copy so
/// the gossip and data pools never share threads.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub role: ChannelRole,
    pub listen_address: String,
    pub port: u16,
    pub backlog: u32,
    pub keepalive: bool,
    pub acceptor_threads: usize,
    pub worker_threads: usize,
    pub shutdown_timeout: Duration,
}
