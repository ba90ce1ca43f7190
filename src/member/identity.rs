use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::config_error;
use crate::error::Result;

/// Address triple identifying a cluster member: the IP plus the ports of
/// its gossip and data channels.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct MemberIdentity {
    ip: String,
    gossip_port: u16,
    data_port: u16,
}

impl MemberIdentity {
    pub fn new(ip: impl Into<String>, gossip_port: u16, data_port: u16) -> Self {
        Self {
            ip: ip.into(),
            gossip_port,
            data_port,
        }
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn gossip_port(&self) -> u16 {
        self.gossip_port
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    /// Cluster-wide key: `ip:gossip_port:data_port`
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.ip, self.gossip_port, self.data_port)
    }

    pub fn gossip_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.ip_addr()?, self.gossip_port))
    }

    pub fn data_addr(&self) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.ip_addr()?, self.data_port))
    }

    fn ip_addr(&self) -> Result<IpAddr> {
        self.ip
            .parse::<IpAddr>()
            .map_err(|e| config_error!("Invalid member ip {}: {}", self.ip, e))
    }
}

impl std::fmt::Display for MemberIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.ip, self.gossip_port, self.data_port)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum MemberStatus {
    Unknown,
    Alive,
    Failed,
    Left,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Unknown => write!(f, "unknown"),
            MemberStatus::Alive => write!(f, "alive"),
            MemberStatus::Failed => write!(f, "failed"),
            MemberStatus::Left => write!(f, "left"),
        }
    }
}
