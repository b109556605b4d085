//! Cluster bootstrap configuration and protocol tunables.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::types::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read cluster file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid port on line {line}: {text:?}")]
    InvalidPort { line: usize, text: String },
}

/// Where this node listens and who its peers are. The cluster file holds
/// one listen port per line; every node is addressed as 127.0.0.1:port and
/// identified by the port.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub listen_addr: SocketAddr,
    pub peers: Vec<SocketAddr>,
}

impl ClusterConfig {
    pub fn from_ports(self_port: u16, ports: impl IntoIterator<Item = u16>) -> Self {
        let mut peers: Vec<SocketAddr> = ports
            .into_iter()
            .filter(|port| *port != self_port)
            .map(|port| SocketAddr::from(([127, 0, 0, 1], port)))
            .collect();
        peers.sort();
        peers.dedup();
        ClusterConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], self_port)),
            peers,
        }
    }

    /// Parse the cluster file. Blank lines are skipped; anything else must
    /// be a bare port number.
    pub fn load(path: impl AsRef<Path>, self_port: u16) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut ports = Vec::new();
        for (idx, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let port: u16 = line.parse().map_err(|_| ConfigError::InvalidPort {
                line: idx + 1,
                text: line.to_owned(),
            })?;
            ports.push(port);
        }
        Ok(Self::from_ports(self_port, ports))
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_addr(self.listen_addr)
    }
}

/// Protocol timing and retry knobs. Production defaults below; tests swap
/// in millisecond-scale values so stall scenarios finish quickly.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Per-peer deadline for one Invalidate RPC within a broadcast round.
    pub message_loss_timeout: Duration,
    /// How long a key may sit INVALID (or a write may stall) before the
    /// node self-promotes and replays.
    pub replay_timeout: Duration,
    /// Broadcast rounds a single write may attempt before giving up.
    pub write_budget: u32,
    /// First retry delay; doubles per round up to the cap.
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
    /// Failure detector probe cadence and per-probe deadline.
    pub heartbeat_period: Duration,
    pub heartbeat_deadline: Duration,
    /// Consecutive missed heartbeats before a peer is declared dead.
    pub failure_threshold: u32,
    /// How often sealed log segments are folded into the snapshot store.
    pub snapshot_interval: Duration,
    /// Independent log writers; keys are hashed across them.
    pub wal_partitions: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            message_loss_timeout: Duration::from_secs(1),
            replay_timeout: Duration::from_secs(1),
            write_budget: 5,
            retry_backoff_base: Duration::from_millis(50),
            retry_backoff_cap: Duration::from_secs(1),
            heartbeat_period: Duration::from_millis(500),
            heartbeat_deadline: Duration::from_millis(150),
            failure_threshold: 3,
            snapshot_interval: Duration::from_secs(120),
            wal_partitions: 1,
        }
    }
}
