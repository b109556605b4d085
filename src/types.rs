use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Identifier of a cluster node, derived from its listen port so that ids
/// stay stable across restarts and deterministic across the cluster.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    rkyv::Archive,
    rkyv::Deserialize,
    rkyv::Serialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, PartialEq))]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn from_addr(addr: SocketAddr) -> Self {
        NodeId(u32::from(addr.port()))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lamport-style write timestamp. Orders totally: logical time first, node
/// id breaks ties, so concurrent writes from different coordinators never
/// compare equal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
    rkyv::Archive,
    rkyv::Deserialize,
    rkyv::Serialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug, PartialEq))]
pub struct Timestamp {
    pub logical_time: u32,
    pub node_id: NodeId,
}

impl Timestamp {
    /// Initial timestamp a node assigns when it first materializes a key.
    pub fn zero(node_id: NodeId) -> Self {
        Timestamp {
            logical_time: 0,
            node_id,
        }
    }

    /// Advance for a new coordinated write: one logical tick, stamped with
    /// the coordinating node.
    pub fn advance(&mut self, node_id: NodeId) {
        self.logical_time += 1;
        self.node_id = node_id;
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id, self.logical_time)
    }
}

/// Coherence state of one key's local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueState {
    /// Local copy is authoritative; reads and writes may proceed.
    Valid,
    /// Superseded by a higher-timestamp write elsewhere; callers stall.
    Invalid,
    /// This node is coordinating a write; the value is provisional.
    Write,
    /// Stall timed out without a Validate; about to self-promote.
    Replay,
}

/// Every request and response exchanged between nodes (and by clients).
#[derive(rkyv::Archive, rkyv::Deserialize, rkyv::Serialize, Debug, Clone)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug))]
pub enum ClusterMessage {
    // Client surface
    ReadRequest {
        key: String,
    },
    ReadResponse {
        /// `None` means the key does not exist on this node.
        value: Option<String>,
    },
    WriteRequest {
        key: String,
        value: String,
    },
    WriteAck,
    /// The node refused a client request because it has been terminated.
    Unavailable,

    // Hermes protocol surface
    Invalidate {
        key: String,
        value: String,
        ts: Timestamp,
        epoch: u32,
        /// Correlates acks to one broadcast attempt; acks for abandoned
        /// rounds are discarded by the collector.
        round: Uuid,
    },
    InvalidateAck {
        round: Uuid,
        accept: bool,
        responder: NodeId,
    },
    Validate {
        key: String,
        ts: Timestamp,
    },
    ValidateAck,

    // Membership surface
    Mayday {
        failed: NodeId,
        epoch: u32,
    },
    MaydayAck,
    Heartbeat,
    HeartbeatAck,
    Terminate {
        graceful: bool,
    },
    TerminateAck,
}

impl ClusterMessage {
    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterMessage::ReadRequest { .. } => "ReadRequest",
            ClusterMessage::ReadResponse { .. } => "ReadResponse",
            ClusterMessage::WriteRequest { .. } => "WriteRequest",
            ClusterMessage::WriteAck => "WriteAck",
            ClusterMessage::Unavailable => "Unavailable",
            ClusterMessage::Invalidate { .. } => "Invalidate",
            ClusterMessage::InvalidateAck { .. } => "InvalidateAck",
            ClusterMessage::Validate { .. } => "Validate",
            ClusterMessage::ValidateAck => "ValidateAck",
            ClusterMessage::Mayday { .. } => "Mayday",
            ClusterMessage::MaydayAck => "MaydayAck",
            ClusterMessage::Heartbeat => "Heartbeat",
            ClusterMessage::HeartbeatAck => "HeartbeatAck",
            ClusterMessage::Terminate { .. } => "Terminate",
            ClusterMessage::TerminateAck => "TerminateAck",
        }
    }
}

/// Errors surfaced to clients of a node. Protocol-level disagreements
/// (stale timestamps, epoch mismatches) are not errors; they cost latency
/// while the cluster converges.
#[derive(Debug, thiserror::Error)]
pub enum HermesError {
    #[error("node has been terminated and refuses reads and writes")]
    Unavailable,
    #[error("write did not reach full acceptance within the retry budget")]
    WriteTimeout,
    #[error("network error: {0}")]
    Network(String),
}
