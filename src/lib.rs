pub mod config;
pub mod detector;
pub mod membership;
pub mod network;
pub mod protocol;
pub mod state;
pub mod types;
pub mod wal;

// Re-exports for the binary and external users.
pub use config::{ClusterConfig, ProtocolConfig};
pub use detector::FailureDetector;
pub use network::{NetworkClient, NetworkServer};
pub use protocol::ClusterNode;
pub use types::{ClusterMessage, HermesError, NodeId, Timestamp};
pub use wal::StorageHelper;
