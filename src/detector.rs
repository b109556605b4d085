//! Heartbeat-based failure detection.

use std::collections::HashMap;
use std::sync::Arc;

use crate::network;
use crate::protocol::ClusterNode;
use crate::types::{ClusterMessage, NodeId};

/// Probes every live peer on a fixed cadence and declares one dead after
/// enough consecutive misses, handing the verdict to the node's failure
/// path. One detector task runs per node.
pub struct FailureDetector {
    node: Arc<ClusterNode>,
}

impl FailureDetector {
    pub fn new(node: Arc<ClusterNode>) -> Self {
        Self { node }
    }

    /// Runs until the node shuts down. A single timed-out probe is not a
    /// verdict; only `failure_threshold` misses in a row are, so a slow
    /// response or one dropped packet cannot evict a healthy peer.
    pub async fn run(&self) {
        let period = self.node.config.heartbeat_period;
        let deadline = self.node.config.heartbeat_deadline;
        let threshold = self.node.config.failure_threshold.max(1);

        let mut misses: HashMap<NodeId, u32> = HashMap::new();

        while !self.node.is_shutting_down() {
            tokio::time::sleep(period).await;

            let (_, peers) = self.node.membership.snapshot();
            // Peers that left the view (failed or terminated) keep no score.
            misses.retain(|peer, _| peers.iter().any(|(id, _)| id == peer));

            for (peer, addr) in peers {
                let alive = matches!(
                    tokio::time::timeout(
                        deadline,
                        network::send_to(addr, &ClusterMessage::Heartbeat),
                    )
                    .await,
                    Ok(Ok(ClusterMessage::HeartbeatAck))
                );

                if alive {
                    misses.remove(&peer);
                    continue;
                }

                let count = misses.entry(peer).or_insert(0);
                *count += 1;
                tracing::debug!(peer = %peer, misses = *count, "heartbeat missed");
                if *count >= threshold {
                    misses.remove(&peer);
                    self.node.handle_failure(peer).await;
                }
            }
        }
    }
}
