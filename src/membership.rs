//! Epoch-fenced cluster membership.
//!
//! The live-peer set and its configuration epoch change together, under one
//! lock, so a broadcast always fans out to a coherent snapshot and an
//! inbound Invalidate can be fenced against the epoch it was sent in.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use crate::types::NodeId;

struct ViewInner {
    epoch: u32,
    peers: HashMap<NodeId, SocketAddr>,
}

/// This node's view of the rest of the cluster (itself excluded).
pub struct MembershipView {
    inner: RwLock<ViewInner>,
}

impl MembershipView {
    /// Initial view at epoch 0 from the configured peer addresses.
    pub fn new(peers: impl IntoIterator<Item = SocketAddr>) -> Self {
        let peers = peers
            .into_iter()
            .map(|addr| (NodeId::from_addr(addr), addr))
            .collect();
        MembershipView {
            inner: RwLock::new(ViewInner { epoch: 0, peers }),
        }
    }

    pub fn epoch(&self) -> u32 {
        self.inner.read().unwrap().epoch
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.inner.read().unwrap().peers.contains_key(&node)
    }

    /// Epoch and peer list captured atomically. Broadcasts work from this
    /// snapshot, never from live state, so a membership change mid-round
    /// shows up as ack mismatches rather than a torn fan-out.
    pub fn snapshot(&self) -> (u32, Vec<(NodeId, SocketAddr)>) {
        let inner = self.inner.read().unwrap();
        let mut peers: Vec<_> = inner.peers.iter().map(|(id, addr)| (*id, *addr)).collect();
        peers.sort_by_key(|(id, _)| *id);
        (inner.epoch, peers)
    }

    /// Drop a failed peer and advance the epoch, returning the new epoch.
    /// Idempotent: removing an already-gone peer leaves the view untouched
    /// so duplicate failure reports cannot inflate the epoch.
    pub fn remove_and_bump(&self, failed: NodeId) -> u32 {
        let mut inner = self.inner.write().unwrap();
        if inner.peers.remove(&failed).is_some() {
            inner.epoch += 1;
        }
        inner.epoch
    }

    /// Advance the epoch without removing anyone. Used when this node
    /// announces its own departure.
    pub fn bump_epoch(&self) -> u32 {
        let mut inner = self.inner.write().unwrap();
        inner.epoch += 1;
        inner.epoch
    }

    /// Apply a peer's Mayday: drop the failed node and converge on the
    /// highest epoch either side has seen. Detections race, so the local
    /// removal may have happened already; the epoch still has to catch up
    /// to the sender's view.
    pub fn observe_mayday(&self, failed: NodeId, remote_epoch: u32) -> u32 {
        let mut inner = self.inner.write().unwrap();
        if inner.peers.remove(&failed).is_some() && inner.epoch >= remote_epoch {
            inner.epoch += 1;
        }
        inner.epoch = inner.epoch.max(remote_epoch);
        inner.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(ports: &[u16]) -> MembershipView {
        MembershipView::new(
            ports
                .iter()
                .map(|p| SocketAddr::from(([127, 0, 0, 1], *p))),
        )
    }

    #[test]
    fn snapshot_is_sorted_and_excludes_nothing() {
        let v = view(&[50053, 50051, 50052]);
        let (epoch, peers) = v.snapshot();
        assert_eq!(epoch, 0);
        let ids: Vec<u32> = peers.iter().map(|(id, _)| id.0).collect();
        assert_eq!(ids, vec![50051, 50052, 50053]);
    }

    #[test]
    fn remove_and_bump_is_idempotent() {
        let v = view(&[50051, 50052]);
        assert_eq!(v.remove_and_bump(NodeId(50052)), 1);
        assert_eq!(v.remove_and_bump(NodeId(50052)), 1);
        assert_eq!(v.len(), 1);
        assert!(!v.contains(NodeId(50052)));
        assert!(v.contains(NodeId(50051)));
    }

    #[test]
    fn observe_mayday_adopts_the_higher_epoch() {
        let v = view(&[50051, 50052, 50053]);
        assert_eq!(v.observe_mayday(NodeId(50053), 4), 4);
        assert_eq!(v.len(), 2);
        // Stale duplicate with a lower epoch changes nothing.
        assert_eq!(v.observe_mayday(NodeId(50053), 2), 4);
        assert_eq!(v.epoch(), 4);
    }

    #[test]
    fn concurrent_detection_still_advances_past_the_remote_view() {
        let v = view(&[50051, 50052]);
        // Local detector fired first.
        assert_eq!(v.remove_and_bump(NodeId(50052)), 1);
        // The peer detected the same failure independently at epoch 1.
        assert_eq!(v.observe_mayday(NodeId(50052), 1), 1);
    }
}
