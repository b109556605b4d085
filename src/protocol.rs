//! The replication protocol: coordinator write drive, follower handlers,
//! membership failure handling and the replay machinery.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::ProtocolConfig;
use crate::membership::MembershipView;
use crate::network;
use crate::state::{HermesValue, KeyStore};
use crate::types::{ClusterMessage, HermesError, NodeId, Timestamp};
use crate::wal::StorageHelper;

/// Result of one Invalidate broadcast round.
enum RoundOutcome {
    /// Every peer in the snapshot acked with accept.
    Accepted,
    /// A concurrent higher-timestamp write took the key mid-round.
    Preempted,
    /// Some peers missed or refused; the round must be retried.
    /// `responded` counts acks for this round regardless of verdict.
    Partial {
        accepted: usize,
        responded: usize,
        of: usize,
    },
}

/// One replica of the cluster. Every node is symmetric: it serves reads
/// and writes for any key, coordinates the writes it receives, and follows
/// the coordinators of everyone else's.
pub struct ClusterNode {
    pub id: NodeId,
    pub address: SocketAddr,
    pub membership: MembershipView,
    pub config: ProtocolConfig,
    store: KeyStore,
    storage: Option<StorageHelper>,
    shutdown_tx: watch::Sender<bool>,
}

impl ClusterNode {
    pub fn new(
        address: SocketAddr,
        peers: impl IntoIterator<Item = SocketAddr>,
        config: ProtocolConfig,
        storage: Option<StorageHelper>,
    ) -> Self {
        ClusterNode {
            id: NodeId::from_addr(address),
            address,
            membership: MembershipView::new(peers),
            config,
            store: KeyStore::new(),
            storage,
            shutdown_tx: watch::Sender::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Resolves once a Terminate has been accepted.
    pub async fn wait_shutdown(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Serve one inbound request and produce its response.
    pub async fn handle_message(self: &Arc<Self>, message: ClusterMessage) -> ClusterMessage {
        tracing::trace!(message = message.kind(), "inbound request");
        match message {
            ClusterMessage::ReadRequest { key } => match self.read(&key).await {
                Ok(value) => ClusterMessage::ReadResponse { value },
                Err(_) => ClusterMessage::Unavailable,
            },
            ClusterMessage::WriteRequest { key, value } => {
                match self.write(&key, &value).await {
                    Ok(()) => ClusterMessage::WriteAck,
                    Err(e) => {
                        tracing::debug!(key, error = %e, "write refused");
                        ClusterMessage::Unavailable
                    }
                }
            }
            ClusterMessage::Invalidate {
                key,
                value,
                ts,
                epoch,
                round,
            } => ClusterMessage::InvalidateAck {
                round,
                accept: self.apply_invalidate(&key, &value, ts, epoch),
                responder: self.id,
            },
            ClusterMessage::Validate { key, ts } => {
                self.apply_validate(&key, ts);
                ClusterMessage::ValidateAck
            }
            ClusterMessage::Mayday { failed, epoch } => {
                let adopted = self.membership.observe_mayday(failed, epoch);
                tracing::info!(failed = %failed, epoch = adopted, "mayday applied");
                ClusterMessage::MaydayAck
            }
            ClusterMessage::Heartbeat => ClusterMessage::HeartbeatAck,
            ClusterMessage::Terminate { graceful } => self.handle_terminate(graceful).await,
            other => {
                tracing::debug!(message = other.kind(), "unexpected request");
                ClusterMessage::Unavailable
            }
        }
    }

    /// Read the local replica of `key`, stalling while it is invalidated.
    ///
    /// A key this node has never heard of reads as `None` without creating
    /// any state, and so does one that was materialized but never carried
    /// a completed write. A known key is served only from a VALID copy;
    /// the check and the value extraction are atomic, so a reader can
    /// never observe a half-applied write.
    pub async fn read(&self, key: &str) -> Result<Option<String>, HermesError> {
        if self.is_shutting_down() {
            return Err(HermesError::Unavailable);
        }
        let Some(entry) = self.store.get(key) else {
            return Ok(None);
        };
        loop {
            entry.wait_till_valid().await;
            if let Some(value) = entry.read_valid_value() {
                return Ok(value);
            }
        }
    }

    /// Write `value` to `key`, coordinating its replication.
    ///
    /// The caller's node becomes the coordinator for this write: it stamps
    /// the value with an advanced local timestamp, broadcasts Invalidate to
    /// every live peer, and only after every one of them acked does it send
    /// the fire-and-forget Validates and open the key again. A write to a
    /// key that is currently invalidated waits; if no Validate shows up
    /// within the replay timeout the node assumes the original coordinator
    /// died, takes the key over and drives this write itself.
    ///
    /// Returns once the value (or a concurrent write that superseded it)
    /// is accepted cluster-wide. `WriteTimeout` means the retry budget ran
    /// out; the value is handed to the replay machinery rather than
    /// dropped, so the cluster still converges on it. A budget spent
    /// without a single ack from any peer reports `Network` instead.
    pub async fn write(self: &Arc<Self>, key: &str, value: &str) -> Result<(), HermesError> {
        if self.is_shutting_down() {
            return Err(HermesError::Unavailable);
        }
        let entry = self.store.get_or_insert(key, self.id);
        loop {
            if let Some(write_ts) = entry.begin_write(value, self.id) {
                self.log_mutation(key, value);
                return self.drive_write(&entry, key, value.to_owned(), write_ts).await;
            }

            // Not VALID right now. Wait for the pending write to land; a
            // stall past the timeout means its coordinator is gone.
            if entry.wait_till_valid_or_timeout(self.config.replay_timeout).await {
                continue;
            }
            if !entry.try_replay() {
                continue;
            }
            let Some((captured, write_ts)) = entry.begin_replay_write(Some(value), self.id)
            else {
                continue;
            };
            tracing::debug!(key, ts = %write_ts, "write stalled, taking the key over");
            self.log_mutation(key, &captured);
            return self.drive_write(&entry, key, captured, write_ts).await;
        }
    }

    /// Broadcast/collect/validate loop for a write this node coordinates.
    /// `write_ts` and `value` are the captured locals of the transition
    /// that put the key into WRITE; shared state is never re-read.
    async fn drive_write(
        self: &Arc<Self>,
        entry: &Arc<HermesValue>,
        key: &str,
        value: String,
        write_ts: Timestamp,
    ) -> Result<(), HermesError> {
        let budget = self.config.write_budget.max(1);
        let mut backoff = self.config.retry_backoff_base;
        let mut heard_any_ack = false;

        for attempt in 1..=budget {
            let (epoch, peers) = self.membership.snapshot();

            match self
                .run_invalidate_round(entry, key, &value, write_ts, epoch, &peers)
                .await
            {
                RoundOutcome::Accepted => {
                    self.spawn_validate_broadcast(peers, key.to_owned(), write_ts);
                    if entry.commit_write(write_ts) {
                        tracing::debug!(key, ts = %write_ts, "write committed");
                        return Ok(());
                    }
                    return self.settle_superseded(entry, key).await;
                }
                RoundOutcome::Preempted => {
                    return self.settle_superseded(entry, key).await;
                }
                RoundOutcome::Partial {
                    accepted,
                    responded,
                    of,
                } => {
                    heard_any_ack |= responded > 0;
                    tracing::debug!(
                        key,
                        ts = %write_ts,
                        attempt,
                        accepted,
                        responded,
                        of,
                        "partial acceptance, retrying"
                    );
                }
            }

            if attempt < budget {
                tokio::select! {
                    _ = entry.wait_till_preempted() => {
                        return self.settle_superseded(entry, key).await;
                    }
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(self.config.retry_backoff_cap);
            }
        }

        // The key must not wedge in WRITE, and the value must not vanish:
        // park it INVALID and let the replay watchdog keep driving it.
        if entry.abort_write(write_ts) {
            self.arm_replay_watchdog(Arc::clone(entry), write_ts);
        }
        tracing::warn!(key, ts = %write_ts, "write budget exhausted");
        if heard_any_ack {
            Err(HermesError::WriteTimeout)
        } else {
            Err(HermesError::Network(format!(
                "no invalidate ack from any peer in {budget} attempts"
            )))
        }
    }

    /// One Invalidate fan-out: every peer concurrently, each under its own
    /// message-loss timeout, acks correlated by the round id. Collection
    /// races against local preemption the whole time.
    async fn run_invalidate_round(
        &self,
        entry: &HermesValue,
        key: &str,
        value: &str,
        write_ts: Timestamp,
        epoch: u32,
        peers: &[(NodeId, SocketAddr)],
    ) -> RoundOutcome {
        if peers.is_empty() {
            // Sole member: acceptance is vacuous.
            return RoundOutcome::Accepted;
        }

        let round = Uuid::new_v4();
        let message = ClusterMessage::Invalidate {
            key: key.to_owned(),
            value: value.to_owned(),
            ts: write_ts,
            epoch,
            round,
        };
        let mlt = self.config.message_loss_timeout;

        let mut responses: FuturesUnordered<_> = peers
            .iter()
            .map(|(peer, addr)| {
                let message = message.clone();
                let peer = *peer;
                let addr = *addr;
                async move {
                    (
                        peer,
                        tokio::time::timeout(mlt, network::send_to(addr, &message)).await,
                    )
                }
            })
            .collect();

        let mut accepted = 0usize;
        let mut responded = 0usize;

        let preempted = entry.wait_till_preempted();
        tokio::pin!(preempted);

        loop {
            tokio::select! {
                _ = &mut preempted => return RoundOutcome::Preempted,
                response = responses.next() => {
                    let Some((peer, outcome)) = response else { break };
                    match outcome {
                        Ok(Ok(ClusterMessage::InvalidateAck { round: ack_round, accept, responder })) => {
                            if ack_round != round {
                                tracing::debug!(peer = %responder, key, "ack for a stale round discarded");
                            } else {
                                responded += 1;
                                if accept {
                                    accepted += 1;
                                } else {
                                    tracing::debug!(peer = %responder, key, ts = %write_ts, "invalidate refused");
                                }
                            }
                        }
                        Ok(Ok(other)) => {
                            tracing::debug!(peer = %peer, response = other.kind(), "unexpected invalidate response");
                        }
                        Ok(Err(e)) => {
                            tracing::debug!(peer = %peer, error = %e, "invalidate delivery failed");
                        }
                        Err(_) => {
                            tracing::debug!(peer = %peer, "invalidate timed out");
                        }
                    }
                }
            }
        }

        if accepted == peers.len() {
            RoundOutcome::Accepted
        } else {
            RoundOutcome::Partial {
                accepted,
                responded,
                of: peers.len(),
            }
        }
    }

    /// Validates are fire-and-forget: a lost one is repaired by the
    /// receiver's replay timeout, so the commit never waits on them.
    fn spawn_validate_broadcast(
        &self,
        peers: Vec<(NodeId, SocketAddr)>,
        key: String,
        ts: Timestamp,
    ) {
        if peers.is_empty() {
            return;
        }
        let mlt = self.config.message_loss_timeout;
        tokio::spawn(async move {
            let message = ClusterMessage::Validate { key, ts };
            let mut sends: FuturesUnordered<_> = peers
                .into_iter()
                .map(|(peer, addr)| {
                    let message = message.clone();
                    async move {
                        match tokio::time::timeout(mlt, network::send_to(addr, &message)).await {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => {
                                tracing::debug!(peer = %peer, error = %e, "validate delivery failed");
                            }
                            Err(_) => {
                                tracing::debug!(peer = %peer, "validate delivery timed out");
                            }
                        }
                    }
                })
                .collect();
            while sends.next().await.is_some() {}
        });
    }

    /// A concurrent writer won the key. Its value supersedes this write in
    /// the total timestamp order, so the client is acked once the winning
    /// write lands and the key settles VALID.
    async fn settle_superseded(&self, entry: &HermesValue, key: &str) -> Result<(), HermesError> {
        tracing::debug!(key, "write superseded by a concurrent writer");
        entry.wait_till_valid().await;
        Ok(())
    }

    /// Follower side of an Invalidate.
    fn apply_invalidate(self: &Arc<Self>, key: &str, value: &str, ts: Timestamp, epoch: u32) -> bool {
        let local_epoch = self.membership.epoch();
        if epoch != local_epoch {
            tracing::debug!(key, remote = epoch, local = local_epoch, "invalidate fenced by epoch");
            return false;
        }

        let entry = self.store.get_or_insert(key, self.id);
        if !entry.accept_invalidate(value, ts) {
            tracing::debug!(key, ts = %ts, "invalidate rejected as stale");
            return false;
        }

        self.log_mutation(key, value);
        // If the coordinator dies between our ack and its Validate, the
        // watchdog re-drives this value so the key does not stall forever.
        self.arm_replay_watchdog(entry, ts);
        true
    }

    /// Follower side of a Validate. No epoch check: the value was already
    /// accepted, opening it is safe under any membership.
    fn apply_validate(&self, key: &str, ts: Timestamp) {
        if let Some(entry) = self.store.get(key) {
            if entry.accept_validate(ts) {
                tracing::debug!(key, ts = %ts, "validated");
            }
        }
    }

    async fn handle_terminate(self: &Arc<Self>, graceful: bool) -> ClusterMessage {
        let was_running = !self.shutdown_tx.send_replace(true);
        if was_running {
            tracing::info!(graceful, "terminate requested");
            if graceful {
                let epoch = self.membership.bump_epoch();
                self.broadcast_mayday(self.id, epoch).await;
            }
        }
        ClusterMessage::TerminateAck
    }

    /// Declare `dead` failed: drop it from the view, fence the old epoch,
    /// and gossip the news so stalled writes can re-broadcast without it.
    pub async fn handle_failure(self: &Arc<Self>, dead: NodeId) {
        if !self.membership.contains(dead) {
            return;
        }
        let epoch = self.membership.remove_and_bump(dead);
        tracing::warn!(failed = %dead, epoch, "peer declared dead");
        self.broadcast_mayday(dead, epoch).await;
    }

    async fn broadcast_mayday(&self, failed: NodeId, epoch: u32) {
        let (_, peers) = self.membership.snapshot();
        if peers.is_empty() {
            return;
        }
        let message = ClusterMessage::Mayday { failed, epoch };
        let mlt = self.config.message_loss_timeout;
        let mut sends: FuturesUnordered<_> = peers
            .into_iter()
            .map(|(peer, addr)| {
                let message = message.clone();
                async move {
                    if tokio::time::timeout(mlt, network::send_to(addr, &message))
                        .await
                        .is_err()
                    {
                        tracing::debug!(peer = %peer, "mayday delivery timed out");
                    }
                }
            })
            .collect();
        while sends.next().await.is_some() {}
    }

    /// Arm the stall watchdog for `(key, ts)`. Fires only if the key is
    /// still INVALID at exactly that timestamp after the replay timeout,
    /// which means no Validate arrived and nothing superseded it; the node
    /// then takes over and re-drives the last-known value. A node that was
    /// terminated in the meantime leaves the key alone.
    fn arm_replay_watchdog(self: &Arc<Self>, entry: Arc<HermesValue>, ts: Timestamp) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(node.config.replay_timeout).await;
            if node.is_shutting_down() {
                return;
            }
            if !entry.is_invalid_at(ts) {
                return;
            }
            if !entry.try_replay() {
                return;
            }
            let Some((value, replay_ts)) = entry.begin_replay_write(None, node.id) else {
                return;
            };
            let key = entry.key().to_owned();
            tracing::info!(key, ts = %replay_ts, "replaying an orphaned write");
            node.log_mutation(&key, &value);
            if let Err(e) = node.drive_write(&entry, &key, value, replay_ts).await {
                tracing::warn!(key, error = %e, "replay drive failed");
            }
        });
    }

    fn log_mutation(&self, key: &str, value: &str) {
        if let Some(storage) = &self.storage {
            storage.write_log(key, value);
        }
    }
}
