//! Per-key replicated state machine and the concurrent key → state map.
//!
//! Every key has exactly one `HermesValue`, shared by all tasks touching
//! that key. State, value and timestamp form one unit: they are only ever
//! mutated together, inside the per-key exclusive section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;

use crate::types::{NodeId, Timestamp, ValueState};

struct ValueInner {
    value: String,
    timestamp: Timestamp,
}

/// One key's local replica: coherence state, value, write timestamp and the
/// wait/wake primitive for callers stalled on "become valid".
///
/// Transitions are compare-and-set: each checks the expected current state
/// under the exclusive section and fails (returns `None`/`false`) if a
/// concurrent mutation got there first. Every transition publishes the new
/// state through a watch channel, so stalled callers always re-check after
/// any change and wakeups cannot be lost.
pub struct HermesValue {
    key: String,
    inner: Mutex<ValueInner>,
    state_tx: watch::Sender<ValueState>,
}

impl HermesValue {
    /// Fresh key: VALID with a zero timestamp stamped by this node, empty
    /// value. Both insertion paths (first Write, first Invalidate) start
    /// here and immediately transition; until one does, the zero timestamp
    /// marks the entry as never written and it reads as absent.
    pub fn new(key: impl Into<String>, node_id: NodeId) -> Self {
        HermesValue {
            key: key.into(),
            inner: Mutex::new(ValueInner {
                value: String::new(),
                timestamp: Timestamp::zero(node_id),
            }),
            state_tx: watch::Sender::new(ValueState::Valid),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> ValueState {
        *self.state_tx.borrow()
    }

    pub fn is_valid(&self) -> bool {
        self.state() == ValueState::Valid
    }

    pub fn timestamp(&self) -> Timestamp {
        self.inner.lock().unwrap().timestamp
    }

    /// Block until the key is VALID. Used by reads; unbounded because a
    /// stalled key is eventually revived by its coordinator's Validate or
    /// by the replay watchdog.
    pub async fn wait_till_valid(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s == ValueState::Valid).await;
    }

    /// Block until the key is VALID or `timeout` elapses; returns whether
    /// VALID was reached. Used by writes to decide when to replay.
    pub async fn wait_till_valid_or_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_till_valid())
            .await
            .is_ok()
    }

    /// Wait until the key leaves WRITE. Used by the coordinator to notice,
    /// mid-collection, that a concurrent higher-timestamp Invalidate has
    /// preempted its own write.
    pub async fn wait_till_preempted(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|s| *s != ValueState::Write).await;
    }

    /// VALID→WRITE: begin coordinating a write. Advances the timestamp,
    /// installs the provisional value and returns the write timestamp the
    /// caller must carry through the broadcast (it must never be re-read
    /// from shared state, which a concurrent Invalidate may overwrite).
    pub fn begin_write(&self, new_value: &str, node_id: NodeId) -> Option<Timestamp> {
        self.begin_write_from(ValueState::Valid, Some(new_value), node_id)
            .map(|(_, ts)| ts)
    }

    /// REPLAY→WRITE: take over coordination after a stall. `new_value`
    /// replaces the stored value when the replay carries a client write;
    /// `None` re-drives the last-known value from the orphaned Invalidate.
    /// Returns the value and timestamp to broadcast.
    pub fn begin_replay_write(
        &self,
        new_value: Option<&str>,
        node_id: NodeId,
    ) -> Option<(String, Timestamp)> {
        self.begin_write_from(ValueState::Replay, new_value, node_id)
    }

    fn begin_write_from(
        &self,
        expected: ValueState,
        new_value: Option<&str>,
        node_id: NodeId,
    ) -> Option<(String, Timestamp)> {
        let mut inner = self.inner.lock().unwrap();
        if *self.state_tx.borrow() != expected {
            return None;
        }
        inner.timestamp.advance(node_id);
        if let Some(value) = new_value {
            inner.value = value.to_owned();
        }
        let captured = (inner.value.clone(), inner.timestamp);
        self.state_tx.send_replace(ValueState::Write);
        Some(captured)
    }

    /// INVALID→REPLAY: claim the key for self-promotion. Fails if the key
    /// went VALID in the meantime or this node already coordinates it.
    pub fn try_replay(&self) -> bool {
        let _inner = self.inner.lock().unwrap();
        if *self.state_tx.borrow() != ValueState::Invalid {
            return false;
        }
        self.state_tx.send_replace(ValueState::Replay);
        true
    }

    /// WRITE→VALID after full acceptance. Guarded on the write timestamp:
    /// fails when a concurrent Invalidate superseded this write while its
    /// acks were being collected, making stale completions harmless.
    pub fn commit_write(&self, ts: Timestamp) -> bool {
        let inner = self.inner.lock().unwrap();
        if *self.state_tx.borrow() != ValueState::Write || inner.timestamp != ts {
            return false;
        }
        self.state_tx.send_replace(ValueState::Valid);
        true
    }

    /// WRITE→INVALID when the retry budget runs out. The key must not stay
    /// in WRITE forever: parking it INVALID lets the replay machinery keep
    /// driving the value. Guarded on the write timestamp like a commit.
    pub fn abort_write(&self, ts: Timestamp) -> bool {
        let inner = self.inner.lock().unwrap();
        if *self.state_tx.borrow() != ValueState::Write || inner.timestamp != ts {
            return false;
        }
        self.state_tx.send_replace(ValueState::Invalid);
        true
    }

    /// Apply an inbound Invalidate. Rejects a stale write: strictly lower
    /// timestamps only, so an equal timestamp (which cannot legitimately
    /// recur for distinct writes) is accepted and the check stays total.
    /// An entry still at its zero placeholder timestamp has no prior claim
    /// and accepts unconditionally; that test runs inside the exclusive
    /// section, so racing first Invalidates for a fresh key serialize and
    /// the lower one is refused against the winner's installed timestamp.
    ///
    /// On acceptance value and timestamp are overwritten and the state is
    /// forced INVALID regardless of what it was, including WRITE, which is
    /// how a coordinator loses to a higher-priority concurrent write.
    /// Readers stay stalled; they re-check and keep waiting.
    pub fn accept_invalidate(&self, value: &str, ts: Timestamp) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.timestamp.logical_time > 0 && ts < inner.timestamp {
            return false;
        }
        inner.value = value.to_owned();
        inner.timestamp = ts;
        self.state_tx.send_replace(ValueState::Invalid);
        true
    }

    /// Apply an inbound Validate: INVALID→VALID and wake, but only while
    /// the timestamp still matches. A later accepted Invalidate supersedes
    /// the pending one and its own Validate must arrive before the key opens.
    pub fn accept_validate(&self, ts: Timestamp) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.timestamp != ts || *self.state_tx.borrow() != ValueState::Invalid {
            return false;
        }
        self.state_tx.send_replace(ValueState::Valid);
        true
    }

    /// Value observed atomically with the VALID check. `None` means the key
    /// is in some other state and the reader must go back to waiting;
    /// `Some(None)` means the key still holds its zero placeholder, so no
    /// write ever completed and it reads as absent.
    pub fn read_valid_value(&self) -> Option<Option<String>> {
        let inner = self.inner.lock().unwrap();
        if *self.state_tx.borrow() != ValueState::Valid {
            return None;
        }
        if inner.timestamp.logical_time == 0 {
            return Some(None);
        }
        Some(Some(inner.value.clone()))
    }

    /// Whether the key still sits INVALID at exactly `ts`. The replay
    /// watchdog uses this to tell an orphaned Invalidate (no Validate ever
    /// arrived) from one that was validated or superseded meanwhile.
    pub fn is_invalid_at(&self, ts: Timestamp) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.timestamp == ts && *self.state_tx.borrow() == ValueState::Invalid
    }

    /// Atomic view of (state, timestamp, value) for logging and tests.
    pub fn snapshot(&self) -> (ValueState, Timestamp, String) {
        let inner = self.inner.lock().unwrap();
        (*self.state_tx.borrow(), inner.timestamp, inner.value.clone())
    }
}

/// Concurrent key → `HermesValue` map. Lookups share a read lock so they
/// never block on unrelated insertions; insertion takes the write lock with
/// a double-check. Keys are never removed.
pub struct KeyStore {
    map: RwLock<HashMap<String, Arc<HermesValue>>>,
}

impl KeyStore {
    pub fn new() -> Self {
        KeyStore {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<HermesValue>> {
        self.map.read().unwrap().get(key).cloned()
    }

    /// Fetch the state for `key`, materializing the zero placeholder on
    /// first contact.
    pub fn get_or_insert(&self, key: &str, node_id: NodeId) -> Arc<HermesValue> {
        if let Some(existing) = self.get(key) {
            return existing;
        }
        let mut map = self.map.write().unwrap();
        if let Some(existing) = map.get(key) {
            return Arc::clone(existing);
        }
        let fresh = Arc::new(HermesValue::new(key, node_id));
        map.insert(key.to_owned(), Arc::clone(&fresh));
        fresh
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}
