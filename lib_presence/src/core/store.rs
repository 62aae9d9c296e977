//! # Presence State Store
//!
//! Canonical `user_id -> PresenceRecord` map. The server is the only source of
//! truth for membership, so the one mutation is a wholesale replacement from a
//! snapshot; there is no insert/remove API for callers to drift the map away
//! from the server's view.
//!
//! The map lives in a `watch` channel: the dispatcher holds the single writer
//! ([`PresenceStore`]) and any number of consumers hold read-only
//! [`PresenceView`]s that can also await the next change.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::protocol::PresenceRecord;

/// Immutable presence map published by the store.
pub type PresenceMap = HashMap<i64, PresenceRecord>;

/// Single-writer side of the presence state.
pub struct PresenceStore {
    tx: watch::Sender<Arc<PresenceMap>>,
}

impl Default for PresenceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(PresenceMap::new()));
        Self { tx }
    }

    /// Replaces the whole map with `records`. A user id appearing more than
    /// once keeps its last record. Returns the new count.
    pub fn replace_all(&self, records: Vec<PresenceRecord>) -> usize {
        let map: PresenceMap = records.into_iter().map(|r| (r.user_id, r)).collect();
        let count = map.len();
        self.tx.send_replace(Arc::new(map));
        count
    }

    /// Empties the store (used on disconnect).
    pub fn clear(&self) {
        if !self.tx.borrow().is_empty() {
            self.tx.send_replace(Arc::new(PresenceMap::new()));
        }
    }

    /// A read-only handle for consumers.
    pub fn view(&self) -> PresenceView {
        PresenceView {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of online users.
    pub fn count(&self) -> usize {
        self.tx.borrow().len()
    }
}

/// Read-only view of the presence map.
#[derive(Clone)]
pub struct PresenceView {
    rx: watch::Receiver<Arc<PresenceMap>>,
}

impl PresenceView {
    /// Current map. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<PresenceMap> {
        Arc::clone(&self.rx.borrow())
    }

    /// Records ordered by `last_activity`, most recent first. Ties fall back
    /// to ascending user id so the order is stable.
    pub fn sorted_by_recency(&self) -> Vec<PresenceRecord> {
        let mut users: Vec<PresenceRecord> = self.rx.borrow().values().cloned().collect();
        users.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        users
    }

    /// Number of online users.
    pub fn count(&self) -> usize {
        self.rx.borrow().len()
    }

    /// Record for one user, if online.
    pub fn get(&self, user_id: i64) -> Option<PresenceRecord> {
        self.rx.borrow().get(&user_id).cloned()
    }

    /// Whether `user_id` is online.
    pub fn contains(&self, user_id: i64) -> bool {
        self.rx.borrow().contains_key(&user_id)
    }

    /// Waits until the map is replaced. Returns `false` once the store is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
