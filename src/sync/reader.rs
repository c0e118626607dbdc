//! Chat-time read path
//!
//! A point lookup of the latest snapshot. A miss never waits on a fetch: it
//! returns `None` and asks the orchestrator, at most once per debounce
//! window, to sync the user in the background.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use mini_moka::sync::Cache;

use super::metrics;
use super::orchestrator::SyncHandle;
use super::pack::MergedPayload;
use super::store::SnapshotStore;

/// Upper bound on users remembered by the miss debounce
const DEBOUNCE_CAPACITY: u64 = 10_000;

/// Serves the latest merged context of a user to the chat layer
#[derive(Clone)]
pub struct SnapshotReader {
    store: Arc<SnapshotStore>,
    sync: SyncHandle,
    signaled: Cache<String, ()>,
    /// Makes the debounce check-and-insert atomic across request handlers
    claim_lock: Arc<Mutex<()>>,
}

impl SnapshotReader {
    /// Create a reader; repeated misses for a user within `debounce` send one signal
    #[must_use]
    pub fn new(store: Arc<SnapshotStore>, sync: SyncHandle, debounce: Duration) -> Self {
        Self {
            store,
            sync,
            signaled: Cache::builder()
                .max_capacity(DEBOUNCE_CAPACITY)
                .time_to_live(debounce)
                .build(),
            claim_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Latest merged payload for `user_id`, or `None` when nothing is available
    ///
    /// Storage errors are logged and reported as a miss.
    pub fn read_for_chat(&self, user_id: &str) -> Option<MergedPayload> {
        match self.store.get_latest(user_id) {
            Ok(Some(stored)) => {
                let snapshot = stored.snapshot;
                let age = (Utc::now() - snapshot.created_at)
                    .to_std()
                    .map_or(0.0, |d| d.as_secs_f64());
                let user_class = if snapshot.payload.sources.len() > 1 {
                    "multi_source"
                } else {
                    "single_source"
                };
                metrics::set_snapshot_age(user_class, age);
                Some(snapshot.payload)
            }
            Ok(None) => {
                self.signal(user_id);
                None
            }
            Err(e) => {
                tracing::warn!(user_id, error = %e, "snapshot lookup failed, serving without context");
                self.signal(user_id);
                None
            }
        }
    }

    fn signal(&self, user_id: &str) {
        if !self.claim(user_id) {
            return;
        }

        if self.sync.request(user_id) {
            tracing::debug!(user_id, "no snapshot, requested background sync");
        } else {
            // queue full or closed; let the next miss try again
            self.signaled.invalidate(&user_id.to_string());
        }
    }

    /// Mark `user_id` as signaled; `false` if it already was within the window
    fn claim(&self, user_id: &str) -> bool {
        let key = user_id.to_string();
        let _lock = self.claim_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.signaled.contains_key(&key) {
            return false;
        }
        self.signaled.insert(key, ());
        true
    }
}
