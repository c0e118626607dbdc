//! Snapshot store: single writer per user over [`SnapshotRepo`]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::Result;
use crate::db::{DbPool, PutOutcome, SnapshotRepo, StoredSnapshot};

use super::pack::ContextSnapshot;

/// Durable snapshot storage with writes serialized per user
///
/// There is no global write lock: puts for different users proceed in parallel.
pub struct SnapshotStore {
    repo: SnapshotRepo,
    history_limit: usize,
    writers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SnapshotStore {
    /// Create a store keeping `history_limit` snapshots per user
    #[must_use]
    pub fn new(pool: DbPool, history_limit: usize) -> Self {
        Self {
            repo: SnapshotRepo::new(pool),
            history_limit,
            writers: Mutex::new(HashMap::new()),
        }
    }

    /// Latest snapshot of a user (single point lookup)
    ///
    /// # Errors
    ///
    /// Returns error if the database is unavailable
    pub fn get_latest(&self, user_id: &str) -> Result<Option<StoredSnapshot>> {
        self.repo.get_latest(user_id)
    }

    /// Snapshot history of a user, newest first
    ///
    /// # Errors
    ///
    /// Returns error if the database is unavailable
    pub fn history(&self, user_id: &str) -> Result<Vec<StoredSnapshot>> {
        self.repo.history(user_id, self.history_limit)
    }

    /// Atomically replace the latest snapshot of `snapshot.user_id`
    ///
    /// # Errors
    ///
    /// Returns error if the write fails; the previous latest stays visible
    pub async fn put(&self, snapshot: &ContextSnapshot) -> Result<PutOutcome> {
        let writer = self.writer(&snapshot.user_id);
        let outcome = {
            let _guard = writer.lock().await;
            self.repo.put(snapshot, self.history_limit)
        };
        self.release(&snapshot.user_id, writer);
        outcome
    }

    fn writer(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(writers.entry(user_id.to_string()).or_default())
    }

    /// Drop the per-user lock once nobody else holds it
    fn release(&self, user_id: &str, writer: Arc<tokio::sync::Mutex<()>>) {
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        // one reference in the map, one here
        if Arc::strong_count(&writer) == 2 {
            writers.remove(user_id);
        }
        drop(writer);
    }
}
