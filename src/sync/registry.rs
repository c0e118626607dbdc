//! Source registry: enabled sources, due users and per-pair sync state

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::Result;
use crate::db::{DbPool, Source, SourceLinkRepo, SourceRepo, SourceStateRepo, SourceSyncState};

/// Provides the users eligible for sync from a source
pub trait LinkedUsers: Send + Sync {
    /// Users linked to `source_id`
    ///
    /// # Errors
    ///
    /// Returns error if the backing store is unavailable
    fn linked_users(&self, source_id: &str) -> Result<Vec<String>>;
}

impl LinkedUsers for SourceLinkRepo {
    fn linked_users(&self, source_id: &str) -> Result<Vec<String>> {
        self.users_for_source(source_id)
    }
}

/// Read/write access to sources and their sync state
#[derive(Clone)]
pub struct SourceRegistry {
    sources: SourceRepo,
    states: SourceStateRepo,
    links: Arc<dyn LinkedUsers>,
}

impl SourceRegistry {
    /// Registry backed by the database, using stored links as the linked-users provider
    #[must_use]
    pub fn new(pool: DbPool) -> Self {
        Self {
            sources: SourceRepo::new(pool.clone()),
            states: SourceStateRepo::new(pool.clone()),
            links: Arc::new(SourceLinkRepo::new(pool)),
        }
    }

    /// Replace the linked-users provider
    #[must_use]
    pub fn with_linked_users(mut self, links: Arc<dyn LinkedUsers>) -> Self {
        self.links = links;
        self
    }

    /// Sources that may be scheduled
    ///
    /// # Errors
    ///
    /// Returns error if the backing store is unavailable
    pub fn list_enabled_sources(&self) -> Result<Vec<Source>> {
        self.sources.list_enabled()
    }

    /// Users linked to `source` whose next run is at or before `now`
    ///
    /// # Errors
    ///
    /// Returns error if the backing store is unavailable
    pub fn list_due_users(&self, source: &Source, now: DateTime<Utc>) -> Result<Vec<String>> {
        let linked = self.links.linked_users(&source.source_id)?;
        if linked.is_empty() {
            return Ok(linked);
        }

        let states: HashMap<String, SourceSyncState> = self
            .states
            .list_for_source(&source.source_id)?
            .into_iter()
            .map(|s| (s.user_id.clone(), s))
            .collect();

        Ok(linked
            .into_iter()
            .filter(|user| states.get(user).is_none_or(|s| s.is_due(now)))
            .collect())
    }

    /// Enabled sources `user_id` is linked to
    ///
    /// # Errors
    ///
    /// Returns error if the backing store is unavailable
    pub fn sources_for_user(&self, user_id: &str) -> Result<Vec<Source>> {
        let mut linked = Vec::new();
        for source in self.list_enabled_sources()? {
            if self
                .links
                .linked_users(&source.source_id)?
                .iter()
                .any(|u| u == user_id)
            {
                linked.push(source);
            }
        }
        Ok(linked)
    }

    /// Sync state of a pair, if it was ever scheduled
    ///
    /// # Errors
    ///
    /// Returns error if the backing store is unavailable
    pub fn get_state(&self, source_id: &str, user_id: &str) -> Result<Option<SourceSyncState>> {
        self.states.get(source_id, user_id)
    }

    /// Persist the state of a pair
    ///
    /// # Errors
    ///
    /// Returns error if the backing store is unavailable
    pub fn upsert_state(&self, state: &SourceSyncState) -> Result<()> {
        self.states.upsert(state)
    }
}
