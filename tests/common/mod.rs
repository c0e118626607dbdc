//! Shared test utilities

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use conversa_gateway::db::{self, NewSource, Source, SourceCapabilities, SourceLinkRepo, SourceRepo};
use conversa_gateway::sync::{
    HttpFetcher, MergeConfig, MergeEngine, Orchestrator, PackLimits, SnapshotStore,
    SourceRegistry, SyncSettings,
};
use conversa_gateway::DbPool;
use serde_json::{Value, json};

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Register a source pointing at `base_url`
pub fn create_test_source(
    db: &DbPool,
    source_id: &str,
    base_url: &str,
    capabilities: SourceCapabilities,
) -> Source {
    let mut new = NewSource::new(source_id, source_id, base_url);
    new.capabilities = capabilities;
    SourceRepo::new(db.clone())
        .create(&new)
        .expect("failed to create test source")
}

/// Link `user_id` to `source_id`
pub fn link_test_user(db: &DbPool, source_id: &str, user_id: &str) {
    SourceLinkRepo::new(db.clone())
        .link(source_id, user_id)
        .expect("failed to link test user");
}

/// A pull response body
#[must_use]
pub fn pack_body(generated_at: &str, facts: Value, recents: Value) -> Value {
    json!({
        "schema_version": "1.0",
        "generated_at": generated_at,
        "facts": facts,
        "recents": recents,
        "pointers": {},
    })
}

/// Orchestrator over the real HTTP fetcher with a short timeout
#[must_use]
pub fn test_orchestrator(
    db: &DbPool,
    source_priority: &[&str],
) -> (Arc<Orchestrator>, Arc<SnapshotStore>) {
    let store = Arc::new(SnapshotStore::new(db.clone(), 10));
    let fetcher = HttpFetcher::new("conversa", Duration::from_secs(2), PackLimits::default())
        .expect("failed to build fetcher");
    let engine = MergeEngine::new(
        MergeConfig {
            source_priority: source_priority.iter().map(ToString::to_string).collect(),
            ..MergeConfig::default()
        },
        PackLimits::default(),
    );
    let orchestrator = Orchestrator::new(
        SourceRegistry::new(db.clone()),
        Arc::new(fetcher),
        engine,
        Arc::clone(&store),
        SyncSettings::default(),
    );
    (Arc::new(orchestrator), store)
}
