//! Conversa Gateway - chat gateway with synced user context
//!
//! External sources publish per-user context packs. The gateway pulls them
//! on a schedule, merges each user's packs into one bounded snapshot and
//! serves the latest snapshot to the chat layer without ever blocking on a
//! fetch.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                 Context sources                      │
//! │   GET {base_url}/context-pack?user_id=..&audience=.. │
//! └──────────────────────────┬───────────────────────────┘
//!                            │ fetch (conditional, cursor)
//! ┌──────────────────────────▼───────────────────────────┐
//! │                  Sync orchestrator                   │
//! │   Registry  │  Fetcher  │  Merge engine  │  Store    │
//! └──────────────────────────┬───────────────────────────┘
//!                            │ latest snapshot
//! ┌──────────────────────────▼───────────────────────────┐
//! │          Read path  /  HTTP API  /  metrics          │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod sync;

pub use config::Config;
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use sync::{Orchestrator, SnapshotReader, SnapshotStore};
