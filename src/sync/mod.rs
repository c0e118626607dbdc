//! Context snapshot sync
//!
//! Sources publish per-user context packs. The orchestrator pulls them on a
//! schedule, merges one user's packs into a bounded snapshot and stores it;
//! the reader serves the latest snapshot at chat time.

pub mod backoff;
pub mod fetcher;
pub mod merge;
pub mod metrics;
pub mod orchestrator;
pub mod pack;
pub mod reader;
pub mod registry;
pub mod store;

pub use backoff::BackoffPolicy;
pub use fetcher::{FetchError, FetchErrorKind, FetchOutcome, Fetcher, FreshPack, HttpFetcher};
pub use merge::{MergeConfig, MergeEngine, MergeOutput, MergeStrategy};
pub use orchestrator::{
    Orchestrator, SweepOutcome, SweepReport, SweepScope, SyncHandle, SyncSettings,
};
pub use pack::{ContextPack, ContextSnapshot, MergedPayload, PackLimits};
pub use reader::SnapshotReader;
pub use registry::{LinkedUsers, SourceRegistry};
pub use store::SnapshotStore;
