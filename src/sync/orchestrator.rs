//! Sync orchestrator: schedules sweeps, fetches, merges and stores
//!
//! Each tick lists due (source, user) pairs, groups them by user and runs one
//! sweep per user. A sweep fetches the user's due sources concurrently, waits
//! for all of them (bounded by the sweep deadline), then merges once. Fetches
//! share a global worker pool; each source additionally has its own
//! concurrency cap and rate limit.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, watch};

use super::backoff::{self, BackoffPolicy};
use super::fetcher::{FetchError, FetchErrorKind, FetchOutcome, Fetcher};
use super::merge::MergeEngine;
use super::metrics;
use super::pack::{ContextPack, ContributingSource};
use super::registry::SourceRegistry;
use super::store::SnapshotStore;
use crate::Result;
use crate::db::{PutOutcome, Source, SourceSyncState};

/// Capacity of the out-of-band sync signal queue
const SIGNAL_QUEUE: usize = 256;

/// Scheduling and concurrency settings
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub tick_interval: Duration,
    /// Deadline for all fetches of one sweep
    pub sweep_timeout: Duration,
    pub worker_pool_size: usize,
    pub per_source_concurrency: usize,
    pub per_source_requests_per_minute: u32,
    pub backoff: BackoffPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            sweep_timeout: Duration::from_secs(60),
            worker_pool_size: 16,
            per_source_concurrency: 4,
            per_source_requests_per_minute: 120,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Overall result of one user sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepOutcome {
    /// A new snapshot became the latest
    Stored,
    /// Merged content matched the latest snapshot
    Unchanged,
    /// No source had anything new
    NotModified,
    /// Every attempted source failed; the previous snapshot is kept
    NoSnapshot,
    /// Another sweep for this user was already running
    InFlight,
}

impl SweepOutcome {
    /// Label for the sweep counter
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Stored => "stored",
            Self::Unchanged => "unchanged",
            Self::NoSnapshot => "no_snapshot",
            Self::NotModified | Self::InFlight => "skipped",
        }
    }
}

/// What happened to one source during a sweep
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub truncated: bool,
}

/// Result of a sweep for one user
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub user_id: String,
    pub outcome: SweepOutcome,
    pub sources: Vec<SourceReport>,
    pub conflicts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
}

impl SweepReport {
    fn new(user_id: &str, outcome: SweepOutcome) -> Self {
        Self {
            user_id: user_id.to_string(),
            outcome,
            sources: Vec::new(),
            conflicts: 0,
            snapshot_id: None,
        }
    }
}

/// Which of a user's sources a sweep fetches
#[derive(Debug, Clone)]
pub enum SweepScope {
    /// Only these (due) sources; the rest contribute their last accepted pack
    Due(HashSet<String>),
    /// Every linked source, regardless of schedule
    All,
}

impl SweepScope {
    fn includes(&self, source_id: &str) -> bool {
        match self {
            Self::Due(ids) => ids.contains(source_id),
            Self::All => true,
        }
    }
}

type InFlightUsers = Arc<Mutex<HashSet<String>>>;

/// Marks a user as in flight until dropped
struct InFlightGuard {
    users: InFlightUsers,
    user_id: String,
}

impl InFlightGuard {
    fn acquire(users: &InFlightUsers, user_id: &str) -> Option<Self> {
        let inserted = users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string());
        inserted.then(|| Self {
            users: Arc::clone(users),
            user_id: user_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.user_id);
    }
}

/// Per-source concurrency cap and rate limit
#[derive(Clone)]
struct SourceGate {
    slots: Arc<Semaphore>,
    limiter: Arc<DefaultDirectRateLimiter>,
}

/// Sends out-of-band sync requests to a running orchestrator
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<String>,
    in_flight: InFlightUsers,
}

impl SyncHandle {
    /// Ask for a sync of `user_id` without waiting for it
    ///
    /// Returns `true` when the request was queued or a sync for the user is
    /// already running, `false` when the queue is full or closed.
    pub fn request(&self, user_id: &str) -> bool {
        if self.is_in_flight(user_id) {
            return true;
        }
        match self.tx.try_send(user_id.to_string()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "dropped sync request");
                false
            }
        }
    }

    /// Whether a sweep for `user_id` is running
    #[must_use]
    pub fn is_in_flight(&self, user_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(user_id)
    }
}

/// Drives fetch, merge and store for all due (source, user) pairs
pub struct Orchestrator {
    registry: SourceRegistry,
    fetcher: Arc<dyn Fetcher>,
    engine: MergeEngine,
    store: Arc<SnapshotStore>,
    settings: SyncSettings,
    workers: Arc<Semaphore>,
    gates: Mutex<HashMap<String, SourceGate>>,
    in_flight: InFlightUsers,
}

impl Orchestrator {
    /// Create an orchestrator
    #[must_use]
    pub fn new(
        registry: SourceRegistry,
        fetcher: Arc<dyn Fetcher>,
        engine: MergeEngine,
        store: Arc<SnapshotStore>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(settings.worker_pool_size.max(1))),
            registry,
            fetcher,
            engine,
            store,
            settings,
            gates: Mutex::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Create the signal channel; pass the receiver to [`Orchestrator::run`]
    #[must_use]
    pub fn channel(&self) -> (SyncHandle, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE);
        let handle = SyncHandle {
            tx,
            in_flight: Arc::clone(&self.in_flight),
        };
        (handle, rx)
    }

    /// Run ticks and out-of-band requests until `shutdown` flips
    ///
    /// Sweeps still running at shutdown are abandoned; their per-source state
    /// was persisted as each fetch completed, so the next start resumes.
    pub async fn run(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            tick_secs = self.settings.tick_interval.as_secs(),
            workers = self.settings.worker_pool_size,
            "sync orchestrator started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.tick(Utc::now()).await {
                            tracing::warn!(error = %e, "sync tick skipped");
                        }
                    });
                }
                Some(user_id) = signals.recv() => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = this.sweep_user(&user_id, &SweepScope::All, Utc::now()).await {
                            tracing::warn!(user_id = %user_id, error = %e, "out-of-band sync failed");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    tracing::info!("sync orchestrator stopping");
                    break;
                }
            }
        }
    }

    /// Run one scheduling pass at `now`
    ///
    /// # Errors
    ///
    /// Returns error if the registry is unavailable; nothing is attempted then
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<SweepReport>> {
        let due = match self.due_pairs(now) {
            Ok(due) => due,
            Err(e) => {
                metrics::record_sweep("skipped");
                return Err(e);
            }
        };

        if due.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(users = due.len(), "dispatching sweeps");

        let sweeps = due
            .into_iter()
            .map(|(user_id, sources)| async move {
                let result = self.sweep_user(&user_id, &SweepScope::Due(sources), now).await;
                (user_id, result)
            });

        let mut reports = Vec::new();
        for (user_id, result) in join_all(sweeps).await {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(user_id = %user_id, error = %e, "sweep failed"),
            }
        }
        Ok(reports)
    }

    /// Due source ids grouped by user
    fn due_pairs(&self, now: DateTime<Utc>) -> Result<BTreeMap<String, HashSet<String>>> {
        let mut due: BTreeMap<String, HashSet<String>> = BTreeMap::new();
        for source in self.registry.list_enabled_sources()? {
            for user_id in self.registry.list_due_users(&source, now)? {
                due.entry(user_id).or_default().insert(source.source_id.clone());
            }
        }
        Ok(due)
    }

    /// Sweep one user: fetch, then merge and store once
    ///
    /// # Errors
    ///
    /// Returns error if the registry or snapshot store is unavailable.
    /// Per-source failures are reported in the [`SweepReport`] instead.
    pub async fn sweep_user(
        &self,
        user_id: &str,
        scope: &SweepScope,
        now: DateTime<Utc>,
    ) -> Result<SweepReport> {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, user_id) else {
            tracing::debug!(user_id, "sweep already in flight");
            metrics::record_sweep(SweepOutcome::InFlight.label());
            return Ok(SweepReport::new(user_id, SweepOutcome::InFlight));
        };

        let sources = self.registry.sources_for_user(user_id)?;
        let mut attempts = Vec::new();
        let mut packs = Vec::new();

        for source in sources {
            let state = self
                .registry
                .get_state(&source.source_id, user_id)?
                .unwrap_or_else(|| SourceSyncState::new(&source.source_id, user_id));

            if scope.includes(&source.source_id) {
                attempts.push((source, state));
            } else if state.last_error.is_none()
                && let Some(pack) = last_pack(&state)
            {
                packs.push(pack);
            }
        }

        let deadline = tokio::time::Instant::now() + self.settings.sweep_timeout;
        let fetches = attempts.iter().map(|(source, state)| async move {
            tokio::time::timeout_at(deadline, self.fetch_one(source, user_id, state))
                .await
                .unwrap_or_else(|_| FetchOutcome::Error(FetchError::timed_out()))
        });
        let outcomes = join_all(fetches).await;

        let mut report = SweepReport::new(user_id, SweepOutcome::NotModified);
        let (fresh, failed) = self.settle(user_id, attempts, outcomes, &mut packs, &mut report, now);

        if fresh == 0 && !packs.is_empty() && !self.snapshot_covers(user_id, &packs)? {
            tracing::info!(user_id, packs = packs.len(), "snapshot behind accepted packs, merging");
            self.merge_and_store(user_id, &packs, &mut report, now).await?;
        } else if fresh == 0 {
            report.outcome = if failed > 0 {
                tracing::warn!(user_id, failed, "sweep produced no snapshot, keeping previous");
                SweepOutcome::NoSnapshot
            } else {
                SweepOutcome::NotModified
            };
        } else {
            self.merge_and_store(user_id, &packs, &mut report, now).await?;
        }

        metrics::record_sweep(report.outcome.label());
        Ok(report)
    }

    /// Record each fetch outcome, persist the new per-source state and
    /// collect accepted packs; returns (fresh, failed) counts
    fn settle(
        &self,
        user_id: &str,
        attempts: Vec<(Source, SourceSyncState)>,
        outcomes: Vec<FetchOutcome>,
        packs: &mut Vec<ContextPack>,
        report: &mut SweepReport,
        now: DateTime<Utc>,
    ) -> (usize, usize) {
        let mut fresh = 0usize;
        let mut failed = 0usize;

        for ((source, prior), outcome) in attempts.into_iter().zip(outcomes) {
            let source_id = source.source_id.as_str();
            metrics::record_attempt(source_id, outcome.label());

            let mut source_report = SourceReport {
                source_id: source_id.to_string(),
                outcome: outcome.label(),
                error: None,
                truncated: false,
            };

            match &outcome {
                FetchOutcome::Fresh(fetched) => {
                    fresh += 1;
                    metrics::record_payload_bytes(source_id, fetched.payload_bytes);
                    if fetched.truncated {
                        metrics::record_truncated(source_id);
                        tracing::info!(source_id, user_id, "context pack truncated to caps");
                    }
                    source_report.truncated = fetched.truncated;
                    packs.push(fetched.pack.clone());
                }
                FetchOutcome::NotModified => {
                    if let Some(pack) = last_pack(&prior) {
                        packs.push(pack);
                    }
                }
                FetchOutcome::Error(e) => {
                    failed += 1;
                    source_report.error = Some(e.message.clone());
                    log_fetch_error(source_id, user_id, e);
                }
            }

            let next = next_state(prior, &source, &outcome, &self.settings.backoff, now);
            if let Err(e) = self.registry.upsert_state(&next) {
                tracing::error!(source_id, user_id, error = %e, "failed to persist sync state");
            }
            report.sources.push(source_report);
        }

        (fresh, failed)
    }

    /// Whether the latest snapshot was built from exactly `packs`
    fn snapshot_covers(&self, user_id: &str, packs: &[ContextPack]) -> Result<bool> {
        let Some(latest) = self.store.get_latest(user_id)? else {
            return Ok(false);
        };
        let mut expected: Vec<ContributingSource> = packs.iter().map(ContributingSource::from).collect();
        expected.sort_by(|a, b| {
            a.source_id
                .cmp(&b.source_id)
                .then_with(|| b.generated_at.cmp(&a.generated_at))
        });
        expected.dedup_by(|later, earlier| later.source_id == earlier.source_id);

        let mut stored = latest.snapshot.payload.sources;
        stored.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(stored == expected)
    }

    async fn merge_and_store(
        &self,
        user_id: &str,
        packs: &[ContextPack],
        report: &mut SweepReport,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(merged) = self.engine.merge(user_id, packs, now) else {
            report.outcome = SweepOutcome::NoSnapshot;
            return Ok(());
        };

        for conflict in &merged.conflicts {
            metrics::record_conflict(&conflict.field);
            tracing::debug!(
                user_id,
                field = %conflict.field,
                winner = %conflict.winner,
                loser = %conflict.loser,
                loser_hash = %conflict.loser_hash,
                "merge conflict"
            );
        }
        report.conflicts = merged.conflicts.len();

        match self.store.put(&merged.snapshot).await? {
            PutOutcome::Stored { id } => {
                tracing::info!(user_id, snapshot_id = %id, packs = packs.len(), "context snapshot stored");
                report.outcome = SweepOutcome::Stored;
                report.snapshot_id = Some(id);
            }
            PutOutcome::Unchanged { id } => {
                tracing::debug!(user_id, snapshot_id = %id, "context snapshot unchanged");
                report.outcome = SweepOutcome::Unchanged;
                report.snapshot_id = Some(id);
            }
        }

        Ok(())
    }

    /// Fetch under the source's slot cap and rate limit, then the worker pool
    ///
    /// A worker is only taken once the source itself is ready, so a saturated
    /// source never holds workers other sources could use.
    async fn fetch_one(&self, source: &Source, user_id: &str, prior: &SourceSyncState) -> FetchOutcome {
        let gate = self.gate(&source.source_id);

        let Ok(_slot) = gate.slots.acquire().await else {
            return FetchOutcome::Error(FetchError::timed_out());
        };
        gate.limiter.until_ready().await;
        let Ok(_worker) = self.workers.acquire().await else {
            return FetchOutcome::Error(FetchError::timed_out());
        };

        self.fetcher.fetch(source, user_id, Some(prior)).await
    }

    fn gate(&self, source_id: &str) -> SourceGate {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates
            .entry(source_id.to_string())
            .or_insert_with(|| {
                let rpm = NonZeroU32::new(self.settings.per_source_requests_per_minute)
                    .unwrap_or(NonZeroU32::MIN);
                SourceGate {
                    slots: Arc::new(Semaphore::new(self.settings.per_source_concurrency.max(1))),
                    limiter: Arc::new(RateLimiter::direct(Quota::per_minute(rpm))),
                }
            })
            .clone()
    }
}

fn log_fetch_error(source_id: &str, user_id: &str, e: &FetchError) {
    match e.kind {
        FetchErrorKind::Transient => {
            tracing::warn!(source_id, user_id, error = %e.message, "context fetch failed, will back off");
        }
        FetchErrorKind::Fatal => {
            tracing::error!(source_id, user_id, error = %e.message, "context fetch rejected by source");
        }
        FetchErrorKind::SchemaUnsupported | FetchErrorKind::Invalid => {
            tracing::warn!(source_id, user_id, kind = e.kind.as_str(), error = %e.message, "context pack discarded");
        }
    }
}

/// The last accepted pack stored in `state`, if readable
fn last_pack(state: &SourceSyncState) -> Option<ContextPack> {
    let raw = state.last_pack.as_deref()?;
    serde_json::from_str(raw)
        .map_err(|e| {
            tracing::warn!(source_id = %state.source_id, error = %e, "unreadable stored pack");
        })
        .ok()
}

/// State after an attempt; `next_run_at` always moves past `now`
#[must_use]
pub fn next_state(
    mut state: SourceSyncState,
    source: &Source,
    outcome: &FetchOutcome,
    backoff: &BackoffPolicy,
    now: DateTime<Utc>,
) -> SourceSyncState {
    let poll = Duration::from_secs(u64::from(source.poll_interval_secs));
    state.last_attempt_at = Some(now);

    match outcome {
        FetchOutcome::Fresh(fetched) => {
            state.last_success_at = Some(now);
            state.last_error = None;
            state.consecutive_failures = 0;
            state.etag.clone_from(&fetched.etag);
            if fetched.cursor.is_some() {
                state.since_cursor.clone_from(&fetched.cursor);
            }
            state.last_pack = serde_json::to_string(&fetched.pack).ok();
            state.next_run_at = Some(backoff::after(now, poll));
        }
        FetchOutcome::NotModified => {
            state.last_success_at = Some(now);
            state.last_error = None;
            state.consecutive_failures = 0;
            state.next_run_at = Some(backoff::after(now, poll));
        }
        FetchOutcome::Error(e) => {
            state.last_error = Some(e.to_string());
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            let delay = backoff.delay_for(e.kind, state.consecutive_failures, poll);
            state.next_run_at = Some(backoff::after(now, delay));
        }
    }

    state
}
