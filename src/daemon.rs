//! Daemon - the main gateway service
//!
//! Wires the database, the sync orchestrator, the chat-time reader and the
//! HTTP API together and runs them until interrupted.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::api::ApiServerBuilder;
use crate::db::{self, DbPool};
use crate::sync::{
    self, HttpFetcher, MergeEngine, Orchestrator, SnapshotReader, SnapshotStore, SourceRegistry,
    SweepReport, SweepScope,
};
use crate::{Config, Result};

/// How long shutdown waits for the orchestrator loop to stop
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The Conversa daemon
pub struct Daemon {
    config: Config,
    db: DbPool,
}

impl Daemon {
    /// Open the database under the configured data directory
    ///
    /// # Errors
    ///
    /// Returns error if the data directory or database cannot be created
    pub fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db_path = config.db_path();
        let db = db::init(&db_path)?;

        tracing::info!(path = %db_path.display(), "database opened");

        Ok(Self { config, db })
    }

    /// Database pool
    #[must_use]
    pub const fn db(&self) -> &DbPool {
        &self.db
    }

    /// Snapshot store and an orchestrator that is not yet running
    fn sync_components(&self) -> Result<(Arc<SnapshotStore>, Arc<Orchestrator>)> {
        let sync_config = &self.config.sync;
        let store = Arc::new(SnapshotStore::new(
            self.db.clone(),
            sync_config.snapshot_history_limit,
        ));
        let fetcher = HttpFetcher::new(
            &sync_config.audience,
            sync_config.fetch_timeout(),
            self.config.limits,
        )?;
        let engine = MergeEngine::new(self.config.merge.clone(), self.config.limits);

        let orchestrator = Orchestrator::new(
            SourceRegistry::new(self.db.clone()),
            Arc::new(fetcher),
            engine,
            Arc::clone(&store),
            sync_config.settings(),
        );

        Ok((store, Arc::new(orchestrator)))
    }

    /// Run one forced sweep of every source linked to `user_id`
    ///
    /// # Errors
    ///
    /// Returns error if the registry or snapshot store is unavailable
    pub async fn sync_once(&self, user_id: &str) -> Result<SweepReport> {
        let (_, orchestrator) = self.sync_components()?;
        orchestrator
            .sweep_user(user_id, &SweepScope::All, Utc::now())
            .await
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP server cannot start
    pub async fn run(self) -> Result<()> {
        let metrics = match sync::metrics::install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "metrics disabled");
                None
            }
        };

        let (store, orchestrator) = self.sync_components()?;
        let (sync_handle, signals) = orchestrator.channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sync_enabled = self.config.sync.enabled;
        let sync_task = if sync_enabled {
            Some(tokio::spawn(Arc::clone(&orchestrator).run(signals, shutdown_rx.clone())))
        } else {
            tracing::info!("background sync disabled");
            drop(signals);
            None
        };

        let reader = SnapshotReader::new(
            Arc::clone(&store),
            sync_handle.clone(),
            self.config.sync.debounce(),
        );

        let mut builder = ApiServerBuilder::new(
            self.db.clone(),
            store,
            reader,
            sync_handle,
            self.config.server.port,
        )
        .api_key(self.config.server.api_key.clone())
        .sync_enabled(sync_enabled);
        if let Some(handle) = metrics {
            builder = builder.metrics(handle);
        }
        let server = builder.build();

        let ctrl_c_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                let _ = ctrl_c_tx.send(true);
            }
        });

        let mut server_shutdown = shutdown_rx;
        let served = server
            .run(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await;

        let _ = shutdown_tx.send(true);
        if let Some(task) = sync_task
            && tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err()
        {
            tracing::warn!("sync orchestrator did not stop in time");
        }

        served
    }
}
