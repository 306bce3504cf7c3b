//! Feed synchronisation: ingestion, the per-feed orchestrator, the library
//! read side and the task manager that drives recurring syncs.

use std::sync::Arc;

use anyhow::{Context, Result};
use spindle_adapters::ProviderClient;
use spindle_core::{Clock, Feed, Library, Provider};
use spindle_storage::{
    CatalogStore, CredentialResolver, CredentialStore, FeedStore, RefreshCredential, StoreError,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

pub mod config;
pub mod ingest;
pub mod library;
pub mod mapping;
pub mod orchestrator;
pub mod scheduler;
pub mod tasks;

pub use config::SyncConfig;
pub use ingest::{IngestError, IngestSummary, Ingestor};
pub use library::LibraryReader;
pub use orchestrator::{FeedSyncer, SyncError, SyncPolicy};
pub use scheduler::{
    SchedulerConfig, SchedulerError, Task, TaskContext, TaskManager, TaskOutcome, TaskSubmitter,
    Trigger,
};
pub use tasks::{SyncFeedTask, SyncStaleFeedsTask};

pub const CRATE_NAME: &str = "spindle-sync";

impl SyncConfig {
    pub fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy {
            min_stale: self.min_stale,
            overlap: self.sync_overlap,
            lease: self.sync_lease,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers,
            queue_capacity: self.adhoc_queue_capacity,
        }
    }
}

/// Everything one provider's feeds need, wired against a single store.
#[derive(Clone)]
pub struct SyncService {
    config: SyncConfig,
    feeds: Arc<dyn FeedStore>,
    credentials: Arc<dyn CredentialStore>,
    syncer: FeedSyncer,
    library: LibraryReader,
}

impl SyncService {
    pub fn new<S>(
        config: SyncConfig,
        store: Arc<S>,
        provider: Arc<dyn ProviderClient>,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        S: CatalogStore + FeedStore + CredentialStore + 'static,
    {
        let catalog: Arc<dyn CatalogStore> = store.clone();
        let feeds: Arc<dyn FeedStore> = store.clone();
        let resolver: Arc<dyn CredentialResolver> = store.clone();
        let credentials: Arc<dyn CredentialStore> = store;
        let syncer = FeedSyncer::new(
            Arc::clone(&feeds),
            resolver,
            provider,
            Ingestor::new(Arc::clone(&catalog)),
            clock,
            config.sync_policy(),
        );
        Self {
            config,
            feeds,
            credentials,
            syncer,
            library: LibraryReader::new(catalog),
        }
    }

    pub fn syncer(&self) -> &FeedSyncer {
        &self.syncer
    }

    /// Stores the user's refresh credential and makes sure a feed exists for
    /// the provider.
    pub async fn link_provider(
        &self,
        user_id: Uuid,
        provider: Provider,
        refresh_token: &RefreshCredential,
    ) -> Result<Feed> {
        self.credentials
            .store_credential(user_id, provider, refresh_token)
            .await
            .with_context(|| format!("storing {provider} credential for user {user_id}"))?;
        let feed = self
            .feeds
            .upsert_feed(user_id, provider)
            .await
            .with_context(|| format!("creating {provider} feed for user {user_id}"))?;
        info!(%user_id, %provider, feed_id = %feed.id, "provider linked");
        Ok(feed)
    }

    pub async fn users_feeds(&self, user_id: Uuid) -> Result<Vec<Feed>, StoreError> {
        self.feeds.feeds_for_user(user_id).await
    }

    pub async fn sync_feed(&self, feed_id: Uuid) -> Result<Feed, SyncError> {
        self.syncer.sync_feed(feed_id).await
    }

    pub async fn stale_feeds(&self) -> Result<Vec<Feed>, SyncError> {
        self.syncer.stale_feeds().await
    }

    pub async fn library(&self, user_id: Uuid) -> Result<Library, StoreError> {
        self.library.library(user_id).await
    }

    /// Task manager with the stale-feed sweep registered. Not started.
    pub fn task_manager(&self, cancellation: &CancellationToken) -> Result<TaskManager> {
        let mut manager = TaskManager::new(self.config.scheduler_config(), cancellation);
        let sweep = SyncStaleFeedsTask::new(
            self.syncer.clone(),
            manager.submitter(),
            self.config.stale_sync_cron.clone(),
        );
        manager
            .register_cron_task(Arc::new(sweep))
            .context("registering stale feed sweep")?;
        Ok(manager)
    }
}
