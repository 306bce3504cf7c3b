//! Drives one feed through a sync attempt.

use std::sync::Arc;

use chrono::TimeDelta;
use spindle_adapters::{ProviderClient, ProviderError, RetryDisposition};
use spindle_core::{Clock, Feed, Provider, SyncStatus};
use spindle_storage::{CredentialError, CredentialResolver, FeedStore, StoreError};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ingest::{IngestError, Ingestor};
use crate::mapping::map_remote_albums;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("feed {0} not found")]
    FeedNotFound(Uuid),
    #[error("feed {feed_id} is a {actual} feed; this syncer handles {expected}")]
    WrongFeedKind {
        feed_id: Uuid,
        expected: Provider,
        actual: Provider,
    },
    #[error("feed {0} is already being synced")]
    AlreadySyncing(Uuid),
    #[error("feed {0} was claimed by another sync before this one finished")]
    ClaimLost(Uuid),
    #[error("resolving credential for feed {feed_id}: {source}")]
    Credential {
        feed_id: Uuid,
        #[source]
        source: CredentialError,
    },
    #[error("fetching from provider for feed {feed_id}: {source}")]
    Provider {
        feed_id: Uuid,
        #[source]
        source: ProviderError,
    },
    #[error("ingesting feed {feed_id}: {source}")]
    Ingest {
        feed_id: Uuid,
        #[source]
        source: IngestError,
    },
    #[error("feed storage: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Whether a later scheduled attempt could succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::FeedNotFound(_) | Self::WrongFeedKind { .. } => false,
            Self::AlreadySyncing(_) | Self::ClaimLost(_) => true,
            Self::Credential { source, .. } => matches!(source, CredentialError::Store(_)),
            Self::Provider { source, .. } => {
                source.disposition() == RetryDisposition::Retryable
            }
            Self::Ingest { .. } | Self::Store(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SyncPolicy {
    pub min_stale: TimeDelta,
    pub overlap: TimeDelta,
    pub lease: TimeDelta,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            min_stale: spindle_core::DEFAULT_MIN_STALE,
            overlap: spindle_core::DEFAULT_SYNC_OVERLAP,
            lease: TimeDelta::hours(1),
        }
    }
}

/// Syncs feeds of the kind its provider serves.
#[derive(Clone)]
pub struct FeedSyncer {
    feeds: Arc<dyn FeedStore>,
    credentials: Arc<dyn CredentialResolver>,
    provider: Arc<dyn ProviderClient>,
    ingestor: Ingestor,
    clock: Arc<dyn Clock>,
    policy: SyncPolicy,
}

impl FeedSyncer {
    pub fn new(
        feeds: Arc<dyn FeedStore>,
        credentials: Arc<dyn CredentialResolver>,
        provider: Arc<dyn ProviderClient>,
        ingestor: Ingestor,
        clock: Arc<dyn Clock>,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            feeds,
            credentials,
            provider,
            ingestor,
            clock,
            policy,
        }
    }

    pub fn kind(&self) -> Provider {
        self.provider.provider()
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    pub async fn sync_feed(&self, feed_id: Uuid) -> Result<Feed, SyncError> {
        let span = info_span!("sync_feed", %feed_id, kind = %self.kind());
        self.sync_feed_inner(feed_id).instrument(span).await
    }

    async fn sync_feed_inner(&self, feed_id: Uuid) -> Result<Feed, SyncError> {
        let mut feed = self
            .feeds
            .get_feed(feed_id)
            .await?
            .ok_or(SyncError::FeedNotFound(feed_id))?;

        if feed.kind != self.kind() {
            return Err(SyncError::WrongFeedKind {
                feed_id,
                expected: self.kind(),
                actual: feed.kind,
            });
        }

        let now = self.clock.now();
        let window = feed.sync_window(now, self.policy.overlap);
        feed.mark_syncing(now);
        let mut feed = self
            .feeds
            .claim_for_sync(&feed, now - self.policy.lease)
            .await?
            .ok_or(SyncError::AlreadySyncing(feed_id))?;

        info!(
            since = ?window.map(|w| w.since),
            until = %now,
            "sync started"
        );

        let claimed_at = feed.last_sync_started_at.unwrap_or(now);

        match self.fetch_and_ingest(&feed, window.as_ref()).await {
            Ok(albums) => {
                feed.mark_success(self.clock.now());
                let feed = self
                    .feeds
                    .finish_sync(&feed, claimed_at)
                    .await?
                    .ok_or_else(|| {
                        warn!(albums, "sync finished after its claim was taken over");
                        SyncError::ClaimLost(feed_id)
                    })?;
                info!(albums, "sync succeeded");
                Ok(feed)
            }
            Err(err) => {
                feed.mark_failure(self.clock.now());
                match self.feeds.finish_sync(&feed, claimed_at).await {
                    Ok(Some(_)) => {}
                    Ok(None) => warn!("sync failure not recorded; claim was taken over"),
                    Err(store_err) => {
                        error!(error = %store_err, "could not record sync failure")
                    }
                }
                warn!(error = %err, retryable = err.is_retryable(), "sync failed");
                Err(err)
            }
        }
    }

    async fn fetch_and_ingest(
        &self,
        feed: &Feed,
        window: Option<&spindle_core::SyncWindow>,
    ) -> Result<usize, SyncError> {
        let credential = self
            .credentials
            .resolve(feed.user_id, feed.kind)
            .await
            .map_err(|source| SyncError::Credential {
                feed_id: feed.id,
                source,
            })?;

        let remote = self
            .provider
            .fetch_saved_albums(&credential, window)
            .await
            .map_err(|source| SyncError::Provider {
                feed_id: feed.id,
                source,
            })?;

        let albums = map_remote_albums(feed.kind, &remote);
        self.ingestor
            .ingest_albums(feed.user_id, &albums)
            .await
            .map_err(|source| SyncError::Ingest {
                feed_id: feed.id,
                source,
            })?;
        Ok(albums.len())
    }

    /// Feeds of this syncer's kind that are stale and not mid-sync.
    pub async fn stale_feeds(&self) -> Result<Vec<Feed>, SyncError> {
        let now = self.clock.now();
        let candidates = self
            .feeds
            .feeds_completed_before(self.kind(), now - self.policy.min_stale)
            .await?;
        Ok(candidates
            .into_iter()
            .filter(|f| f.sync_status != SyncStatus::Pending)
            .filter(|f| f.is_stale(now, self.policy.min_stale))
            .collect())
    }
}
