//! Feed sync tasks run by the [`TaskManager`](crate::scheduler::TaskManager).

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::orchestrator::{FeedSyncer, SyncError};
use crate::scheduler::{SchedulerError, Task, TaskContext, TaskSubmitter};

pub const STALE_FEEDS_TASK: &str = "sync_stale_feeds";

/// Feed ids with a queued or running [`SyncFeedTask`].
#[derive(Debug, Clone, Default)]
pub struct InFlightFeeds(Arc<Mutex<HashSet<Uuid>>>);

impl InFlightFeeds {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn insert(&self, feed_id: Uuid) -> bool {
        self.lock().insert(feed_id)
    }

    fn remove(&self, feed_id: Uuid) {
        self.lock().remove(&feed_id);
    }

    pub fn contains(&self, feed_id: Uuid) -> bool {
        self.lock().contains(&feed_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ad hoc sync of a single feed.
pub struct SyncFeedTask {
    name: String,
    feed_id: Uuid,
    syncer: FeedSyncer,
    in_flight: Option<InFlightFeeds>,
}

impl SyncFeedTask {
    pub fn new(syncer: FeedSyncer, feed_id: Uuid) -> Self {
        Self {
            name: format!("sync_feed:{feed_id}"),
            feed_id,
            syncer,
            in_flight: None,
        }
    }

    fn tracked(syncer: FeedSyncer, feed_id: Uuid, in_flight: InFlightFeeds) -> Self {
        Self {
            in_flight: Some(in_flight),
            ..Self::new(syncer, feed_id)
        }
    }
}

#[async_trait]
impl Task for SyncFeedTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let result = if ctx.is_cancelled() {
            info!(feed_id = %self.feed_id, "shutting down; sync skipped");
            Ok(())
        } else {
            match self.syncer.sync_feed(self.feed_id).await {
                Ok(_) => Ok(()),
                Err(SyncError::AlreadySyncing(feed_id)) => {
                    info!(%feed_id, "feed is already syncing; skipped");
                    Ok(())
                }
                Err(err) => Err(err).with_context(|| format!("syncing feed {}", self.feed_id)),
            }
        };
        if let Some(in_flight) = &self.in_flight {
            in_flight.remove(self.feed_id);
        }
        result
    }
}

/// Recurring task that queues one [`SyncFeedTask`] per stale feed.
pub struct SyncStaleFeedsTask {
    syncer: FeedSyncer,
    submitter: TaskSubmitter,
    schedule: String,
    in_flight: InFlightFeeds,
}

impl SyncStaleFeedsTask {
    pub fn new(syncer: FeedSyncer, submitter: TaskSubmitter, schedule: impl Into<String>) -> Self {
        Self {
            syncer,
            submitter,
            schedule: schedule.into(),
            in_flight: InFlightFeeds::default(),
        }
    }

    pub fn in_flight(&self) -> &InFlightFeeds {
        &self.in_flight
    }
}

#[async_trait]
impl Task for SyncStaleFeedsTask {
    fn name(&self) -> &str {
        STALE_FEEDS_TASK
    }

    fn schedule(&self) -> Option<String> {
        Some(self.schedule.clone())
    }

    async fn run(&self, ctx: &TaskContext) -> anyhow::Result<()> {
        let stale = self
            .syncer
            .stale_feeds()
            .await
            .context("listing stale feeds")?;

        let mut queued = 0usize;
        let mut skipped = 0usize;
        for feed in &stale {
            if ctx.is_cancelled() {
                break;
            }
            if !self.in_flight.insert(feed.id) {
                skipped += 1;
                continue;
            }
            let task = SyncFeedTask::tracked(self.syncer.clone(), feed.id, self.in_flight.clone());
            match self.submitter.submit(Arc::new(task)) {
                Ok(()) => queued += 1,
                Err(SchedulerError::QueueFull) => {
                    self.in_flight.remove(feed.id);
                    warn!(
                        stale = stale.len(),
                        queued, "ad hoc queue full; remaining feeds wait for the next tick"
                    );
                    break;
                }
                Err(err) => {
                    self.in_flight.remove(feed.id);
                    return Err(err).context("queueing feed sync");
                }
            }
        }

        info!(stale = stale.len(), queued, skipped, "stale feed sweep done");
        Ok(())
    }
}
