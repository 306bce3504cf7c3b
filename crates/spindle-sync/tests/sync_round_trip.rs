use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, TimeZone, Utc};
use spindle_adapters::FixtureProvider;
use spindle_core::{Clock, ManualClock, Provider, SortKey, SyncStatus};
use spindle_storage::{FeedStore, MemoryStore, RefreshCredential};
use spindle_sync::{SyncConfig, SyncError, SyncFeedTask, SyncService, Trigger};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct World {
    store: Arc<MemoryStore>,
    clock: ManualClock,
    provider: FixtureProvider,
    service: SyncService,
}

fn world() -> World {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/spotify/library.json");
    let provider = FixtureProvider::from_path(path).expect("fixture provider");
    let store = Arc::new(MemoryStore::new());
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
    let service = SyncService::new(
        SyncConfig::default(),
        Arc::clone(&store),
        Arc::new(provider.clone()),
        Arc::new(clock.clone()),
    );
    World {
        store,
        clock,
        provider,
        service,
    }
}

fn titles(albums: &[spindle_core::Album]) -> Vec<&str> {
    albums.iter().map(|a| a.title.as_str()).collect()
}

#[tokio::test]
async fn first_sync_mirrors_the_whole_library() {
    let w = world();
    let user = Uuid::new_v4();
    let feed = w
        .service
        .link_provider(user, Provider::Spotify, &RefreshCredential::new("refresh"))
        .await
        .unwrap();

    let synced = w.service.sync_feed(feed.id).await.unwrap();
    assert_eq!(synced.sync_status, SyncStatus::Success);

    let mut library = w.service.library(user).await.unwrap();
    assert_eq!(library.albums.len(), 4);
    assert_eq!(library.artists.len(), 2);
    assert_eq!(library.tracks.len(), 8);

    library.sort(SortKey::Date, true);
    assert_eq!(
        titles(&library.albums),
        vec![
            "Abbey Road",
            "OK Computer",
            "Discovery",
            "Random Access Memories"
        ]
    );

    library.sort(SortKey::Artist, true);
    assert_eq!(
        titles(&library.albums),
        vec![
            "Discovery",
            "Random Access Memories",
            "OK Computer",
            "Abbey Road"
        ]
    );
}

#[tokio::test]
async fn incremental_sync_adds_no_duplicates() {
    let w = world();
    let user = Uuid::new_v4();
    let feed = w
        .service
        .link_provider(user, Provider::Spotify, &RefreshCredential::new("refresh"))
        .await
        .unwrap();
    w.service.sync_feed(feed.id).await.unwrap();
    let before = w.store.catalog_counts().await;

    w.clock.advance(TimeDelta::hours(25));
    assert_eq!(w.service.stale_feeds().await.unwrap().len(), 1);
    let synced = w.service.sync_feed(feed.id).await.unwrap();
    assert_eq!(synced.last_sync_succeeded_at, Some(w.clock.now()));

    assert_eq!(w.store.catalog_counts().await, before);
    assert_eq!(w.provider.calls(), 2);
    assert!(w.service.stale_feeds().await.unwrap().is_empty());
}

#[tokio::test]
async fn non_spotify_feed_is_rejected_without_writes() {
    let w = world();
    let feed = w
        .store
        .upsert_feed(Uuid::new_v4(), Provider::Discogs)
        .await
        .unwrap();

    let err = w.service.sync_feed(feed.id).await.unwrap_err();
    assert!(matches!(err, SyncError::WrongFeedKind { .. }));
    assert_eq!(w.store.get_feed(feed.id).await.unwrap(), Some(feed));
    assert_eq!(w.store.catalog_counts().await.albums, 0);
    assert_eq!(w.provider.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ad_hoc_sync_runs_through_the_task_manager() {
    let w = world();
    let user = Uuid::new_v4();
    let feed = w
        .service
        .link_provider(user, Provider::Spotify, &RefreshCredential::new("refresh"))
        .await
        .unwrap();

    let mut manager = w.service.task_manager(&CancellationToken::new()).unwrap();
    let mut outcomes = manager.subscribe();
    manager.start().await.unwrap();

    // One bad feed id, then the real one.
    manager
        .submit(Arc::new(SyncFeedTask::new(
            w.service.syncer().clone(),
            Uuid::new_v4(),
        )))
        .unwrap();
    manager
        .submit(Arc::new(SyncFeedTask::new(
            w.service.syncer().clone(),
            feed.id,
        )))
        .unwrap();

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
            .await
            .expect("outcome in time")
            .expect("channel open");
        seen.push(outcome);
    }
    manager.stop().await;

    assert!(seen.iter().all(|o| o.trigger == Trigger::AdHoc));
    assert_eq!(seen.iter().filter(|o| o.succeeded()).count(), 1);
    let stored = w.store.get_feed(feed.id).await.unwrap().unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Success);
    assert_eq!(w.service.library(user).await.unwrap().albums.len(), 4);
}
