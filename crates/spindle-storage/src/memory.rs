//! In-process store used by tests and `--fixture` runs.
//!
//! A catalog transaction takes the catalog lock for its whole lifetime and
//! writes into a private copy of the tables. `commit` swaps the copy in;
//! dropping the transaction leaves the shared tables untouched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spindle_core::{
    Album, Artist, Feed, Provider, Release, ReleaseFormat, SyncStatus, Track, UserRelease,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    CatalogStore, CatalogTransaction, CredentialError, CredentialResolver, CredentialStore,
    FeedStore, RefreshCredential, StoreError,
};

type ExternalKey = (Provider, String);

#[derive(Debug, Clone, Default)]
struct CatalogTables {
    albums: HashMap<Uuid, Album>,
    album_keys: HashMap<ExternalKey, Uuid>,
    artists: HashMap<Uuid, Artist>,
    artist_keys: HashMap<ExternalKey, Uuid>,
    tracks: HashMap<Uuid, Track>,
    track_keys: HashMap<ExternalKey, Uuid>,
    album_artists: HashMap<(Uuid, Uuid), i32>,
    album_tracks: HashMap<(Uuid, Uuid), i32>,
    releases: HashMap<Uuid, Release>,
    release_keys: HashMap<(Uuid, ReleaseFormat), Uuid>,
    user_releases: HashMap<(Uuid, Uuid), UserRelease>,
    rejected_external_ids: HashSet<String>,
}

impl CatalogTables {
    fn check_rejected(&self, entity: &'static str, external_id: &str) -> Result<(), StoreError> {
        if self.rejected_external_ids.contains(external_id) {
            return Err(StoreError::Rejected {
                entity,
                key: external_id.to_string(),
            });
        }
        Ok(())
    }
}

/// Row counts per catalog table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogCounts {
    pub albums: usize,
    pub artists: usize,
    pub tracks: usize,
    pub releases: usize,
    pub user_releases: usize,
    pub album_artists: usize,
    pub album_tracks: usize,
}

/// Credentials are kept in plaintext; nothing here outlives the process.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    catalog: Arc<Mutex<CatalogTables>>,
    feeds: Arc<Mutex<HashMap<Uuid, Feed>>>,
    credentials: Arc<Mutex<HashMap<(Uuid, Provider), String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later get-or-create of an album, artist or track with this
    /// external id fail with [`StoreError::Rejected`].
    pub async fn reject_external_id(&self, external_id: impl Into<String>) {
        self.catalog
            .lock()
            .await
            .rejected_external_ids
            .insert(external_id.into());
    }

    pub async fn catalog_counts(&self) -> CatalogCounts {
        let tables = self.catalog.lock().await;
        CatalogCounts {
            albums: tables.albums.len(),
            artists: tables.artists.len(),
            tracks: tables.tracks.len(),
            releases: tables.releases.len(),
            user_releases: tables.user_releases.len(),
            album_artists: tables.album_artists.len(),
            album_tracks: tables.album_tracks.len(),
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn CatalogTransaction>, StoreError> {
        let guard = self.catalog.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, working }))
    }

    async fn user_releases(&self, user_id: Uuid) -> Result<Vec<Release>, StoreError> {
        let tables = self.catalog.lock().await;
        let mut releases: Vec<Release> = tables
            .user_releases
            .values()
            .filter(|ur| ur.user_id == user_id)
            .filter_map(|ur| {
                tables.releases.get(&ur.release_id).map(|r| Release {
                    added_at: ur.added_at,
                    ..r.clone()
                })
            })
            .collect();
        releases.sort_by(|a, b| {
            b.added_at
                .is_some()
                .cmp(&a.added_at.is_some())
                .then_with(|| b.added_at.cmp(&a.added_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(releases)
    }

    async fn albums_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Album>, StoreError> {
        let tables = self.catalog.lock().await;
        let mut albums: Vec<Album> = ids
            .iter()
            .collect::<HashSet<_>>()
            .into_iter()
            .filter_map(|id| tables.albums.get(id).cloned())
            .collect();
        albums.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
        Ok(albums)
    }

    async fn album_artists(&self, album_ids: &[Uuid]) -> Result<Vec<(Uuid, Artist)>, StoreError> {
        let tables = self.catalog.lock().await;
        let wanted: HashSet<&Uuid> = album_ids.iter().collect();
        let mut links: Vec<(Uuid, i32, Artist)> = tables
            .album_artists
            .iter()
            .filter(|((album_id, _), _)| wanted.contains(album_id))
            .filter_map(|((album_id, artist_id), position)| {
                tables
                    .artists
                    .get(artist_id)
                    .map(|artist| (*album_id, *position, artist.clone()))
            })
            .collect();
        links.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        Ok(links.into_iter().map(|(album_id, _, artist)| (album_id, artist)).collect())
    }

    async fn album_tracks(&self, album_ids: &[Uuid]) -> Result<Vec<(Uuid, Track)>, StoreError> {
        let tables = self.catalog.lock().await;
        let wanted: HashSet<&Uuid> = album_ids.iter().collect();
        let mut links: Vec<(Uuid, i32, Track)> = tables
            .album_tracks
            .iter()
            .filter(|((album_id, _), _)| wanted.contains(album_id))
            .filter_map(|((album_id, track_id), position)| {
                tables
                    .tracks
                    .get(track_id)
                    .map(|track| (*album_id, *position, track.clone()))
            })
            .collect();
        links.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        Ok(links.into_iter().map(|(album_id, _, track)| (album_id, track)).collect())
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<CatalogTables>,
    working: CatalogTables,
}

#[async_trait]
impl CatalogTransaction for MemoryTransaction {
    async fn get_or_create_album(&mut self, album: &Album) -> Result<Album, StoreError> {
        let tables = &mut self.working;
        tables.check_rejected("album", &album.external_id)?;
        let key = (album.provider, album.external_id.clone());
        if let Some(existing) = tables.album_keys.get(&key).and_then(|id| tables.albums.get(id)) {
            return Ok(existing.clone());
        }
        let row = Album {
            artists: Vec::new(),
            tracks: Vec::new(),
            releases: Vec::new(),
            ..album.clone()
        };
        tables.album_keys.insert(key, row.id);
        tables.albums.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_or_create_artist(&mut self, artist: &Artist) -> Result<Artist, StoreError> {
        let tables = &mut self.working;
        tables.check_rejected("artist", &artist.external_id)?;
        let key = (artist.provider, artist.external_id.clone());
        if let Some(existing) = tables.artist_keys.get(&key).and_then(|id| tables.artists.get(id)) {
            return Ok(existing.clone());
        }
        tables.artist_keys.insert(key, artist.id);
        tables.artists.insert(artist.id, artist.clone());
        Ok(artist.clone())
    }

    async fn get_or_create_track(&mut self, track: &Track) -> Result<Track, StoreError> {
        let tables = &mut self.working;
        tables.check_rejected("track", &track.external_id)?;
        let key = (track.provider, track.external_id.clone());
        if let Some(existing) = tables.track_keys.get(&key).and_then(|id| tables.tracks.get(id)) {
            return Ok(existing.clone());
        }
        tables.track_keys.insert(key, track.id);
        tables.tracks.insert(track.id, track.clone());
        Ok(track.clone())
    }

    async fn link_album_artist(
        &mut self,
        album_id: Uuid,
        artist_id: Uuid,
        position: i32,
    ) -> Result<(), StoreError> {
        self.working
            .album_artists
            .insert((album_id, artist_id), position);
        Ok(())
    }

    async fn link_album_track(
        &mut self,
        album_id: Uuid,
        track_id: Uuid,
        position: i32,
    ) -> Result<(), StoreError> {
        self.working.album_tracks.insert((album_id, track_id), position);
        Ok(())
    }

    async fn get_or_create_release(&mut self, release: &Release) -> Result<Release, StoreError> {
        let tables = &mut self.working;
        if !tables.albums.contains_key(&release.album_id) {
            return Err(StoreError::NotFound {
                entity: "album",
                key: release.album_id.to_string(),
            });
        }
        let key = (release.album_id, release.format);
        let stored = match tables.release_keys.get(&key).and_then(|id| tables.releases.get(id)) {
            Some(existing) => existing.clone(),
            None => {
                let row = Release {
                    added_at: None,
                    ..release.clone()
                };
                tables.release_keys.insert(key, row.id);
                tables.releases.insert(row.id, row.clone());
                row
            }
        };
        Ok(Release {
            added_at: release.added_at,
            ..stored
        })
    }

    async fn upsert_user_release(
        &mut self,
        user_id: Uuid,
        release_id: Uuid,
        added_at: Option<DateTime<Utc>>,
    ) -> Result<UserRelease, StoreError> {
        if !self.working.releases.contains_key(&release_id) {
            return Err(StoreError::NotFound {
                entity: "release",
                key: release_id.to_string(),
            });
        }
        let row = self
            .working
            .user_releases
            .entry((user_id, release_id))
            .and_modify(|existing| {
                if added_at.is_some() {
                    existing.added_at = added_at;
                }
            })
            .or_insert_with(|| UserRelease {
                id: Uuid::new_v4(),
                user_id,
                release_id,
                added_at,
            });
        Ok(row.clone())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl FeedStore for MemoryStore {
    async fn upsert_feed(&self, user_id: Uuid, kind: Provider) -> Result<Feed, StoreError> {
        let mut feeds = self.feeds.lock().await;
        if let Some(existing) = feeds
            .values()
            .find(|f| f.user_id == user_id && f.kind == kind)
        {
            return Ok(existing.clone());
        }
        let feed = Feed::new(user_id, kind);
        feeds.insert(feed.id, feed.clone());
        Ok(feed)
    }

    async fn get_feed(&self, id: Uuid) -> Result<Option<Feed>, StoreError> {
        Ok(self.feeds.lock().await.get(&id).cloned())
    }

    async fn feeds_for_user(&self, user_id: Uuid) -> Result<Vec<Feed>, StoreError> {
        let feeds = self.feeds.lock().await;
        let mut found: Vec<Feed> = feeds
            .values()
            .filter(|f| f.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|f| f.kind.as_str());
        Ok(found)
    }

    async fn feeds_completed_before(
        &self,
        kind: Provider,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Feed>, StoreError> {
        let feeds = self.feeds.lock().await;
        let mut found: Vec<Feed> = feeds
            .values()
            .filter(|f| f.kind == kind && f.sync_status != SyncStatus::None)
            .filter(|f| f.last_sync_completed_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect();
        found.sort_by_key(|f| f.last_sync_completed_at);
        Ok(found)
    }

    async fn claim_for_sync(
        &self,
        feed: &Feed,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<Option<Feed>, StoreError> {
        let mut feeds = self.feeds.lock().await;
        let Some(stored) = feeds.get_mut(&feed.id) else {
            return Ok(None);
        };
        let held = stored.sync_status == SyncStatus::Pending
            && stored
                .last_sync_started_at
                .is_some_and(|started| started >= lease_cutoff);
        if held {
            return Ok(None);
        }
        stored.sync_status = feed.sync_status;
        stored.last_sync_started_at = feed.last_sync_started_at;
        Ok(Some(stored.clone()))
    }

    async fn finish_sync(
        &self,
        feed: &Feed,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<Feed>, StoreError> {
        let mut feeds = self.feeds.lock().await;
        let Some(stored) = feeds.get_mut(&feed.id) else {
            return Ok(None);
        };
        if stored.sync_status != SyncStatus::Pending
            || stored.last_sync_started_at != Some(claimed_at)
        {
            return Ok(None);
        }
        stored.sync_status = feed.sync_status;
        stored.last_sync_completed_at = feed.last_sync_completed_at;
        stored.last_sync_succeeded_at = feed.last_sync_succeeded_at;
        Ok(Some(stored.clone()))
    }
}

#[async_trait]
impl CredentialResolver for MemoryStore {
    async fn resolve(
        &self,
        user_id: Uuid,
        provider: Provider,
    ) -> Result<RefreshCredential, CredentialError> {
        self.credentials
            .lock()
            .await
            .get(&(user_id, provider))
            .map(RefreshCredential::new)
            .ok_or(CredentialError::NotLinked { user_id, provider })
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn store_credential(
        &self,
        user_id: Uuid,
        provider: Provider,
        refresh_token: &RefreshCredential,
    ) -> Result<(), CredentialError> {
        self.credentials
            .lock()
            .await
            .insert((user_id, provider), refresh_token.expose().to_string());
        Ok(())
    }
}
