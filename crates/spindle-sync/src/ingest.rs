//! Transactional merge of mapped albums into the catalog.

use std::sync::Arc;

use serde::Serialize;
use spindle_core::Album;
use spindle_storage::{CatalogStore, CatalogTransaction, StoreError};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("opening ingestion transaction: {0}")]
    Begin(#[source] StoreError),
    #[error("ingesting album {external_id}: {source}")]
    Album {
        external_id: String,
        #[source]
        source: StoreError,
    },
    #[error("committing ingestion transaction: {0}")]
    Commit(#[source] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub albums: usize,
    pub artists: usize,
    pub tracks: usize,
    pub releases: usize,
}

#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn CatalogStore>,
}

impl Ingestor {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    /// All or nothing: the first failing album rolls back the whole batch.
    pub async fn ingest_albums(
        &self,
        user_id: Uuid,
        albums: &[Album],
    ) -> Result<IngestSummary, IngestError> {
        let mut tx = self.store.begin().await.map_err(IngestError::Begin)?;
        let mut summary = IngestSummary::default();

        for album in albums {
            if let Err(source) = ingest_album(tx.as_mut(), user_id, album, &mut summary).await {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed ingestion also failed");
                }
                return Err(IngestError::Album {
                    external_id: album.external_id.clone(),
                    source,
                });
            }
        }

        tx.commit().await.map_err(IngestError::Commit)?;
        debug!(%user_id, ?summary, "ingested batch");
        Ok(summary)
    }
}

async fn ingest_album(
    tx: &mut dyn CatalogTransaction,
    user_id: Uuid,
    album: &Album,
    summary: &mut IngestSummary,
) -> Result<(), StoreError> {
    let stored = tx.get_or_create_album(album).await?;
    summary.albums += 1;

    for (position, track) in album.tracks.iter().enumerate() {
        let track = tx.get_or_create_track(track).await?;
        tx.link_album_track(stored.id, track.id, position as i32).await?;
        summary.tracks += 1;
    }

    for (position, artist) in album.artists.iter().enumerate() {
        let artist = tx.get_or_create_artist(artist).await?;
        tx.link_album_artist(stored.id, artist.id, position as i32).await?;
        summary.artists += 1;
    }

    for release in &album.releases {
        let candidate = spindle_core::Release {
            album_id: stored.id,
            ..release.clone()
        };
        let release = tx.get_or_create_release(&candidate).await?;
        tx.upsert_user_release(user_id, release.id, candidate.added_at)
            .await?;
        summary.releases += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use spindle_core::{Artist, Provider, Release, ReleaseFormat, Track};
    use spindle_storage::{CatalogCounts, MemoryStore};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, day, 12, 0, 0).single().unwrap()
    }

    fn album(external_id: &str, added_at: Option<DateTime<Utc>>) -> Album {
        let id = Uuid::new_v4();
        Album {
            id,
            provider: Provider::Spotify,
            external_id: external_id.into(),
            title: external_id.to_uppercase(),
            artists: vec![Artist {
                id: Uuid::new_v4(),
                provider: Provider::Spotify,
                external_id: "shared-artist".into(),
                name: "Shared".into(),
            }],
            tracks: vec![Track {
                id: Uuid::new_v4(),
                provider: Provider::Spotify,
                external_id: format!("{external_id}-t1"),
                title: "One".into(),
            }],
            releases: vec![Release {
                id: Uuid::new_v4(),
                album_id: id,
                format: ReleaseFormat::Digital,
                added_at,
            }],
        }
    }

    #[tokio::test]
    async fn ingesting_twice_creates_no_duplicates() {
        let store = MemoryStore::new();
        let ingestor = Ingestor::new(Arc::new(store.clone()));
        let user = Uuid::new_v4();

        ingestor
            .ingest_albums(user, &[album("a", Some(at(1))), album("b", None)])
            .await
            .unwrap();
        let second = ingestor
            .ingest_albums(user, &[album("a", Some(at(9))), album("b", None)])
            .await
            .unwrap();
        assert_eq!(second.albums, 2);

        let counts = store.catalog_counts().await;
        assert_eq!(
            counts,
            CatalogCounts {
                albums: 2,
                artists: 1,
                tracks: 2,
                releases: 2,
                user_releases: 2,
                album_artists: 2,
                album_tracks: 2,
            }
        );

        let owned = store.user_releases(user).await.unwrap();
        let dated: Vec<_> = owned.iter().filter_map(|r| r.added_at).collect();
        assert_eq!(dated, vec![at(9)]);
    }

    #[tokio::test]
    async fn failure_rolls_back_the_whole_batch() {
        let store = MemoryStore::new();
        store.reject_external_id("b-t1").await;
        let ingestor = Ingestor::new(Arc::new(store.clone()));

        let err = ingestor
            .ingest_albums(Uuid::new_v4(), &[album("a", None), album("b", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Album { ref external_id, .. } if external_id == "b"));
        assert_eq!(store.catalog_counts().await, CatalogCounts::default());
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let store = MemoryStore::new();
        let ingestor = Ingestor::new(Arc::new(store.clone()));
        let summary = ingestor.ingest_albums(Uuid::new_v4(), &[]).await.unwrap();
        assert_eq!(summary, IngestSummary::default());
    }
}
