use std::collections::HashMap;
use std::sync::Arc;

use spindle_core::{Album, Library};
use spindle_storage::{CatalogStore, StoreError};
use tracing::debug;
use uuid::Uuid;

/// Assembles a user's [`Library`] from the catalog with a fixed number of
/// batch reads, independent of library size.
#[derive(Clone)]
pub struct LibraryReader {
    store: Arc<dyn CatalogStore>,
}

impl LibraryReader {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    pub async fn library(&self, user_id: Uuid) -> Result<Library, StoreError> {
        let releases = self.store.user_releases(user_id).await?;
        let mut album_ids: Vec<Uuid> = releases.iter().map(|r| r.album_id).collect();
        album_ids.sort();
        album_ids.dedup();

        let albums = self.store.albums_by_ids(&album_ids).await?;
        let artists = self.store.album_artists(&album_ids).await?;
        let tracks = self.store.album_tracks(&album_ids).await?;

        let mut by_id: HashMap<Uuid, Album> = albums.into_iter().map(|a| (a.id, a)).collect();
        for release in releases {
            if let Some(album) = by_id.get_mut(&release.album_id) {
                album.releases.push(release);
            }
        }
        for (album_id, artist) in artists {
            if let Some(album) = by_id.get_mut(&album_id) {
                album.artists.push(artist);
            }
        }
        for (album_id, track) in tracks {
            if let Some(album) = by_id.get_mut(&album_id) {
                album.tracks.push(track);
            }
        }

        let mut albums: Vec<Album> = by_id.into_values().collect();
        albums.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
        debug!(%user_id, albums = albums.len(), "library loaded");
        Ok(Library::new(user_id, albums))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Ingestor;
    use crate::mapping::map_remote_albums;
    use spindle_adapters::{RemoteAlbum, RemoteArtist, RemoteTrack};
    use spindle_core::Provider;
    use spindle_storage::MemoryStore;

    fn remote(id: &str, artist: &str, added_at: &str) -> RemoteAlbum {
        RemoteAlbum {
            external_id: id.into(),
            title: id.to_uppercase(),
            artists: vec![RemoteArtist {
                external_id: artist.into(),
                name: artist.into(),
            }],
            tracks: vec![RemoteTrack {
                external_id: format!("{id}-1"),
                title: "Opener".into(),
            }],
            added_at: added_at.into(),
        }
    }

    #[tokio::test]
    async fn library_only_contains_the_users_albums() {
        let store = MemoryStore::new();
        let ingestor = Ingestor::new(Arc::new(store.clone()));
        let reader = LibraryReader::new(Arc::new(store.clone()));
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let albums = map_remote_albums(
            Provider::Spotify,
            &[
                remote("x", "same", "2026-01-01T00:00:00Z"),
                remote("y", "same", "garbage"),
            ],
        );
        ingestor.ingest_albums(alice, &albums).await.unwrap();
        ingestor
            .ingest_albums(bob, &albums[..1])
            .await
            .unwrap();

        let lib = reader.library(alice).await.unwrap();
        assert_eq!(lib.owner_user_id, alice);
        assert_eq!(lib.albums.len(), 2);
        assert_eq!(lib.artists.len(), 1);
        assert_eq!(lib.tracks.len(), 2);
        assert!(lib.albums.iter().all(|a| a.releases.len() == 1));

        let bobs = reader.library(bob).await.unwrap();
        assert_eq!(bobs.albums.len(), 1);
        assert_eq!(bobs.albums[0].title, "X");
    }

    #[tokio::test]
    async fn empty_library_for_unknown_user() {
        let store = MemoryStore::new();
        let reader = LibraryReader::new(Arc::new(store));
        let lib = reader.library(Uuid::new_v4()).await.unwrap();
        assert!(lib.albums.is_empty());
    }
}
