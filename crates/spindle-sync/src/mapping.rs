//! Provider shapes to catalog entities. Every entity gets a fresh local id;
//! ingestion swaps in the established id when the external id is known.

use spindle_adapters::RemoteAlbum;
use spindle_core::{Album, Artist, Provider, Release, ReleaseFormat, Track};
use tracing::warn;
use uuid::Uuid;

pub fn map_remote_album(provider: Provider, remote: &RemoteAlbum) -> Album {
    let album_id = Uuid::new_v4();
    let added_at = remote.parsed_added_at();
    if added_at.is_none() {
        warn!(
            external_id = %remote.external_id,
            added_at = %remote.added_at,
            "unparsable added_at; ingesting release without a timestamp"
        );
    }

    Album {
        id: album_id,
        provider,
        external_id: remote.external_id.clone(),
        title: remote.title.clone(),
        artists: remote
            .artists
            .iter()
            .map(|a| Artist {
                id: Uuid::new_v4(),
                provider,
                external_id: a.external_id.clone(),
                name: a.name.clone(),
            })
            .collect(),
        tracks: remote
            .tracks
            .iter()
            .map(|t| Track {
                id: Uuid::new_v4(),
                provider,
                external_id: t.external_id.clone(),
                title: t.title.clone(),
            })
            .collect(),
        releases: vec![Release {
            id: Uuid::new_v4(),
            album_id,
            format: ReleaseFormat::Digital,
            added_at,
        }],
    }
}

pub fn map_remote_albums(provider: Provider, remote: &[RemoteAlbum]) -> Vec<Album> {
    remote.iter().map(|r| map_remote_album(provider, r)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use spindle_adapters::{RemoteArtist, RemoteTrack};

    fn remote(added_at: &str) -> RemoteAlbum {
        RemoteAlbum {
            external_id: "alb".into(),
            title: "Album".into(),
            artists: vec![RemoteArtist {
                external_id: "art".into(),
                name: "Artist".into(),
            }],
            tracks: vec![RemoteTrack {
                external_id: "trk".into(),
                title: "Track".into(),
            }],
            added_at: added_at.into(),
        }
    }

    #[test]
    fn maps_one_digital_release_with_timestamp() {
        let album = map_remote_album(Provider::Spotify, &remote("2026-02-01T10:00:00Z"));
        assert_eq!(album.releases.len(), 1);
        let release = &album.releases[0];
        assert_eq!(release.album_id, album.id);
        assert_eq!(release.format, ReleaseFormat::Digital);
        assert_eq!(
            release.added_at,
            Utc.with_ymd_and_hms(2026, 2, 1, 10, 0, 0).single()
        );
        assert_eq!(album.artists[0].provider, Provider::Spotify);
        assert_eq!(album.tracks[0].external_id, "trk");
    }

    #[test]
    fn malformed_timestamp_still_maps() {
        let album = map_remote_album(Provider::Spotify, &remote("last tuesday"));
        assert_eq!(album.releases.len(), 1);
        assert!(album.releases[0].added_at.is_none());
    }

    #[test]
    fn every_mapping_gets_fresh_ids() {
        let a = map_remote_album(Provider::Spotify, &remote("2026-02-01T10:00:00Z"));
        let b = map_remote_album(Provider::Spotify, &remote("2026-02-01T10:00:00Z"));
        assert_ne!(a.id, b.id);
        assert_ne!(a.artists[0].id, b.artists[0].id);
    }
}
