//! Spotify Web API client.
//!
//! Each fetch exchanges the stored refresh token for a short-lived access token
//! first; tokens are not cached between syncs.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use spindle_core::{Provider, SyncWindow};
use spindle_storage::RefreshCredential;
use tracing::{debug, info_span, Instrument};

use crate::http::{build_client, HttpClientConfig};
use crate::{
    in_window, ProviderClient, ProviderError, RemoteAlbum, RemoteArtist, RemotePlayEvent,
    RemoteTrack,
};

pub const PAGE_LIMIT: usize = 50;
pub const DEFAULT_MAX_SAVED_ALBUMS: usize = 1000;

#[derive(Debug, Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
    pub api_base: String,
    pub accounts_base: String,
    pub max_saved_albums: usize,
    pub http: HttpClientConfig,
}

impl SpotifyConfig {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_base: "https://api.spotify.com".to_string(),
            accounts_base: "https://accounts.spotify.com".to_string(),
            max_saved_albums: DEFAULT_MAX_SAVED_ALBUMS,
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpotifyClient {
    client: reqwest::Client,
    config: SpotifyConfig,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    items: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SavedAlbumItem {
    added_at: String,
    album: ApiAlbum,
}

#[derive(Debug, Deserialize)]
struct ApiAlbum {
    id: String,
    name: String,
    #[serde(default)]
    artists: Vec<ApiArtist>,
    tracks: Option<Page<ApiTrack>>,
}

#[derive(Debug, Deserialize)]
struct ApiArtist {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiTrack {
    id: Option<String>,
    name: String,
    album: Option<ApiAlbumRef>,
}

#[derive(Debug, Deserialize)]
struct ApiAlbumRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PlayHistoryItem {
    track: ApiTrack,
    played_at: DateTime<Utc>,
}

impl ApiTrack {
    // Local files carry no id and cannot be deduplicated.
    fn into_remote(self) -> Option<RemoteTrack> {
        Some(RemoteTrack {
            external_id: self.id?,
            title: self.name,
        })
    }
}

impl SpotifyClient {
    pub fn new(config: SpotifyConfig) -> anyhow::Result<Self> {
        let client = build_client(&config.http)?;
        Ok(Self { client, config })
    }

    async fn access_token(&self, credential: &RefreshCredential) -> Result<String, ProviderError> {
        let url = format!("{}/api/token", self.config.accounts_base);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", credential.expose()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Auth(body));
        }
        let token: TokenResponse = decode(response, &url).await?;
        Ok(token.access_token)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        url: &str,
    ) -> Result<T, ProviderError> {
        let response = request.send().await?;
        decode(response, url).await
    }

    fn get(&self, token: &str, url: &str) -> RequestBuilder {
        self.client.get(url).bearer_auth(token)
    }

    async fn album_tracks(
        &self,
        token: &str,
        tracks: Option<Page<ApiTrack>>,
    ) -> Result<Vec<RemoteTrack>, ProviderError> {
        let Some(mut page) = tracks else {
            return Ok(Vec::new());
        };
        let mut collected: Vec<RemoteTrack> = Vec::new();
        loop {
            collected.extend(page.items.into_iter().filter_map(ApiTrack::into_remote));
            let Some(next) = page.next else {
                break;
            };
            page = self.get_json(self.get(token, &next), &next).await?;
        }
        Ok(collected)
    }

    async fn saved_albums(
        &self,
        token: &str,
        window: Option<&SyncWindow>,
    ) -> Result<Vec<RemoteAlbum>, ProviderError> {
        let url = format!("{}/v1/me/albums", self.config.api_base);
        let mut albums = Vec::new();
        let mut offset = 0usize;

        while offset < self.config.max_saved_albums {
            let request = self
                .get(token, &url)
                .query(&[("limit", PAGE_LIMIT), ("offset", offset)]);
            let page: Page<SavedAlbumItem> = self.get_json(request, &url).await?;
            if page.items.is_empty() {
                break;
            }
            offset += page.items.len();
            let full_page = page.items.len() >= PAGE_LIMIT;

            let mut reached_window_start = false;
            for item in page.items {
                let album = RemoteAlbum {
                    external_id: item.album.id,
                    title: item.album.name,
                    artists: item
                        .album
                        .artists
                        .into_iter()
                        .map(|a| RemoteArtist {
                            external_id: a.id,
                            name: a.name,
                        })
                        .collect(),
                    tracks: self.album_tracks(token, item.album.tracks).await?,
                    added_at: item.added_at,
                };
                if in_window(&album, window) {
                    albums.push(album);
                } else {
                    reached_window_start = true;
                }
            }

            debug!(offset, kept = albums.len(), "fetched saved album page");
            if reached_window_start || !full_page || page.next.is_none() {
                break;
            }
        }

        albums.truncate(self.config.max_saved_albums);
        Ok(albums)
    }

    async fn recently_played(
        &self,
        token: &str,
        window: &SyncWindow,
    ) -> Result<Vec<RemotePlayEvent>, ProviderError> {
        let url = format!("{}/v1/me/player/recently-played", self.config.api_base);
        let mut events = Vec::new();
        let mut before = window.until.timestamp_millis();

        loop {
            let request = self
                .get(token, &url)
                .query(&[("limit", PAGE_LIMIT as i64), ("before", before)]);
            let page: Page<PlayHistoryItem> = self.get_json(request, &url).await?;
            if page.items.is_empty() {
                break;
            }

            let mut oldest = before;
            for item in page.items {
                oldest = oldest.min(item.played_at.timestamp_millis());
                if !window.contains(item.played_at) || item.played_at > window.until {
                    continue;
                }
                let album_external_id = item.track.album.as_ref().map(|a| a.id.clone());
                if let Some(track) = item.track.into_remote() {
                    events.push(RemotePlayEvent {
                        track,
                        album_external_id,
                        played_at: item.played_at,
                    });
                }
            }

            if oldest >= before || oldest < window.since.timestamp_millis() {
                break;
            }
            before = oldest;
        }

        Ok(events)
    }
}

async fn decode<T: DeserializeOwned>(
    response: reqwest::Response,
    url: &str,
) -> Result<T, ProviderError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(ProviderError::RateLimited { retry_after });
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ProviderError::Auth(format!("access token refused by {url}")));
    }
    if !status.is_success() {
        return Err(ProviderError::Http {
            status: status.as_u16(),
            url: url.to_string(),
        });
    }
    let body = response.bytes().await?;
    serde_json::from_slice(&body).map_err(|source| ProviderError::Decode {
        url: url.to_string(),
        source,
    })
}

#[async_trait]
impl ProviderClient for SpotifyClient {
    fn provider(&self) -> Provider {
        Provider::Spotify
    }

    async fn fetch_saved_albums(
        &self,
        credential: &RefreshCredential,
        window: Option<&SyncWindow>,
    ) -> Result<Vec<RemoteAlbum>, ProviderError> {
        let span = info_span!("spotify_saved_albums", windowed = window.is_some());
        async {
            let token = self.access_token(credential).await?;
            self.saved_albums(&token, window).await
        }
        .instrument(span)
        .await
    }

    async fn fetch_recently_played(
        &self,
        credential: &RefreshCredential,
        window: &SyncWindow,
    ) -> Result<Vec<RemotePlayEvent>, ProviderError> {
        let span = info_span!("spotify_recently_played");
        async {
            let token = self.access_token(credential).await?;
            self.recently_played(&token, window).await
        }
        .instrument(span)
        .await
    }
}
