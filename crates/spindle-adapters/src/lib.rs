//! Provider client contract plus the Spotify and fixture implementations.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use spindle_core::{Provider, SyncWindow};
use spindle_storage::RefreshCredential;
use thiserror::Error;

pub mod fixture;
pub mod http;
pub mod spotify;

pub use fixture::{load_fixture_bundle, FixtureBundle, FixtureProvider};
pub use http::{classify_reqwest_error, classify_status, HttpClientConfig, RetryDisposition};
pub use spotify::{SpotifyClient, SpotifyConfig};

pub const CRATE_NAME: &str = "spindle-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteArtist {
    pub external_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub external_id: String,
    pub title: String,
}

/// A saved album as the provider reports it. `added_at` is passed through
/// untouched and may not parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAlbum {
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub artists: Vec<RemoteArtist>,
    #[serde(default)]
    pub tracks: Vec<RemoteTrack>,
    pub added_at: String,
}

impl RemoteAlbum {
    pub fn parsed_added_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.added_at)
            .ok()
            .map(|at| at.with_timezone(&Utc))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePlayEvent {
    pub track: RemoteTrack,
    pub album_external_id: Option<String>,
    pub played_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rejected the credential: {0}")]
    Auth(String),
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("http status {status} for {url}")]
    Http { status: u16, url: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Auth(_) | Self::Decode { .. } => RetryDisposition::NonRetryable,
            Self::RateLimited { .. } | Self::Unavailable(_) => RetryDisposition::Retryable,
            Self::Http { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Transport(err) => classify_reqwest_error(err),
        }
    }
}

/// Read access to one provider's view of a user's catalog.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Saved albums, newest first. With a window, only albums added inside it
    /// (plus any whose `added_at` does not parse); without one, the full
    /// library up to the client's cap.
    async fn fetch_saved_albums(
        &self,
        credential: &RefreshCredential,
        window: Option<&SyncWindow>,
    ) -> Result<Vec<RemoteAlbum>, ProviderError>;

    async fn fetch_recently_played(
        &self,
        credential: &RefreshCredential,
        window: &SyncWindow,
    ) -> Result<Vec<RemotePlayEvent>, ProviderError>;
}

/// Shared window rule: keep undated albums, drop ones added before `since`.
pub(crate) fn in_window(album: &RemoteAlbum, window: Option<&SyncWindow>) -> bool {
    match (window, album.parsed_added_at()) {
        (Some(window), Some(added_at)) => window.contains(added_at),
        _ => true,
    }
}
