//! Fixture-backed provider for tests and offline runs.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use spindle_core::{Provider, SyncWindow};
use spindle_storage::RefreshCredential;

use crate::{in_window, ProviderClient, ProviderError, RemoteAlbum, RemotePlayEvent};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub provider: Provider,
    #[serde(default)]
    pub saved_albums: Vec<RemoteAlbum>,
    #[serde(default)]
    pub recently_played: Vec<RemotePlayEvent>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves a bundle. Clones share the call counter.
#[derive(Debug, Clone)]
pub struct FixtureProvider {
    bundle: FixtureBundle,
    failure: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl FixtureProvider {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self {
            bundle,
            failure: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    /// Every fetch fails with a retryable [`ProviderError::Unavailable`].
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn begin_call(&self) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(reason) => Err(ProviderError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProviderClient for FixtureProvider {
    fn provider(&self) -> Provider {
        self.bundle.provider
    }

    async fn fetch_saved_albums(
        &self,
        _credential: &RefreshCredential,
        window: Option<&SyncWindow>,
    ) -> Result<Vec<RemoteAlbum>, ProviderError> {
        self.begin_call()?;
        Ok(self
            .bundle
            .saved_albums
            .iter()
            .filter(|album| in_window(album, window))
            .cloned()
            .collect())
    }

    async fn fetch_recently_played(
        &self,
        _credential: &RefreshCredential,
        window: &SyncWindow,
    ) -> Result<Vec<RemotePlayEvent>, ProviderError> {
        self.begin_call()?;
        Ok(self
            .bundle
            .recently_played
            .iter()
            .filter(|event| window.contains(event.played_at) && event.played_at <= window.until)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const BUNDLE: &str = r#"{
        "provider": "spotify",
        "saved_albums": [
            {"external_id": "new", "title": "New", "added_at": "2026-03-01T00:00:00Z"},
            {"external_id": "old", "title": "Old", "added_at": "2025-01-01T00:00:00Z"},
            {"external_id": "odd", "title": "Odd", "added_at": "sometime"}
        ],
        "recently_played": [
            {"track": {"external_id": "t1", "title": "T1"}, "album_external_id": "new",
             "played_at": "2026-03-02T00:00:00Z"}
        ]
    }"#;

    #[tokio::test]
    async fn bundle_loads_from_disk_and_applies_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        std::fs::write(&path, BUNDLE).unwrap();

        let provider = FixtureProvider::from_path(&path).unwrap();
        assert_eq!(provider.provider(), Provider::Spotify);

        let cred = RefreshCredential::new("unused");
        let all = provider.fetch_saved_albums(&cred, None).await.unwrap();
        assert_eq!(all.len(), 3);

        let window = SyncWindow {
            since: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            until: Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap(),
        };
        let recent = provider.fetch_saved_albums(&cred, Some(&window)).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|a| a.external_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "odd"]);

        let plays = provider.fetch_recently_played(&cred, &window).await.unwrap();
        assert_eq!(plays.len(), 1);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn failing_provider_reports_retryable_error() {
        let bundle: FixtureBundle = serde_json::from_str(BUNDLE).unwrap();
        let provider = FixtureProvider::new(bundle).failing("upstream down");
        let err = provider
            .fetch_saved_albums(&RefreshCredential::new("x"), None)
            .await
            .unwrap_err();
        assert_eq!(err.disposition(), crate::RetryDisposition::Retryable);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_fixture_bundle("/nonexistent/bundle.json").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/bundle.json"));
    }
}
