//! Catalog, feed and credential persistence for Spindle.
//!
//! Everything above this crate talks to the traits defined here. `PgStore` is
//! the production implementation; `MemoryStore` backs tests and fixture runs.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spindle_core::{Album, Artist, Feed, ParseEnumError, Provider, Release, Track, UserRelease};
use thiserror::Error;
use uuid::Uuid;

pub mod cipher;
pub mod memory;
pub mod postgres;

pub use cipher::{CipherError, TokenCipher};
pub use memory::{CatalogCounts, MemoryStore};
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "spindle-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error("corrupt {column} column: {source}")]
    Corrupt {
        column: &'static str,
        #[source]
        source: ParseEnumError,
    },
    #[error("write rejected for {entity} {key}")]
    Rejected { entity: &'static str, key: String },
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("user {user_id} has not linked a {provider} account")]
    NotLinked { user_id: Uuid, provider: Provider },
    #[error("no token secret configured; credentials cannot be read or written")]
    MissingSecret,
    #[error("stored credential could not be decrypted: {0}")]
    Undecryptable(#[from] CipherError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Long-lived provider refresh token, already decrypted.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshCredential(String);

impl RefreshCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RefreshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RefreshCredential(<redacted>)")
    }
}

/// Catalog reads plus the entry point for transactional writes.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn CatalogTransaction>, StoreError>;

    /// Releases owned by the user, each carrying the user's `added_at`.
    async fn user_releases(&self, user_id: Uuid) -> Result<Vec<Release>, StoreError>;

    /// Album rows only; relation lists are left empty.
    async fn albums_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Album>, StoreError>;

    /// `(album_id, artist)` pairs ordered by album then position.
    async fn album_artists(&self, album_ids: &[Uuid]) -> Result<Vec<(Uuid, Artist)>, StoreError>;

    /// `(album_id, track)` pairs ordered by album then position.
    async fn album_tracks(&self, album_ids: &[Uuid]) -> Result<Vec<(Uuid, Track)>, StoreError>;
}

/// One all-or-nothing unit of catalog writes. Dropping it without `commit`
/// discards everything written through it.
///
/// The get-or-create calls are keyed by `(provider, external_id)` for albums,
/// artists and tracks, and by `(album_id, format)` for releases. The id on the
/// argument is only used when a new row is inserted; callers must use the id
/// on the returned value.
#[async_trait]
pub trait CatalogTransaction: Send {
    async fn get_or_create_album(&mut self, album: &Album) -> Result<Album, StoreError>;
    async fn get_or_create_artist(&mut self, artist: &Artist) -> Result<Artist, StoreError>;
    async fn get_or_create_track(&mut self, track: &Track) -> Result<Track, StoreError>;
    async fn link_album_artist(
        &mut self,
        album_id: Uuid,
        artist_id: Uuid,
        position: i32,
    ) -> Result<(), StoreError>;
    async fn link_album_track(
        &mut self,
        album_id: Uuid,
        track_id: Uuid,
        position: i32,
    ) -> Result<(), StoreError>;
    async fn get_or_create_release(&mut self, release: &Release) -> Result<Release, StoreError>;

    /// Inserts or refreshes the (user, release) row. A `None` timestamp keeps
    /// whatever was stored before.
    async fn upsert_user_release(
        &mut self,
        user_id: Uuid,
        release_id: Uuid,
        added_at: Option<DateTime<Utc>>,
    ) -> Result<UserRelease, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Idempotent on `(user_id, kind)`.
    async fn upsert_feed(&self, user_id: Uuid, kind: Provider) -> Result<Feed, StoreError>;
    async fn get_feed(&self, id: Uuid) -> Result<Option<Feed>, StoreError>;
    async fn feeds_for_user(&self, user_id: Uuid) -> Result<Vec<Feed>, StoreError>;

    /// Feeds of `kind` that have completed at least once, with the last
    /// completion before `cutoff`.
    async fn feeds_completed_before(
        &self,
        kind: Provider,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Feed>, StoreError>;

    /// Persists `feed` (already marked pending) only when the stored row is not
    /// pending, or its pending claim started before `lease_cutoff`. Returns
    /// `None` when another sync holds the feed.
    async fn claim_for_sync(
        &self,
        feed: &Feed,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<Option<Feed>, StoreError>;

    /// Writes the outcome of a sync only while the stored row still carries
    /// the claim that started at `claimed_at`. Returns `None` when the claim
    /// was lost to a later sync after its lease expired.
    async fn finish_sync(
        &self,
        feed: &Feed,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<Feed>, StoreError>;
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(
        &self,
        user_id: Uuid,
        provider: Provider,
    ) -> Result<RefreshCredential, CredentialError>;
}

#[async_trait]
pub trait CredentialStore: CredentialResolver {
    async fn store_credential(
        &self,
        user_id: Uuid,
        provider: Provider,
        refresh_token: &RefreshCredential,
    ) -> Result<(), CredentialError>;
}

pub(crate) fn parse_column<T>(column: &'static str, value: &str) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = ParseEnumError>,
{
    value
        .parse()
        .map_err(|source| StoreError::Corrupt { column, source })
}
