//! PostgreSQL implementation of the store traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use spindle_core::{Album, Artist, Feed, Provider, Release, Track, UserRelease};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::{
    parse_column, CatalogStore, CatalogTransaction, CredentialError, CredentialResolver,
    CredentialStore, FeedStore, RefreshCredential, StoreError, TokenCipher,
};

const FEED_COLUMNS: &str = "id, user_id, kind, sync_status, last_sync_started_at, \
                            last_sync_completed_at, last_sync_succeeded_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    cipher: Option<TokenCipher>,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        info!(max_connections, "connected to postgres");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool, cipher: None }
    }

    pub fn with_cipher(mut self, cipher: TokenCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("migrations applied");
        Ok(())
    }
}

fn feed_from_row(row: &PgRow) -> Result<Feed, StoreError> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("sync_status")?;
    Ok(Feed {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: parse_column("feeds.kind", &kind)?,
        sync_status: parse_column("feeds.sync_status", &status)?,
        last_sync_started_at: row.try_get("last_sync_started_at")?,
        last_sync_completed_at: row.try_get("last_sync_completed_at")?,
        last_sync_succeeded_at: row.try_get("last_sync_succeeded_at")?,
    })
}

fn album_from_row(row: &PgRow) -> Result<Album, StoreError> {
    let provider: String = row.try_get("provider")?;
    Ok(Album {
        id: row.try_get("id")?,
        provider: parse_column("albums.provider", &provider)?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        artists: Vec::new(),
        tracks: Vec::new(),
        releases: Vec::new(),
    })
}

fn artist_from_row(row: &PgRow) -> Result<Artist, StoreError> {
    let provider: String = row.try_get("provider")?;
    Ok(Artist {
        id: row.try_get("id")?,
        provider: parse_column("artists.provider", &provider)?,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
    })
}

fn track_from_row(row: &PgRow) -> Result<Track, StoreError> {
    let provider: String = row.try_get("provider")?;
    Ok(Track {
        id: row.try_get("id")?,
        provider: parse_column("tracks.provider", &provider)?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
    })
}

fn release_from_row(row: &PgRow) -> Result<Release, StoreError> {
    let format: String = row.try_get("format")?;
    Ok(Release {
        id: row.try_get("id")?,
        album_id: row.try_get("album_id")?,
        format: parse_column("releases.format", &format)?,
        added_at: row.try_get("added_at")?,
    })
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn CatalogTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgCatalogTransaction { tx }))
    }

    async fn user_releases(&self, user_id: Uuid) -> Result<Vec<Release>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.album_id, r.format, ur.added_at
              FROM user_releases ur
              JOIN releases r ON r.id = ur.release_id
             WHERE ur.user_id = $1
             ORDER BY ur.added_at DESC NULLS LAST, r.id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(release_from_row).collect()
    }

    async fn albums_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Album>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT id, provider, external_id, title
              FROM albums
             WHERE id = ANY($1)
             ORDER BY title, id
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(album_from_row).collect()
    }

    async fn album_artists(&self, album_ids: &[Uuid]) -> Result<Vec<(Uuid, Artist)>, StoreError> {
        if album_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT aa.album_id, a.id, a.provider, a.external_id, a.name
              FROM album_artists aa
              JOIN artists a ON a.id = aa.artist_id
             WHERE aa.album_id = ANY($1)
             ORDER BY aa.album_id, aa.position
            "#,
        )
        .bind(album_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<(Uuid, Artist), StoreError> {
                Ok((row.try_get("album_id")?, artist_from_row(row)?))
            })
            .collect()
    }

    async fn album_tracks(&self, album_ids: &[Uuid]) -> Result<Vec<(Uuid, Track)>, StoreError> {
        if album_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT at.album_id, t.id, t.provider, t.external_id, t.title
              FROM album_tracks at
              JOIN tracks t ON t.id = at.track_id
             WHERE at.album_id = ANY($1)
             ORDER BY at.album_id, at.position
            "#,
        )
        .bind(album_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<(Uuid, Track), StoreError> {
                Ok((row.try_get("album_id")?, track_from_row(row)?))
            })
            .collect()
    }
}

/// Wraps a pooled transaction; sqlx rolls it back on drop if not committed.
struct PgCatalogTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgCatalogTransaction {
    /// `INSERT .. ON CONFLICT DO NOTHING RETURNING` yields no row when a
    /// concurrent or earlier writer owns the key; re-read it in that case.
    async fn reread(
        &mut self,
        table: &'static str,
        columns: &'static str,
        provider: Provider,
        external_id: &str,
    ) -> Result<PgRow, StoreError> {
        let sql = format!("SELECT {columns} FROM {table} WHERE provider = $1 AND external_id = $2");
        sqlx::query(&sql)
            .bind(provider.as_str())
            .bind(external_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: table,
                key: format!("{provider}:{external_id}"),
            })
    }
}

#[async_trait]
impl CatalogTransaction for PgCatalogTransaction {
    async fn get_or_create_album(&mut self, album: &Album) -> Result<Album, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO albums (id, provider, external_id, title)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (provider, external_id) DO NOTHING
            RETURNING id, provider, external_id, title
            "#,
        )
        .bind(album.id)
        .bind(album.provider.as_str())
        .bind(&album.external_id)
        .bind(&album.title)
        .fetch_optional(&mut *self.tx)
        .await?;
        let row = match inserted {
            Some(row) => row,
            None => {
                self.reread(
                    "albums",
                    "id, provider, external_id, title",
                    album.provider,
                    &album.external_id,
                )
                .await?
            }
        };
        album_from_row(&row)
    }

    async fn get_or_create_artist(&mut self, artist: &Artist) -> Result<Artist, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO artists (id, provider, external_id, name)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (provider, external_id) DO NOTHING
            RETURNING id, provider, external_id, name
            "#,
        )
        .bind(artist.id)
        .bind(artist.provider.as_str())
        .bind(&artist.external_id)
        .bind(&artist.name)
        .fetch_optional(&mut *self.tx)
        .await?;
        let row = match inserted {
            Some(row) => row,
            None => {
                self.reread(
                    "artists",
                    "id, provider, external_id, name",
                    artist.provider,
                    &artist.external_id,
                )
                .await?
            }
        };
        artist_from_row(&row)
    }

    async fn get_or_create_track(&mut self, track: &Track) -> Result<Track, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO tracks (id, provider, external_id, title)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (provider, external_id) DO NOTHING
            RETURNING id, provider, external_id, title
            "#,
        )
        .bind(track.id)
        .bind(track.provider.as_str())
        .bind(&track.external_id)
        .bind(&track.title)
        .fetch_optional(&mut *self.tx)
        .await?;
        let row = match inserted {
            Some(row) => row,
            None => {
                self.reread(
                    "tracks",
                    "id, provider, external_id, title",
                    track.provider,
                    &track.external_id,
                )
                .await?
            }
        };
        track_from_row(&row)
    }

    async fn link_album_artist(
        &mut self,
        album_id: Uuid,
        artist_id: Uuid,
        position: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO album_artists (album_id, artist_id, position)
            VALUES ($1, $2, $3)
            ON CONFLICT (album_id, artist_id) DO UPDATE SET position = EXCLUDED.position
            "#,
        )
        .bind(album_id)
        .bind(artist_id)
        .bind(position)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn link_album_track(
        &mut self,
        album_id: Uuid,
        track_id: Uuid,
        position: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO album_tracks (album_id, track_id, position)
            VALUES ($1, $2, $3)
            ON CONFLICT (album_id, track_id) DO UPDATE SET position = EXCLUDED.position
            "#,
        )
        .bind(album_id)
        .bind(track_id)
        .bind(position)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn get_or_create_release(&mut self, release: &Release) -> Result<Release, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO releases (id, album_id, format)
            VALUES ($1, $2, $3)
            ON CONFLICT (album_id, format) DO NOTHING
            RETURNING id, album_id, format
            "#,
        )
        .bind(release.id)
        .bind(release.album_id)
        .bind(release.format.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;
        let row = match inserted {
            Some(row) => row,
            None => sqlx::query(
                "SELECT id, album_id, format FROM releases WHERE album_id = $1 AND format = $2",
            )
            .bind(release.album_id)
            .bind(release.format.as_str())
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "releases",
                key: format!("{}:{}", release.album_id, release.format),
            })?,
        };
        let format: String = row.try_get("format")?;
        Ok(Release {
            id: row.try_get("id")?,
            album_id: row.try_get("album_id")?,
            format: parse_column("releases.format", &format)?,
            added_at: release.added_at,
        })
    }

    async fn upsert_user_release(
        &mut self,
        user_id: Uuid,
        release_id: Uuid,
        added_at: Option<DateTime<Utc>>,
    ) -> Result<UserRelease, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO user_releases (id, user_id, release_id, added_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, release_id)
            DO UPDATE SET added_at = COALESCE(EXCLUDED.added_at, user_releases.added_at)
            RETURNING id, user_id, release_id, added_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(release_id)
        .bind(added_at)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(UserRelease {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            release_id: row.try_get("release_id")?,
            added_at: row.try_get("added_at")?,
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl FeedStore for PgStore {
    async fn upsert_feed(&self, user_id: Uuid, kind: Provider) -> Result<Feed, StoreError> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let sql = format!(
            "INSERT INTO feeds (id, user_id, kind, sync_status) VALUES ($1, $2, $3, 'none') \
             ON CONFLICT (user_id, kind) DO UPDATE SET kind = EXCLUDED.kind \
             RETURNING {FEED_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(user_id)
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        feed_from_row(&row)
    }

    async fn get_feed(&self, id: Uuid) -> Result<Option<Feed>, StoreError> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(feed_from_row).transpose()
    }

    async fn feeds_for_user(&self, user_id: Uuid) -> Result<Vec<Feed>, StoreError> {
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE user_id = $1 ORDER BY kind");
        let rows = sqlx::query(&sql).bind(user_id).fetch_all(&self.pool).await?;
        rows.iter().map(feed_from_row).collect()
    }

    async fn feeds_completed_before(
        &self,
        kind: Provider,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Feed>, StoreError> {
        let sql = format!(
            "SELECT {FEED_COLUMNS} FROM feeds \
             WHERE kind = $1 AND sync_status <> 'none' AND last_sync_completed_at < $2 \
             ORDER BY last_sync_completed_at"
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(feed_from_row).collect()
    }

    async fn claim_for_sync(
        &self,
        feed: &Feed,
        lease_cutoff: DateTime<Utc>,
    ) -> Result<Option<Feed>, StoreError> {
        let sql = format!(
            "UPDATE feeds SET sync_status = $2, last_sync_started_at = $3 \
             WHERE id = $1 \
               AND (sync_status <> 'pending' \
                    OR last_sync_started_at IS NULL \
                    OR last_sync_started_at < $4) \
             RETURNING {FEED_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(feed.id)
            .bind(feed.sync_status.as_str())
            .bind(feed.last_sync_started_at)
            .bind(lease_cutoff)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(feed_from_row).transpose()
    }

    async fn finish_sync(
        &self,
        feed: &Feed,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<Feed>, StoreError> {
        let sql = format!(
            "UPDATE feeds SET sync_status = $2, last_sync_completed_at = $3, \
             last_sync_succeeded_at = $4 \
             WHERE id = $1 AND sync_status = 'pending' AND last_sync_started_at = $5 \
             RETURNING {FEED_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(feed.id)
            .bind(feed.sync_status.as_str())
            .bind(feed.last_sync_completed_at)
            .bind(feed.last_sync_succeeded_at)
            .bind(claimed_at)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(feed_from_row).transpose()
    }
}

#[async_trait]
impl CredentialResolver for PgStore {
    async fn resolve(
        &self,
        user_id: Uuid,
        provider: Provider,
    ) -> Result<RefreshCredential, CredentialError> {
        let cipher = self.cipher.as_ref().ok_or(CredentialError::MissingSecret)?;
        let sealed: Option<String> = sqlx::query_scalar(
            "SELECT encrypted_refresh_token FROM provider_credentials \
             WHERE user_id = $1 AND provider = $2",
        )
        .bind(user_id)
        .bind(provider.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;
        let sealed = sealed.ok_or(CredentialError::NotLinked { user_id, provider })?;
        Ok(RefreshCredential::new(cipher.open(&sealed)?))
    }
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn store_credential(
        &self,
        user_id: Uuid,
        provider: Provider,
        refresh_token: &RefreshCredential,
    ) -> Result<(), CredentialError> {
        let cipher = self.cipher.as_ref().ok_or(CredentialError::MissingSecret)?;
        let sealed = cipher.seal(refresh_token.expose())?;
        sqlx::query(
            r#"
            INSERT INTO provider_credentials
                (user_id, provider, encrypted_refresh_token, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (user_id, provider)
            DO UPDATE SET encrypted_refresh_token = EXCLUDED.encrypted_refresh_token,
                          updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(provider.as_str())
        .bind(sealed)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::{ReleaseFormat, SyncStatus};

    // Runs against a real database only when one is provided.
    async fn test_store() -> Option<PgStore> {
        let url = std::env::var("SPINDLE_TEST_DATABASE_URL").ok()?;
        let store = PgStore::connect(&url, 2).await.ok()?;
        store.migrate().await.ok()?;
        Some(store)
    }

    #[tokio::test]
    async fn album_get_or_create_returns_established_id() {
        let Some(store) = test_store().await else {
            return;
        };
        let external_id = format!("pg-test-{}", Uuid::new_v4());
        let first = Album {
            id: Uuid::new_v4(),
            provider: Provider::Spotify,
            external_id: external_id.clone(),
            title: "First".into(),
            artists: vec![],
            tracks: vec![],
            releases: vec![],
        };
        let second = Album {
            id: Uuid::new_v4(),
            ..first.clone()
        };

        let mut tx = store.begin().await.expect("begin");
        let created = tx.get_or_create_album(&first).await.expect("create");
        let again = tx.get_or_create_album(&second).await.expect("get");
        let release = tx
            .get_or_create_release(&Release {
                id: Uuid::new_v4(),
                album_id: created.id,
                format: ReleaseFormat::Digital,
                added_at: None,
            })
            .await
            .expect("release");
        tx.commit().await.expect("commit");

        assert_eq!(created.id, first.id);
        assert_eq!(again.id, first.id);
        assert_eq!(release.album_id, first.id);
    }

    #[tokio::test]
    async fn second_claim_is_refused_while_pending() {
        let Some(store) = test_store().await else {
            return;
        };
        let mut feed = store
            .upsert_feed(Uuid::new_v4(), Provider::Spotify)
            .await
            .expect("upsert");
        assert_eq!(feed.sync_status, SyncStatus::None);

        let now = Utc::now();
        feed.mark_syncing(now);
        let lease_cutoff = now - chrono::TimeDelta::hours(1);
        assert!(store.claim_for_sync(&feed, lease_cutoff).await.expect("claim").is_some());
        assert!(store.claim_for_sync(&feed, lease_cutoff).await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn finish_is_fenced_on_the_claim() {
        let Some(store) = test_store().await else {
            return;
        };
        let mut feed = store
            .upsert_feed(Uuid::new_v4(), Provider::Spotify)
            .await
            .expect("upsert");

        let first_start = Utc::now() - chrono::TimeDelta::hours(3);
        feed.mark_syncing(first_start);
        let first = store
            .claim_for_sync(&feed, first_start - chrono::TimeDelta::hours(1))
            .await
            .expect("claim")
            .expect("claimed");
        let first_claimed_at = first.last_sync_started_at.expect("started");

        let second_start = Utc::now();
        let mut second = first.clone();
        second.mark_syncing(second_start);
        let second = store
            .claim_for_sync(&second, second_start - chrono::TimeDelta::hours(1))
            .await
            .expect("claim")
            .expect("lease expired");

        let mut stale = first.clone();
        stale.mark_success(Utc::now());
        assert!(store
            .finish_sync(&stale, first_claimed_at)
            .await
            .expect("finish")
            .is_none());
        let stored = store.get_feed(feed.id).await.expect("get").expect("feed");
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert_eq!(stored.last_sync_started_at, second.last_sync_started_at);

        let mut done = second.clone();
        done.mark_success(Utc::now());
        let finished = store
            .finish_sync(&done, second.last_sync_started_at.expect("started"))
            .await
            .expect("finish")
            .expect("claim held");
        assert_eq!(finished.sync_status, SyncStatus::Success);
    }
}
