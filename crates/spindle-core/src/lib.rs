//! Core domain model for Spindle: catalog entities, feeds and their sync state machine.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod library;
pub mod review;

pub use library::{Library, SortKey};
pub use review::{Answers, Review, ReviewError, ScoreLabel};

pub const CRATE_NAME: &str = "spindle-core";

/// Default freshness threshold for a feed: one day.
pub const DEFAULT_MIN_STALE: TimeDelta = TimeDelta::hours(24);

/// Overlap subtracted from the last successful sync when computing a window,
/// so items the provider reports late are still picked up.
pub const DEFAULT_SYNC_OVERLAP: TimeDelta = TimeDelta::hours(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// External catalog provider. Also used as the feed kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Spotify,
    Discogs,
}

string_enum!(Provider, "provider", {
    Spotify => "spotify",
    Discogs => "discogs",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    None,
    Pending,
    Success,
    Failure,
}

string_enum!(SyncStatus, "sync status", {
    None => "none",
    Pending => "pending",
    Success => "success",
    Failure => "failure",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseFormat {
    Digital,
    Vinyl,
    Cd,
    Cassette,
}

string_enum!(ReleaseFormat, "release format", {
    Digital => "digital",
    Vinyl => "vinyl",
    Cd => "cd",
    Cassette => "cassette",
});

/// Source of "now". Everything time-dependent in the sync path goes through this.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Time range a sync asks the provider about. `until` is the moment the window
/// was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl SyncWindow {
    pub fn duration(&self) -> TimeDelta {
        self.until - self.since
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.since
    }
}

/// A user's subscription to one provider's catalog.
///
/// `last_sync_completed_at` is touched by both success and failure, and drives
/// staleness. `last_sync_succeeded_at` only moves on success and drives the
/// sync window, so a failed attempt never narrows what the next one fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: Provider,
    pub sync_status: SyncStatus,
    pub last_sync_started_at: Option<DateTime<Utc>>,
    pub last_sync_completed_at: Option<DateTime<Utc>>,
    pub last_sync_succeeded_at: Option<DateTime<Utc>>,
}

impl Feed {
    pub fn new(user_id: Uuid, kind: Provider) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            sync_status: SyncStatus::None,
            last_sync_started_at: None,
            last_sync_completed_at: None,
            last_sync_succeeded_at: None,
        }
    }

    pub fn mark_syncing(&mut self, now: DateTime<Utc>) {
        self.sync_status = SyncStatus::Pending;
        self.last_sync_started_at = Some(now);
    }

    pub fn mark_success(&mut self, now: DateTime<Utc>) {
        self.sync_status = SyncStatus::Success;
        self.last_sync_completed_at = Some(now);
        self.last_sync_succeeded_at = Some(now);
    }

    pub fn mark_failure(&mut self, now: DateTime<Utc>) {
        self.sync_status = SyncStatus::Failure;
        self.last_sync_completed_at = Some(now);
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_status == SyncStatus::Pending
    }

    /// A never-synced feed is not stale, and neither is one that has started
    /// but never completed.
    pub fn is_stale(&self, now: DateTime<Utc>, min_stale: TimeDelta) -> bool {
        if self.sync_status == SyncStatus::None {
            return false;
        }
        match self.last_sync_completed_at {
            Some(completed_at) => completed_at < now - min_stale,
            None => false,
        }
    }

    /// `None` means fetch the full history.
    pub fn sync_window(&self, now: DateTime<Utc>, overlap: TimeDelta) -> Option<SyncWindow> {
        self.last_sync_succeeded_at.map(|succeeded_at| SyncWindow {
            since: succeeded_at - overlap,
            until: now,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artist {
    pub id: Uuid,
    pub provider: Provider,
    pub external_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub id: Uuid,
    pub provider: Provider,
    pub external_id: String,
    pub title: String,
}

/// A concrete release of an album. `added_at` is the owning user's
/// provider-side timestamp when the release was read through a user's library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub id: Uuid,
    pub album_id: Uuid,
    pub format: ReleaseFormat,
    pub added_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRelease {
    pub id: Uuid,
    pub user_id: Uuid,
    pub release_id: Uuid,
    pub added_at: Option<DateTime<Utc>>,
}

/// Album with its relations. Store rows come back with empty relation lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub id: Uuid,
    pub provider: Provider,
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub artists: Vec<Artist>,
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub releases: Vec<Release>,
}

impl Album {
    pub fn earliest_added_at(&self) -> Option<DateTime<Utc>> {
        self.releases.iter().filter_map(|r| r.added_at).min()
    }

    pub fn find_release(&self, format: ReleaseFormat) -> Option<&Release> {
        self.releases.iter().find(|r| r.format == format)
    }

    pub fn first_artist_name(&self) -> Option<&str> {
        self.artists.first().map(|a| a.name.as_str())
    }
}
