//! Library read model: a user's albums flattened out of their releases.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Album, Artist, ParseEnumError, Track};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Library {
    pub owner_user_id: Uuid,
    pub albums: Vec<Album>,
    pub artists: Vec<Artist>,
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Title,
    Artist,
    Date,
}

impl FromStr for SortKey {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "title" => Ok(Self::Title),
            "artist" => Ok(Self::Artist),
            "date" | "added" => Ok(Self::Date),
            other => Err(ParseEnumError {
                kind: "sort key",
                value: other.to_string(),
            }),
        }
    }
}

impl Library {
    /// Builds the library and dedups artists/tracks across albums by local id.
    pub fn new(owner_user_id: Uuid, albums: Vec<Album>) -> Self {
        let mut artists = BTreeMap::new();
        let mut tracks = BTreeMap::new();
        for album in &albums {
            for artist in &album.artists {
                artists.entry(artist.id).or_insert_with(|| artist.clone());
            }
            for track in &album.tracks {
                tracks.entry(track.id).or_insert_with(|| track.clone());
            }
        }

        Self {
            owner_user_id,
            albums,
            artists: artists.into_values().collect(),
            tracks: tracks.into_values().collect(),
        }
    }

    pub fn sort(&mut self, key: SortKey, ascending: bool) {
        match key {
            SortKey::Title => self.sort_by_title(ascending),
            SortKey::Artist => self.sort_by_artist(ascending),
            SortKey::Date => self.sort_by_date(ascending),
        }
    }

    pub fn sort_by_title(&mut self, ascending: bool) {
        sort_albums(&mut self.albums, ascending, |a, b| a.title.cmp(&b.title));
    }

    /// Albums without artists go last when ascending, first when descending.
    pub fn sort_by_artist(&mut self, ascending: bool) {
        sort_albums(&mut self.albums, ascending, |a, b| {
            missing_last(a.first_artist_name(), b.first_artist_name())
        });
    }

    /// Orders by the earliest `added_at` across an album's releases. Albums
    /// with no dated release go last when ascending, first when descending.
    pub fn sort_by_date(&mut self, ascending: bool) {
        sort_albums(&mut self.albums, ascending, |a, b| {
            missing_last(a.earliest_added_at(), b.earliest_added_at())
        });
    }
}

fn missing_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

// Ties fall back to title then id so repeated renders page identically.
fn sort_albums<F>(albums: &mut [Album], ascending: bool, primary: F)
where
    F: Fn(&Album, &Album) -> Ordering,
{
    albums.sort_by(|a, b| {
        let ord = primary(a, b)
            .then_with(|| a.title.cmp(&b.title))
            .then_with(|| a.id.cmp(&b.id));
        if ascending {
            ord
        } else {
            ord.reverse()
        }
    });
}
