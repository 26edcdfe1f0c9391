//! "Played during this session" bookkeeping.
//!
//! The cache pairs each track location with exactly one track id and each id
//! with its last known play counter. Both maps always have the same size.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Local numeric track id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub i64);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayCounter {
    pub times_played: u32,
    pub last_played_at: Option<DateTime<Utc>>,
    /// Played flag maintained by the player itself
    pub played: bool,
}

impl PlayCounter {
    #[must_use]
    pub fn played_at(times_played: u32, last_played_at: DateTime<Utc>) -> Self {
        Self {
            times_played,
            last_played_at: Some(last_played_at),
            played: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentlyPlayed {
    pub id: TrackId,
    pub location: String,
    pub play_counter: PlayCounter,
}

/// Local track database queried when the session is (re)started
pub trait RecentlyPlayedSource {
    fn find_recently_played(&self, since: DateTime<Utc>) -> Vec<RecentlyPlayed>;
}

impl RecentlyPlayedSource for Vec<RecentlyPlayed> {
    fn find_recently_played(&self, since: DateTime<Utc>) -> Vec<RecentlyPlayed> {
        self.iter()
            .filter(|track| {
                track
                    .play_counter
                    .last_played_at
                    .is_some_and(|at| at >= since)
            })
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionPlayCache {
    started_at: Option<DateTime<Utc>>,
    locations: HashMap<String, TrackId>,
    play_counters: HashMap<TrackId, PlayCounter>,
}

impl SessionPlayCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    #[must_use]
    pub fn len(&self) -> usize {
        debug_assert_eq!(self.locations.len(), self.play_counters.len());
        self.play_counters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move the session watermark to `started_at`.
    ///
    /// Moving it backwards (or setting it for the first time) backfills
    /// everything played since one day before the new start.
    pub fn restart(&mut self, source: &dyn RecentlyPlayedSource, started_at: Option<DateTime<Utc>>) {
        if let Some(start) = started_at {
            let moved_back = self.started_at.is_none_or(|previous| start < previous);
            if moved_back {
                let since = start - Duration::days(1);
                let recently_played = source.find_recently_played(since);
                tracing::info!(
                    tracks = recently_played.len(),
                    since = %since.to_rfc3339(),
                    "Backfilling session cache"
                );
                for track in recently_played {
                    self.update(track.id, track.location, track.play_counter);
                }
            }
        }
        self.started_at = started_at;
        match started_at {
            Some(start) => tracing::info!(started_at = %start.to_rfc3339(), "Restarted session cache"),
            None => tracing::info!("Restarted session cache"),
        }
    }

    /// Record the play counter of a track. Returns whether anything changed.
    pub fn update(&mut self, id: TrackId, location: String, play_counter: PlayCounter) -> bool {
        let mut modified = false;
        match self.locations.get(&location).copied() {
            Some(previous) if previous == id => {}
            Some(previous) => {
                // The file at this location was replaced by another track
                self.remove_by_id(previous);
                modified = true;
            }
            None => {}
        }
        if !self.locations.contains_key(&location) {
            // Re-homed track: forget its previous location
            if self.play_counters.contains_key(&id) {
                self.locations.retain(|_, mapped| *mapped != id);
            }
            self.locations.insert(location, id);
            modified = true;
        }
        match self.play_counters.get_mut(&id) {
            Some(existing) if *existing == play_counter => {}
            Some(existing) => {
                *existing = play_counter;
                modified = true;
            }
            None => {
                self.play_counters.insert(id, play_counter);
                modified = true;
            }
        }
        debug_assert_eq!(self.locations.len(), self.play_counters.len());
        modified
    }

    pub fn remove_by_id(&mut self, id: TrackId) {
        self.locations.retain(|_, mapped| *mapped != id);
        self.play_counters.remove(&id);
        debug_assert_eq!(self.locations.len(), self.play_counters.len());
    }

    /// Played ever, or at least once since the session started
    #[must_use]
    pub fn is_played(&self, play_counter: &PlayCounter) -> bool {
        if play_counter.played {
            return true;
        }
        match (self.started_at, play_counter.last_played_at) {
            (Some(started_at), Some(last_played_at)) => last_played_at >= started_at,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_id_played(&self, id: TrackId) -> bool {
        self.play_counters
            .get(&id)
            .is_some_and(|counter| self.is_played(counter))
    }

    #[must_use]
    pub fn is_location_played(&self, location: &str) -> bool {
        self.locations
            .get(location)
            .is_some_and(|id| self.is_id_played(*id))
    }

    #[must_use]
    pub fn id_at(&self, location: &str) -> Option<TrackId> {
        self.locations.get(location).copied()
    }
}
