//! Provisional tracks for faces that match no confirmed identity.
//!
//! A track lives exactly as long as it keeps being seen: every frame starts
//! by clearing the liveness flags and ends by evicting the tracks nobody
//! matched. Ids come from a counter and are never handed out twice.

use crate::matcher::{EuclideanMatcher, Matcher};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use serde::Serialize;
use std::collections::btree_map::{BTreeMap, Entry};
use thiserror::Error;

pub type TrackId = u32;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("track {0} not found")]
pub struct TrackNotFound(pub TrackId);

#[derive(Debug, Clone, Serialize)]
pub struct Track {
    pub id: TrackId,
    /// Synthetic label, `Unknown_<id>`.
    pub name: String,
    pub description: String,
    pub bbox: BoundingBox,
    #[serde(skip)]
    pub encoding: Embedding,
    #[serde(skip)]
    pub crop: Option<RgbImage>,
    #[serde(skip)]
    live: bool,
}

impl Track {
    fn new(id: TrackId, encoding: Embedding, bbox: BoundingBox, crop: Option<RgbImage>) -> Self {
        Self {
            id,
            name: format!("Unknown_{id}"),
            description: String::new(),
            bbox,
            encoding,
            crop,
            live: true,
        }
    }

    pub fn is_live(&self) -> bool {
        self.live
    }
}

pub struct TrackRegistry {
    tracks: BTreeMap<TrackId, Track>,
    next_id: TrackId,
}

impl Default for TrackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Clear every liveness flag.
    pub fn begin_frame(&mut self) {
        for track in self.tracks.values_mut() {
            track.live = false;
        }
    }

    /// Update the first track within `tolerance` of `encoding`, or start a new
    /// one. Returns the track and whether it was created.
    pub fn get_or_create(
        &mut self,
        encoding: Embedding,
        bbox: BoundingBox,
        crop: Option<RgbImage>,
        tolerance: f32,
    ) -> (&Track, bool) {
        let references = self.tracks.values().map(|t| (t.id, &t.encoding));
        let hit = EuclideanMatcher.first_match(&encoding, references, tolerance);

        let (id, created) = match hit {
            Some(m) => (m.key, false),
            None => {
                let id = self.next_id;
                self.next_id += 1;
                tracing::debug!(track_id = id, "track created");
                (id, true)
            }
        };

        let track = match self.tracks.entry(id) {
            Entry::Occupied(entry) => {
                let track = entry.into_mut();
                track.encoding = encoding;
                track.bbox = bbox;
                if crop.is_some() {
                    track.crop = crop;
                }
                track.live = true;
                track
            }
            Entry::Vacant(entry) => entry.insert(Track::new(id, encoding, bbox, crop)),
        };
        (track, created)
    }

    /// Evict every track not matched since [`begin_frame`](Self::begin_frame).
    /// Returns the evicted ids in ascending order.
    pub fn end_frame(&mut self) -> Vec<TrackId> {
        let stale: Vec<TrackId> = self.tracks.values().filter(|t| !t.live).map(|t| t.id).collect();
        for id in &stale {
            self.tracks.remove(id);
            tracing::debug!(track_id = id, "track evicted");
        }
        stale
    }

    /// Remove a track for promotion.
    pub fn promote(&mut self, id: TrackId) -> Result<Track, TrackNotFound> {
        self.tracks.remove(&id).ok_or(TrackNotFound(id))
    }

    pub fn set_description(&mut self, id: TrackId, description: &str) -> Result<(), TrackNotFound> {
        let track = self.tracks.get_mut(&id).ok_or(TrackNotFound(id))?;
        track.description = description.to_string();
        Ok(())
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    /// Tracks in ascending id order.
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
