//! Per-frame reconciliation of detections against identities and tracks.

use crate::matcher::DEFAULT_TOLERANCE;
use crate::registry::TrackRegistry;
use crate::store::IdentityStore;
use crate::types::{Detection, RenderEntry};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcileOptions {
    pub tolerance: f32,
    /// Attach detector landmarks to render entries.
    pub draw_landmarks: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            draw_landmarks: false,
        }
    }
}

/// Run one frame: label every encodable detection, in input order, by the
/// first matching identity, else by its provisional track. Tracks not seen
/// in this frame are evicted before returning.
pub fn reconcile_frame(
    store: &mut IdentityStore,
    registry: &mut TrackRegistry,
    detections: Vec<Detection>,
    options: ReconcileOptions,
) -> Vec<RenderEntry> {
    registry.begin_frame();
    let mut entries = Vec::with_capacity(detections.len());

    for detection in detections {
        let Some(embedding) = detection.embedding else {
            tracing::trace!("detection without embedding skipped");
            continue;
        };
        let landmarks = if options.draw_landmarks {
            detection.bbox.landmarks
        } else {
            None
        };

        let entry = match store.find_match(&embedding, options.tolerance) {
            Some(identity) => RenderEntry {
                bbox: detection.bbox,
                label: identity.name.clone(),
                description: identity.description.clone(),
                landmarks,
                known: true,
            },
            None => {
                let (track, _) =
                    registry.get_or_create(embedding, detection.bbox.clone(), detection.crop, options.tolerance);
                RenderEntry {
                    bbox: detection.bbox,
                    label: track.name.clone(),
                    description: track.description.clone(),
                    landmarks,
                    known: false,
                }
            }
        };
        entries.push(entry);
    }

    let evicted = registry.end_frame();
    tracing::trace!(faces = entries.len(), evicted = evicted.len(), "frame reconciled");
    entries
}
