//! Turning tracks into identities, and editing identities afterwards.

use crate::analyzer::Portrait;
use crate::registry::{TrackId, TrackNotFound, TrackRegistry};
use crate::store::{validate_name, Identity, IdentityStore};
use crate::tracker::TrackerError;

/// User input for promoting a track.
#[derive(Debug, Clone, Default)]
pub struct PromotionRequest {
    /// Defaults to the track's `Unknown_<id>` label.
    pub name: Option<String>,
    /// Defaults to the track's description.
    pub description: Option<String>,
    /// Defaults to the track's last crop and embedding.
    pub portrait: Option<Portrait>,
}

/// Changes to an existing identity. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct IdentityEdit {
    pub name: Option<String>,
    pub description: Option<String>,
    pub portrait: Option<Portrait>,
}

impl IdentityEdit {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.portrait.is_none()
    }
}

/// Persist `track_id` as a new identity and drop the track.
///
/// The track is only removed once its identity is on disk, so a failed
/// write leaves it in the registry for another attempt.
pub fn promote(
    store: &mut IdentityStore,
    registry: &mut TrackRegistry,
    track_id: TrackId,
    request: PromotionRequest,
) -> Result<Identity, TrackerError> {
    let track = registry.get(track_id).ok_or(TrackNotFound(track_id))?;

    let portrait = match request.portrait {
        Some(portrait) => portrait,
        None => Portrait {
            image: track.crop.clone().ok_or(TrackerError::NoPhoto)?,
            embedding: track.encoding.clone(),
        },
    };
    let name = request.name.unwrap_or_else(|| track.name.clone());
    let description = request.description.unwrap_or_else(|| track.description.clone());

    let identity = store.create(&name, &description, &portrait)?;
    registry.promote(track_id)?;
    tracing::info!(track_id, id = identity.id, name = %identity.name, "track promoted");
    Ok(identity)
}

/// Apply `edit` to the identity called `name`. A rename relocates storage
/// the same way promotion does; a new portrait replaces photo and embedding.
///
/// The portrait is written before the folder moves, so a failed write
/// leaves the identity under its old name.
pub fn edit(store: &mut IdentityStore, name: &str, edit: IdentityEdit) -> Result<Identity, TrackerError> {
    if store.get(name).is_none() {
        return Err(TrackerError::IdentityNotFound(name.to_string()));
    }
    if let Some(new_name) = edit.name.as_deref() {
        validate_name(new_name)?;
    }

    if let Some(portrait) = &edit.portrait {
        store.replace_portrait(name, portrait)?;
    }
    if let Some(description) = edit.description.as_deref() {
        store.set_description(name, description)?;
    }
    let current = match edit.name.as_deref() {
        Some(new_name) => store.rename(name, new_name)?,
        None => name.to_string(),
    };

    let identity = store
        .get(&current)
        .cloned()
        .ok_or_else(|| TrackerError::IdentityNotFound(current.clone()))?;
    tracing::info!(id = identity.id, from = name, name = %identity.name, "identity edited");
    Ok(identity)
}
