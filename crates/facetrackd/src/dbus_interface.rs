use crate::engine::{EngineError, EngineHandle};
use facetrack_core::TrackerError;
use serde::Serialize;
use std::path::PathBuf;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.facetrack.Tracker1";
pub const OBJECT_PATH: &str = "/org/facetrack/Tracker1";

/// D-Bus interface for the facetrack daemon.
///
/// Bus name: org.facetrack.Tracker1
/// Object path: /org/facetrack/Tracker1
///
/// Results are JSON strings. Empty name and path arguments mean "not given".
/// Descriptions are passed verbatim; `EditIdentity` takes a flag saying
/// whether to apply one, so a description can be cleared.
pub struct TrackerService {
    engine: EngineHandle,
}

impl TrackerService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Description text as given, `None` when empty.
fn verbatim(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn description_arg(set: bool, text: &str) -> Option<String> {
    set.then(|| text.to_string())
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization failed: {e}")))
}

fn to_fdo(e: EngineError) -> fdo::Error {
    match e {
        EngineError::Tracker(TrackerError::TrackNotFound(_) | TrackerError::IdentityNotFound(_)) => {
            fdo::Error::UnknownObject(e.to_string())
        }
        EngineError::Tracker(TrackerError::NoFaceDetected | TrackerError::NoPhoto) | EngineError::Photo { .. } => {
            fdo::Error::InvalidArgs(e.to_string())
        }
        other => fdo::Error::Failed(other.to_string()),
    }
}

#[interface(name = "org.facetrack.Tracker1")]
impl TrackerService {
    /// All confirmed identities in catalog order.
    async fn list_identities(&self) -> fdo::Result<String> {
        to_json(&self.engine.list_identities().await.map_err(to_fdo)?)
    }

    async fn identity(&self, name: &str) -> fdo::Result<String> {
        match self.engine.identity(name.to_string()).await.map_err(to_fdo)? {
            Some(identity) => to_json(&identity),
            None => Err(fdo::Error::UnknownObject(format!("identity not found: {name}"))),
        }
    }

    /// Provisional tracks currently alive.
    async fn list_tracks(&self) -> fdo::Result<String> {
        to_json(&self.engine.list_tracks().await.map_err(to_fdo)?)
    }

    /// Render entries of the most recent frame.
    async fn current_faces(&self) -> fdo::Result<String> {
        to_json(&self.engine.current_faces().await.map_err(to_fdo)?)
    }

    /// Promote a track to an identity. Returns the identity, whose name may
    /// differ from the requested one if that was already taken.
    async fn promote(&self, track_id: u32, name: &str, description: &str, photo_path: &str) -> fdo::Result<String> {
        tracing::info!(track_id, name, "promote requested");
        let identity = self
            .engine
            .promote(
                track_id,
                non_empty(name),
                verbatim(description),
                non_empty(photo_path).map(PathBuf::from),
            )
            .await
            .map_err(to_fdo)?;
        to_json(&identity)
    }

    async fn edit_identity(
        &self,
        name: &str,
        new_name: &str,
        set_description: bool,
        new_description: &str,
        photo_path: &str,
    ) -> fdo::Result<String> {
        tracing::info!(name, new_name, set_description, "edit requested");
        let identity = self
            .engine
            .edit_identity(
                name.to_string(),
                non_empty(new_name),
                description_arg(set_description, new_description),
                non_empty(photo_path).map(PathBuf::from),
            )
            .await
            .map_err(to_fdo)?;
        to_json(&identity)
    }

    async fn delete_identity(&self, name: &str) -> fdo::Result<()> {
        tracing::info!(name, "delete requested");
        self.engine.delete_identity(name.to_string()).await.map_err(to_fdo)
    }

    async fn set_track_description(&self, track_id: u32, description: &str) -> fdo::Result<()> {
        self.engine
            .set_track_description(track_id, description.to_string())
            .await
            .map_err(to_fdo)
    }

    async fn set_draw_landmarks(&self, enabled: bool) -> fdo::Result<()> {
        self.engine.set_draw_landmarks(enabled).await.map_err(to_fdo)
    }

    /// Re-scan storage for images added out of band.
    async fn rescan(&self) -> fdo::Result<String> {
        to_json(&self.engine.rescan().await.map_err(to_fdo)?)
    }

    async fn status(&self) -> fdo::Result<String> {
        to_json(&self.engine.status().await.map_err(to_fdo)?)
    }
}
