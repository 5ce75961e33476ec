//! The reconciliation context: one owner for the identity store, the track
//! registry and the last frame's render list.
//!
//! Every operation takes `&mut self`, so whoever owns a [`FaceTracker`] is
//! the single writer. The daemon keeps it on its engine thread and serves
//! frames and control requests from there in sequence.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::matcher::DEFAULT_TOLERANCE;
use crate::promotion::{self, IdentityEdit, PromotionRequest};
use crate::reconciler::{self, ReconcileOptions};
use crate::registry::{Track, TrackId, TrackNotFound, TrackRegistry};
use crate::store::{Identity, IdentityStore, ScanReport, StoreError};
use crate::types::{Detection, RenderEntry};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error(transparent)]
    TrackNotFound(#[from] TrackNotFound),
    #[error("identity not found: {0}")]
    IdentityNotFound(String),
    #[error("no face detected in the supplied photo")]
    NoFaceDetected,
    #[error("track has no photo, supply one")]
    NoPhoto,
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("analyzer error: {0}")]
    Analyzer(AnalyzerError),
}

impl From<StoreError> for TrackerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(name) => Self::IdentityNotFound(name),
            StoreError::NoFace(_) | StoreError::Analyzer(AnalyzerError::NoFaceDetected) => Self::NoFaceDetected,
            other => Self::Store(other),
        }
    }
}

impl From<AnalyzerError> for TrackerError {
    fn from(e: AnalyzerError) -> Self {
        match e {
            AnalyzerError::NoFaceDetected => Self::NoFaceDetected,
            other => Self::Analyzer(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerOptions {
    pub tolerance: f32,
    /// Write the catalog after every promotion, edit and delete instead of
    /// only at shutdown.
    pub persist_on_edit: bool,
    pub draw_landmarks: bool,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            persist_on_edit: true,
            draw_landmarks: false,
        }
    }
}

/// Counters reported by [`FaceTracker::status`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct TrackerStatus {
    pub data_dir: PathBuf,
    pub identities: usize,
    pub tracks: usize,
    pub current_faces: usize,
    pub frames: u64,
    pub tolerance: f32,
    pub draw_landmarks: bool,
}

pub struct FaceTracker {
    store: IdentityStore,
    registry: TrackRegistry,
    options: TrackerOptions,
    current: Vec<RenderEntry>,
    frames: u64,
}

impl FaceTracker {
    /// Load the catalog under `data_dir` and pick up anything added to
    /// storage out of band.
    pub fn open(
        data_dir: impl Into<PathBuf>,
        options: TrackerOptions,
        analyzer: &mut dyn FaceAnalyzer,
    ) -> Result<Self, TrackerError> {
        let mut tracker = Self::with_store(IdentityStore::open(data_dir)?, options);
        tracker.rescan(analyzer);
        Ok(tracker)
    }

    /// Wrap an already opened store without scanning it.
    pub fn with_store(store: IdentityStore, options: TrackerOptions) -> Self {
        Self {
            store,
            registry: TrackRegistry::new(),
            options,
            current: Vec::new(),
            frames: 0,
        }
    }

    pub fn reconcile_frame(&mut self, detections: Vec<Detection>) -> &[RenderEntry] {
        let options = ReconcileOptions {
            tolerance: self.options.tolerance,
            draw_landmarks: self.options.draw_landmarks,
        };
        self.current = reconciler::reconcile_frame(&mut self.store, &mut self.registry, detections, options);
        self.frames += 1;
        &self.current
    }

    /// Render list of the most recent frame.
    pub fn current(&self) -> &[RenderEntry] {
        &self.current
    }

    pub fn identities(&self) -> &[Identity] {
        self.store.identities()
    }

    pub fn identity(&self, name: &str) -> Option<&Identity> {
        self.store.get(name)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.registry.tracks()
    }

    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    pub fn options(&self) -> TrackerOptions {
        self.options
    }

    pub fn promote(&mut self, track_id: TrackId, request: PromotionRequest) -> Result<Identity, TrackerError> {
        let identity = promotion::promote(&mut self.store, &mut self.registry, track_id, request)?;
        self.forget_current(|entry| !entry.known && entry.label == format!("Unknown_{track_id}"));
        self.persist_after_edit();
        Ok(identity)
    }

    pub fn edit_identity(&mut self, name: &str, edit: IdentityEdit) -> Result<Identity, TrackerError> {
        if edit.is_empty() {
            return self
                .identity(name)
                .cloned()
                .ok_or_else(|| TrackerError::IdentityNotFound(name.to_string()));
        }
        let result = promotion::edit(&mut self.store, name, edit);

        // A failed edit may still have applied its earlier steps.
        let label = match &result {
            Ok(identity) => identity.name.as_str(),
            Err(_) => name,
        };
        if let Some(identity) = self.store.get(label) {
            for entry in self.current.iter_mut().filter(|e| e.known && e.label == name) {
                entry.label = identity.name.clone();
                entry.description = identity.description.clone();
            }
        }
        if !matches!(result, Err(TrackerError::IdentityNotFound(_))) {
            self.persist_after_edit();
        }
        result
    }

    pub fn delete_identity(&mut self, name: &str) -> Result<(), TrackerError> {
        self.store.delete(name)?;
        self.forget_current(|entry| entry.known && entry.label == name);
        self.persist_after_edit();
        Ok(())
    }

    pub fn set_track_description(&mut self, track_id: TrackId, description: &str) -> Result<(), TrackerError> {
        self.registry.set_description(track_id, description)?;
        Ok(())
    }

    pub fn set_draw_landmarks(&mut self, enabled: bool) {
        self.options.draw_landmarks = enabled;
    }

    pub fn rescan(&mut self, analyzer: &mut dyn FaceAnalyzer) -> ScanReport {
        let report = self.store.scan(analyzer);
        if !report.added.is_empty() || report.encoded > 0 {
            self.persist_after_edit();
        }
        report
    }

    pub fn status(&self) -> TrackerStatus {
        TrackerStatus {
            data_dir: self.store.root().to_path_buf(),
            identities: self.store.len(),
            tracks: self.registry.len(),
            current_faces: self.current.len(),
            frames: self.frames,
            tolerance: self.options.tolerance,
            draw_landmarks: self.options.draw_landmarks,
        }
    }

    /// Write the catalog.
    pub fn persist(&self) -> Result<(), TrackerError> {
        Ok(self.store.persist()?)
    }

    /// Persist the catalog and release the context.
    pub fn shutdown(self) -> Result<(), TrackerError> {
        self.persist()?;
        tracing::info!(identities = self.store.len(), "catalog saved on shutdown");
        Ok(())
    }

    fn persist_after_edit(&self) {
        if !self.options.persist_on_edit {
            return;
        }
        if let Err(e) = self.store.persist() {
            tracing::warn!(error = %e, "failed to persist catalog, will retry at shutdown");
        }
    }

    fn forget_current(&mut self, stale: impl Fn(&RenderEntry) -> bool) {
        self.current.retain(|entry| !stale(entry));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::testing::PixelAnalyzer;
    use crate::analyzer::Portrait;
    use crate::store::CATALOG_FILE;
    use crate::types::{BoundingBox, Embedding};
    use image::{Rgb, RgbImage};

    fn detection(values: &[f32]) -> Detection {
        let bbox = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 4.0,
            height: 4.0,
            confidence: 1.0,
            landmarks: None,
        };
        Detection {
            crop: Some(RgbImage::from_pixel(4, 4, Rgb([90, 90, 90]))),
            ..Detection::new(bbox, Embedding::new(values.to_vec()))
        }
    }

    #[test]
    fn test_open_scans_storage() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(4, 4, Rgb([255, 0, 0]))
            .save(dir.path().join("Hana.png"))
            .unwrap();

        let tracker = FaceTracker::open(dir.path(), TrackerOptions::default(), &mut PixelAnalyzer).unwrap();
        assert_eq!(tracker.identities().len(), 1);
        assert!(dir.path().join(CATALOG_FILE).is_file());
    }

    #[test]
    fn test_promote_then_recognize() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = FaceTracker::open(dir.path(), TrackerOptions::default(), &mut PixelAnalyzer).unwrap();

        let labels = |t: &FaceTracker| t.current().iter().map(|e| e.label.clone()).collect::<Vec<_>>();
        tracker.reconcile_frame(vec![detection(&[0.2, 0.7])]);
        assert_eq!(labels(&tracker), vec!["Unknown_1"]);

        let request = PromotionRequest {
            name: Some("Ivan".into()),
            ..Default::default()
        };
        tracker.promote(1, request).unwrap();
        assert!(tracker.current().is_empty());
        assert_eq!(tracker.tracks().count(), 0);

        tracker.reconcile_frame(vec![detection(&[0.2, 0.7])]);
        assert_eq!(labels(&tracker), vec!["Ivan"]);
        assert_eq!(tracker.tracks().count(), 0);
    }

    #[test]
    fn test_persist_on_edit_disabled_defers_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let options = TrackerOptions {
            persist_on_edit: false,
            ..Default::default()
        };
        let mut tracker = FaceTracker::open(dir.path(), options, &mut PixelAnalyzer).unwrap();
        tracker.reconcile_frame(vec![detection(&[0.5])]);
        tracker.promote(1, PromotionRequest::default()).unwrap();
        assert!(!dir.path().join(CATALOG_FILE).exists());

        tracker.shutdown().unwrap();
        let store = IdentityStore::open(dir.path()).unwrap();
        assert_eq!(store.get("Unknown_1").map(|i| i.id), Some(1));
    }

    #[test]
    fn test_edit_and_delete_update_current() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = IdentityStore::open(dir.path()).unwrap();
        let portrait = Portrait {
            image: RgbImage::new(4, 4),
            embedding: Embedding::new(vec![1.0]),
        };
        store.create("Jo", "", &portrait).unwrap();
        let mut tracker = FaceTracker::with_store(store, TrackerOptions::default());

        tracker.reconcile_frame(vec![detection(&[1.0])]);
        let edit = IdentityEdit {
            name: Some("Joanna".into()),
            ..Default::default()
        };
        tracker.edit_identity("Jo", edit).unwrap();
        assert_eq!(tracker.current()[0].label, "Joanna");

        tracker.delete_identity("Joanna").unwrap();
        assert!(tracker.current().is_empty());
        assert!(matches!(
            tracker.delete_identity("Joanna"),
            Err(TrackerError::IdentityNotFound(_))
        ));
    }

    #[test]
    fn test_track_description_and_landmarks_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = FaceTracker::open(dir.path(), TrackerOptions::default(), &mut PixelAnalyzer).unwrap();
        tracker.reconcile_frame(vec![detection(&[3.0])]);
        tracker.set_track_description(1, "delivery").unwrap();
        tracker.set_draw_landmarks(true);

        tracker.reconcile_frame(vec![detection(&[3.0])]);
        assert_eq!(tracker.current()[0].description, "delivery");
        assert!(tracker.status().draw_landmarks);
        assert_eq!(tracker.status().frames, 2);
        assert!(matches!(
            tracker.set_track_description(9, "x"),
            Err(TrackerError::TrackNotFound(_))
        ));
    }

    #[test]
    fn test_no_face_maps_from_analyzer() {
        let err: TrackerError = AnalyzerError::NoFaceDetected.into();
        assert!(matches!(err, TrackerError::NoFaceDetected));
        let err: TrackerError = StoreError::NotFound("x".into()).into();
        assert!(matches!(err, TrackerError::IdentityNotFound(_)));
    }
}
