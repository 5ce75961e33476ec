use facetrack_core::{
    best_match, BoundingBox, Detection, Embedding, FaceTracker, IdentityStore, Portrait, PromotionRequest,
    TrackerError, TrackerOptions,
};
use image::{Rgb, RgbImage};
use std::path::Path;

fn emb(values: &[f32]) -> Embedding {
    Embedding::new(values.to_vec())
}

fn detection(values: &[f32]) -> Detection {
    let bbox = BoundingBox {
        x: 10.0,
        y: 10.0,
        width: 20.0,
        height: 20.0,
        confidence: 0.95,
        landmarks: None,
    };
    Detection {
        crop: Some(RgbImage::from_pixel(20, 20, Rgb([120, 100, 90]))),
        ..Detection::new(bbox, emb(values))
    }
}

fn tracker_with(dir: &Path, identities: &[(&str, &[f32])]) -> FaceTracker {
    let mut store = IdentityStore::open(dir).unwrap();
    for (name, values) in identities {
        let portrait = Portrait {
            image: RgbImage::new(8, 8),
            embedding: emb(values),
        };
        store.create(name, "", &portrait).unwrap();
    }
    FaceTracker::with_store(store, TrackerOptions::default())
}

fn labels(tracker: &FaceTracker) -> Vec<String> {
    tracker.current().iter().map(|e| e.label.clone()).collect()
}

#[test]
fn comparator_matches_within_and_rejects_beyond_tolerance() {
    let reference = emb(&[0.0, 0.0, 0.0]);
    for offset in [0.0, 0.1, 0.3, 0.5] {
        assert_eq!(best_match(&emb(&[offset, 0.0, 0.0]), [&reference], 0.5), Some(0), "offset {offset}");
    }
    for offset in [0.51, 1.0, 10.0] {
        assert_eq!(best_match(&emb(&[offset, 0.0, 0.0]), [&reference], 0.5), None, "offset {offset}");
    }
    assert_eq!(best_match(&reference, std::iter::empty(), 0.5), None);
}

#[test]
fn known_identity_is_labelled_without_a_track() {
    let dir = tempfile::tempdir().unwrap();
    let mut tracker = tracker_with(dir.path(), &[("Alice", &[1.0, 0.0])]);

    tracker.reconcile_frame(vec![detection(&[0.95, 0.05])]);
    assert_eq!(labels(&tracker), vec!["Alice"]);
    assert_eq!(tracker.tracks().count(), 0);
}

#[test]
fn unknown_face_keeps_one_track_across_frames() {
    let dir = tempfile::tempdir().unwrap();
    let mut tracker = tracker_with(dir.path(), &[("Alice", &[1.0, 0.0])]);

    tracker.reconcile_frame(vec![detection(&[-3.0, 4.0])]);
    assert_eq!(labels(&tracker), vec!["Unknown_1"]);
    tracker.reconcile_frame(vec![detection(&[-3.0, 4.0])]);
    assert_eq!(labels(&tracker), vec!["Unknown_1"]);
    assert_eq!(tracker.tracks().count(), 1);
}

#[test]
fn track_missing_for_one_frame_is_evicted() {
    let dir = tempfile::tempdir().unwrap();
    let mut tracker = tracker_with(dir.path(), &[]);

    tracker.reconcile_frame(vec![detection(&[1.0]), detection(&[5.0]), detection(&[9.0])]);
    assert_eq!(labels(&tracker), vec!["Unknown_1", "Unknown_2", "Unknown_3"]);

    tracker.reconcile_frame(vec![detection(&[1.0]), detection(&[5.0])]);
    let ids: Vec<u32> = tracker.tracks().map(|t| t.id).collect();
    assert_eq!(ids, vec![1, 2]);

    assert!(matches!(
        tracker.promote(3, PromotionRequest::default()),
        Err(TrackerError::TrackNotFound(_))
    ));
}

#[test]
fn track_ids_are_never_reused() {
    let dir = tempfile::tempdir().unwrap();
    let mut tracker = tracker_with(dir.path(), &[]);

    let crowd: Vec<Detection> = (0..5).map(|i| detection(&[i as f32 * 10.0])).collect();
    tracker.reconcile_frame(crowd);
    tracker.reconcile_frame(Vec::new());
    assert_eq!(tracker.tracks().count(), 0);

    tracker.reconcile_frame(vec![detection(&[0.0])]);
    let ids: Vec<u32> = tracker.tracks().map(|t| t.id).collect();
    assert_eq!(ids, vec![6]);
}

#[test]
fn promotion_moves_track_into_store_with_next_id() {
    let dir = tempfile::tempdir().unwrap();
    let mut tracker = tracker_with(dir.path(), &[("Alice", &[1.0, 0.0]), ("Bob", &[0.0, 1.0])]);

    tracker.reconcile_frame(vec![detection(&[-5.0, -5.0])]);
    let before = tracker.identities().len();
    let request = PromotionRequest {
        name: Some("Carol".into()),
        description: Some("new colleague".into()),
        portrait: None,
    };
    let carol = tracker.promote(1, request).unwrap();

    assert_eq!(carol.id, 3);
    assert_eq!(tracker.identities().len(), before + 1);
    assert_eq!(tracker.tracks().count(), 0);

    tracker.reconcile_frame(vec![detection(&[-5.0, -5.0])]);
    assert_eq!(labels(&tracker), vec!["Carol"]);
    assert_eq!(tracker.current()[0].description, "new colleague");
}

#[test]
fn rename_onto_existing_storage_is_not_destructive() {
    let dir = tempfile::tempdir().unwrap();
    let mut tracker = tracker_with(dir.path(), &[("Alice", &[1.0, 0.0]), ("Bob", &[0.0, 1.0])]);
    let bob_embedding = std::fs::read(dir.path().join("Bob/Bob.json")).unwrap();

    let edit = facetrack_core::IdentityEdit {
        name: Some("Bob".into()),
        ..Default::default()
    };
    let renamed = tracker.edit_identity("Alice", edit).unwrap();

    assert_ne!(renamed.name, "Bob");
    assert_eq!(std::fs::read(dir.path().join("Bob/Bob.json")).unwrap(), bob_embedding);
    assert!(tracker.identity("Bob").is_some());
    assert!(tracker.identity(&renamed.name).is_some());
}

#[test]
fn catalog_round_trip_preserves_records() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = tracker_with(dir.path(), &[("Alice", &[1.0, 0.0]), ("Bob", &[0.0, 1.0])]);
    let saved: Vec<_> = tracker.identities().to_vec();
    tracker.shutdown().unwrap();

    let reloaded = IdentityStore::open(dir.path()).unwrap();
    assert_eq!(reloaded.len(), saved.len());
    for (before, after) in saved.iter().zip(reloaded.identities()) {
        assert!(before.same_record(after));
    }
}

#[test]
fn reloaded_identities_still_match() {
    let dir = tempfile::tempdir().unwrap();
    tracker_with(dir.path(), &[("Alice", &[1.0, 0.0])]).shutdown().unwrap();

    let store = IdentityStore::open(dir.path()).unwrap();
    let mut tracker = FaceTracker::with_store(store, TrackerOptions::default());
    tracker.reconcile_frame(vec![detection(&[1.0, 0.1])]);
    assert_eq!(labels(&tracker), vec!["Alice"]);
}
