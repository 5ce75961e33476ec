//! facetrack-core: live face identity reconciliation.
//!
//! Each frame's detections are matched against a durable gallery of
//! confirmed identities; faces nobody knows get a provisional track that a
//! user can later promote into the gallery. Detection and encoding run
//! through SCRFD and ArcFace on ONNX Runtime behind the [`FaceAnalyzer`]
//! trait.

pub mod alignment;
pub mod analyzer;
pub mod detector;
pub mod matcher;
pub mod promotion;
pub mod recognizer;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod tracker;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxAnalyzer, Portrait};
pub use matcher::{best_match, EuclideanMatcher, Matcher, DEFAULT_TOLERANCE};
pub use promotion::{IdentityEdit, PromotionRequest};
pub use registry::{Track, TrackId, TrackNotFound, TrackRegistry};
pub use store::{Identity, IdentityStore, ScanReport, StoreError};
pub use tracker::{FaceTracker, TrackerError, TrackerOptions, TrackerStatus};
pub use types::{BoundingBox, Detection, Embedding, Landmarks, RenderEntry};
