use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

impl BoundingBox {
    /// Clamp the box to a `width` x `height` image, returning integer
    /// `(x, y, w, h)`. Returns `None` when nothing of the box is left.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }

    /// Cut this box out of `image`.
    pub fn crop(&self, image: &RgbImage) -> Option<RgbImage> {
        let (x, y, w, h) = self.clamp_to(image.width(), image.height())?;
        Some(image::imageops::crop_imm(image, x, y, w, h).to_image())
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Embeddings of different dimension are never comparable and yield
    /// `f32::INFINITY`.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face found in one frame by the external analyzer.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// `None` when the encoder failed for this face; such detections are skipped.
    pub embedding: Option<Embedding>,
    /// Face crop taken from the frame, kept as the track's latest appearance.
    pub crop: Option<RgbImage>,
}

impl Detection {
    pub fn new(bbox: BoundingBox, embedding: Embedding) -> Self {
        Self {
            bbox,
            embedding: Some(embedding),
            crop: None,
        }
    }
}

/// Render-ready output of reconciling one detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderEntry {
    pub bbox: BoundingBox,
    pub label: String,
    pub description: String,
    pub landmarks: Option<Landmarks>,
    /// `true` when the label names a confirmed identity rather than a track.
    pub known: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 1.0,
            landmarks: None,
        }
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_euclidean_distance_dimension_mismatch() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.0, 0.0, 0.0]);
        assert!(a.euclidean_distance(&b).is_infinite());
    }

    #[test]
    fn test_clamp_inside() {
        assert_eq!(bbox(10.0, 20.0, 30.0, 40.0).clamp_to(100, 100), Some((10, 20, 30, 40)));
    }

    #[test]
    fn test_clamp_partially_outside() {
        assert_eq!(bbox(-5.0, 90.0, 20.0, 20.0).clamp_to(100, 100), Some((0, 90, 15, 10)));
    }

    #[test]
    fn test_clamp_fully_outside() {
        assert_eq!(bbox(200.0, 200.0, 10.0, 10.0).clamp_to(100, 100), None);
    }

    #[test]
    fn test_crop_dimensions() {
        let image = RgbImage::new(64, 48);
        let crop = bbox(8.0, 8.0, 16.0, 24.0).crop(&image).unwrap();
        assert_eq!(crop.dimensions(), (16, 24));
    }
}
