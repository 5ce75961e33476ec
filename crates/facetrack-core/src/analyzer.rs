//! The face analysis capability: detection plus per-face encoding.
//!
//! Everything downstream only sees [`FaceAnalyzer`]; [`OnnxAnalyzer`] is the
//! SCRFD + ArcFace implementation used by the daemon.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{Detection, Embedding};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("no face detected")]
    NoFaceDetected,
}

/// Finds faces in an RGB image and encodes each one.
pub trait FaceAnalyzer: Send {
    /// Detections in descending confidence order. A face whose encoding
    /// failed is still reported, with `embedding: None`.
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<Detection>, AnalyzerError>;
}

/// A representative photo together with its embedding.
#[derive(Debug, Clone)]
pub struct Portrait {
    pub image: RgbImage,
    pub embedding: Embedding,
}

impl Portrait {
    /// Encode a user-supplied photo, cropped to its most confident face.
    pub fn from_image(analyzer: &mut dyn FaceAnalyzer, image: &RgbImage) -> Result<Self, AnalyzerError> {
        let detection = analyzer
            .analyze(image)?
            .into_iter()
            .find(|d| d.embedding.is_some())
            .ok_or(AnalyzerError::NoFaceDetected)?;
        let crop = detection.bbox.crop(image).unwrap_or_else(|| image.clone());
        Ok(Self {
            image: crop,
            embedding: detection.embedding.ok_or(AnalyzerError::NoFaceDetected)?,
        })
    }
}

/// Embedding of the most confident encodable face in `image`.
pub fn encode_image(analyzer: &mut dyn FaceAnalyzer, image: &RgbImage) -> Result<Embedding, AnalyzerError> {
    analyzer
        .analyze(image)?
        .into_iter()
        .find_map(|d| d.embedding)
        .ok_or(AnalyzerError::NoFaceDetected)
}

/// SCRFD detection followed by ArcFace encoding of every face.
pub struct OnnxAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxAnalyzer {
    pub fn load(scrfd_path: &Path, arcface_path: &Path) -> Result<Self, AnalyzerError> {
        Ok(Self {
            detector: FaceDetector::load(scrfd_path)?,
            recognizer: FaceRecognizer::load(arcface_path)?,
        })
    }
}

impl FaceAnalyzer for OnnxAnalyzer {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<Detection>, AnalyzerError> {
        let faces = self.detector.detect(image)?;
        let mut detections = Vec::with_capacity(faces.len());
        for bbox in faces {
            let embedding = match self.recognizer.extract(image, &bbox) {
                Ok(embedding) => Some(embedding),
                Err(RecognizerError::NoLandmarks) => None,
                Err(e) => {
                    tracing::debug!(error = %e, "face encoding failed");
                    None
                }
            };
            let crop = bbox.crop(image);
            detections.push(Detection { bbox, embedding, crop });
        }
        Ok(detections)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::PixelAnalyzer;
    use super::*;
    use image::Rgb;

    #[test]
    fn test_portrait_from_image() {
        let image = RgbImage::from_pixel(8, 8, Rgb([255, 0, 0]));
        let portrait = Portrait::from_image(&mut PixelAnalyzer, &image).unwrap();
        assert_eq!(portrait.image.dimensions(), (8, 8));
        assert_eq!(portrait.embedding.values, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_portrait_without_face() {
        let image = RgbImage::new(8, 8);
        let err = Portrait::from_image(&mut PixelAnalyzer, &image).unwrap_err();
        assert!(matches!(err, AnalyzerError::NoFaceDetected));
    }

    #[test]
    fn test_encode_image() {
        let image = RgbImage::from_pixel(4, 4, Rgb([0, 255, 0]));
        let embedding = encode_image(&mut PixelAnalyzer, &image).unwrap();
        assert_eq!(embedding.values, vec![0.0, 1.0, 0.0]);
    }
}
