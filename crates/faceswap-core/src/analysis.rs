//! Face analysis: SCRFD detection followed by ArcFace recognition.

use crate::detector::{DetectorError, FaceDetector};
use crate::pipeline::FaceAnalyzer;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::DetectedFace;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

/// SCRFD detection model file inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognition model file inside the model directory.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Detector + recognizer pair producing faces with identity embeddings.
pub struct FaceAnalysis {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FaceAnalysis {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path, intra_threads: usize) -> Result<Self, AnalysisError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE), intra_threads)?;
        let recognizer =
            FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE), intra_threads)?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceAnalyzer for FaceAnalysis {
    type Error = AnalysisError;

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalysisError> {
        let boxes = self.detector.detect(image)?;
        boxes
            .into_iter()
            .map(|bbox| {
                let embedding = self.recognizer.extract(image, &bbox)?;
                Ok(DetectedFace {
                    bbox,
                    embedding: Some(embedding),
                })
            })
            .collect()
    }
}
