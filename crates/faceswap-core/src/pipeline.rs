//! Swap pipeline: load both images, detect faces, run the swap model once.
//!
//! The pipeline is generic over [`FaceAnalyzer`] and [`FaceSwapper`] so the
//! sequencing can be driven by any model pair. Progress is reported at three
//! fixed milestones; the consumer reports completion itself.

use crate::analysis::{AnalysisError, FaceAnalysis};
use crate::swapper::{self, InSwapper, SwapperError, SWAPPER_MODEL_FILE};
use crate::types::{DetectedFace, FaceRole};
use image::RgbImage;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Locates faces in an image.
pub trait FaceAnalyzer {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Faces ordered by descending detection confidence.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, Self::Error>;
}

/// Transplants the identity of `source_face` onto `target_face` in `image`.
pub trait FaceSwapper {
    type Error: std::error::Error + Send + Sync + 'static;

    /// With `paste_back` the result has the dimensions of `image`; without it
    /// the raw aligned crop is returned.
    fn swap(
        &mut self,
        image: &RgbImage,
        target_face: &DetectedFace,
        source_face: &DetectedFace,
        paste_back: bool,
    ) -> Result<RgbImage, Self::Error>;
}

/// Run progress in percent. Only the fixed milestones below are ever emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Progress(u8);

impl Progress {
    /// Both images decoded.
    pub const LOADED: Progress = Progress(20);
    /// Faces found in both images.
    pub const DETECTED: Progress = Progress(50);
    /// Swap model returned.
    pub const SWAPPED: Progress = Progress(90);
    /// Result received by the consumer.
    pub const COMPLETE: Progress = Progress(100);

    pub fn percent(self) -> u8 {
        self.0
    }
}

/// Which model call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStage {
    Load,
    Detection,
    Swap,
}

impl fmt::Display for ModelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelStage::Load => f.write_str("model loading"),
            ModelStage::Detection => f.write_str("face detection"),
            ModelStage::Swap => f.write_str("face swap"),
        }
    }
}

/// Every way a swap run can fail. All are terminal for the run.
#[derive(Error, Debug)]
pub enum SwapError {
    #[error("{role} image not found or not decodable: {path}: {reason}")]
    NotFound {
        role: FaceRole,
        path: String,
        reason: String,
    },
    #[error("no face detected in the {role} image")]
    NoFaceDetected { role: FaceRole },
    #[error("{stage} failed: {message}")]
    ModelFailure { stage: ModelStage, message: String },
    #[error("swap worker exited without reporting a result")]
    WorkerExited,
}

impl SwapError {
    fn model(stage: ModelStage, err: impl std::error::Error) -> Self {
        SwapError::ModelFailure {
            stage,
            message: err.to_string(),
        }
    }
}

/// Raw result of a successful run.
#[derive(Debug, Clone)]
pub struct SwapOutcome {
    /// Swap model output, unchanged.
    pub composite: RgbImage,
    /// The decoded target image, for post-processing.
    pub target: RgbImage,
}

/// Model files needed by the default analyzer and swapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    /// Directory holding the detection and recognition models.
    pub model_dir: PathBuf,
    pub swap_model: PathBuf,
    pub swap_emap: PathBuf,
}

impl ModelPaths {
    /// All models from one directory, using the default file names.
    pub fn in_dir(model_dir: &Path) -> Self {
        Self::with_swap_model(model_dir, &model_dir.join(SWAPPER_MODEL_FILE))
    }

    /// Analysis models from `model_dir`, swap model (and its sidecar emap) from `swap_model`.
    pub fn with_swap_model(model_dir: &Path, swap_model: &Path) -> Self {
        Self {
            model_dir: model_dir.to_path_buf(),
            swap_model: swap_model.to_path_buf(),
            swap_emap: swapper::emap_path_for(swap_model),
        }
    }
}

/// Decode an image file as 8-bit RGB.
pub fn load_image(path: &Path, role: FaceRole) -> Result<RgbImage, SwapError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|e| SwapError::NotFound {
            role,
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

/// Sequences analyzer and swapper calls for one source/target pair.
pub struct SwapPipeline<A, S> {
    analyzer: A,
    swapper: S,
}

impl SwapPipeline<FaceAnalysis, InSwapper> {
    /// Load the SCRFD + ArcFace analyzer and the InSwapper model.
    pub fn load(paths: &ModelPaths, intra_threads: usize) -> Result<Self, SwapError> {
        let analyzer = FaceAnalysis::load(&paths.model_dir, intra_threads)
            .map_err(|e: AnalysisError| SwapError::model(ModelStage::Load, e))?;
        let swapper = InSwapper::load(&paths.swap_model, &paths.swap_emap, intra_threads)
            .map_err(|e: SwapperError| SwapError::model(ModelStage::Load, e))?;
        Ok(Self::new(analyzer, swapper))
    }
}

impl<A: FaceAnalyzer, S: FaceSwapper> SwapPipeline<A, S> {
    pub fn new(analyzer: A, swapper: S) -> Self {
        Self { analyzer, swapper }
    }

    /// Swap the first source face onto the first target face.
    ///
    /// Both images are decoded before any detection runs. `progress` receives
    /// [`Progress::LOADED`], [`Progress::DETECTED`] and [`Progress::SWAPPED`]
    /// in order, stopping at the first failure.
    pub fn run(
        &mut self,
        source_path: &Path,
        target_path: &Path,
        mut progress: impl FnMut(Progress),
    ) -> Result<SwapOutcome, SwapError> {
        let source = load_image(source_path, FaceRole::Source)?;
        let target = load_image(target_path, FaceRole::Target)?;
        tracing::debug!(
            source = ?source.dimensions(),
            target = ?target.dimensions(),
            "images decoded"
        );
        progress(Progress::LOADED);

        let source_faces = self.detect(&source)?;
        let target_faces = self.detect(&target)?;
        tracing::debug!(
            source_faces = source_faces.len(),
            target_faces = target_faces.len(),
            "faces detected"
        );

        // Only the highest-confidence face in each image takes part.
        let source_face = source_faces
            .first()
            .ok_or(SwapError::NoFaceDetected { role: FaceRole::Source })?;
        let target_face = target_faces
            .first()
            .ok_or(SwapError::NoFaceDetected { role: FaceRole::Target })?;
        progress(Progress::DETECTED);

        let composite = self
            .swapper
            .swap(&target, target_face, source_face, true)
            .map_err(|e| SwapError::model(ModelStage::Swap, e))?;
        progress(Progress::SWAPPED);

        tracing::info!(
            source_confidence = source_face.confidence(),
            target_confidence = target_face.confidence(),
            "face swap complete"
        );

        Ok(SwapOutcome { composite, target })
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, SwapError> {
        self.analyzer
            .detect(image)
            .map_err(|e| SwapError::model(ModelStage::Detection, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Embedding};
    use image::Rgb;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    #[derive(Debug, Error)]
    #[error("mock failure")]
    pub struct MockError;

    pub fn face(confidence: f32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox {
                x: 10.0,
                y: 10.0,
                width: 20.0,
                height: 20.0,
                confidence,
                landmarks: Some([
                    (15.0, 15.0),
                    (25.0, 15.0),
                    (20.0, 20.0),
                    (16.0, 25.0),
                    (24.0, 25.0),
                ]),
            },
            embedding: Some(Embedding {
                values: vec![1.0, 0.0],
                model_version: None,
            }),
        }
    }

    /// Returns queued face lists, one per call.
    #[derive(Default)]
    pub struct MockAnalyzer {
        pub responses: VecDeque<Result<Vec<DetectedFace>, MockError>>,
        pub calls: usize,
    }

    impl FaceAnalyzer for MockAnalyzer {
        type Error = MockError;

        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<DetectedFace>, MockError> {
            self.calls += 1;
            self.responses.pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    /// Paints the target white and records what it was called with.
    #[derive(Default)]
    pub struct MockSwapper {
        pub calls: Vec<(f32, f32, bool)>,
        pub fail: bool,
    }

    impl FaceSwapper for MockSwapper {
        type Error = MockError;

        fn swap(
            &mut self,
            image: &RgbImage,
            target_face: &DetectedFace,
            source_face: &DetectedFace,
            paste_back: bool,
        ) -> Result<RgbImage, MockError> {
            self.calls
                .push((target_face.confidence(), source_face.confidence(), paste_back));
            if self.fail {
                return Err(MockError);
            }
            Ok(RgbImage::from_pixel(image.width(), image.height(), Rgb([255, 255, 255])))
        }
    }

    /// Writes a source (64×48) and target (80×60) PNG into a temp dir.
    pub fn write_inputs() -> (TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.png");
        let target = dir.path().join("target.png");
        RgbImage::from_pixel(64, 48, Rgb([200, 150, 100])).save(&source).unwrap();
        RgbImage::from_pixel(80, 60, Rgb([10, 20, 30])).save(&target).unwrap();
        (dir, source, target)
    }

    fn pipeline(
        responses: Vec<Result<Vec<DetectedFace>, MockError>>,
    ) -> SwapPipeline<MockAnalyzer, MockSwapper> {
        SwapPipeline::new(
            MockAnalyzer {
                responses: responses.into(),
                calls: 0,
            },
            MockSwapper::default(),
        )
    }

    #[test]
    fn test_run_success_reports_milestones() {
        let (_dir, source, target) = write_inputs();
        let mut p = pipeline(vec![Ok(vec![face(0.9)]), Ok(vec![face(0.8)])]);

        let mut seen = Vec::new();
        let outcome = p.run(&source, &target, |pr| seen.push(pr.percent())).unwrap();

        assert_eq!(seen, vec![20, 50, 90]);
        assert_eq!(outcome.composite.dimensions(), (80, 60));
        assert_eq!(outcome.target.dimensions(), (80, 60));
        assert_eq!(outcome.target.get_pixel(0, 0), &Rgb([10, 20, 30]));
        assert_eq!(p.swapper.calls, vec![(0.8, 0.9, true)]);
    }

    #[test]
    fn test_run_uses_first_face_of_each() {
        let (_dir, source, target) = write_inputs();
        let mut p = pipeline(vec![
            Ok(vec![face(0.95), face(0.6)]),
            Ok(vec![face(0.85), face(0.7), face(0.55)]),
        ]);
        p.run(&source, &target, |_| {}).unwrap();
        assert_eq!(p.swapper.calls, vec![(0.85, 0.95, true)]);
    }

    #[test]
    fn test_run_no_source_face() {
        let (_dir, source, target) = write_inputs();
        let mut p = pipeline(vec![Ok(vec![]), Ok(vec![face(0.8)])]);

        let mut seen = Vec::new();
        let err = p.run(&source, &target, |pr| seen.push(pr.percent())).unwrap_err();

        assert!(matches!(err, SwapError::NoFaceDetected { role: FaceRole::Source }), "{err}");
        assert_eq!(seen, vec![20]);
        assert!(p.swapper.calls.is_empty());
    }

    #[test]
    fn test_run_no_target_face() {
        let (_dir, source, target) = write_inputs();
        let mut p = pipeline(vec![Ok(vec![face(0.9)]), Ok(vec![])]);
        let err = p.run(&source, &target, |_| {}).unwrap_err();
        assert!(matches!(err, SwapError::NoFaceDetected { role: FaceRole::Target }), "{err}");
        assert_eq!(err.to_string(), "no face detected in the target image");
        assert!(p.swapper.calls.is_empty());
    }

    #[test]
    fn test_run_missing_file_fails_before_detection() {
        let (dir, source, _target) = write_inputs();
        let missing = dir.path().join("missing.jpg");
        let mut p = pipeline(vec![Ok(vec![face(0.9)]), Ok(vec![face(0.8)])]);

        let mut seen = Vec::new();
        let err = p.run(&source, &missing, |pr| seen.push(pr.percent())).unwrap_err();

        assert!(matches!(err, SwapError::NotFound { role: FaceRole::Target, .. }), "{err}");
        assert_eq!(p.analyzer.calls, 0);
        assert!(seen.is_empty());
    }

    #[test]
    fn test_run_undecodable_file() {
        let (dir, _source, target) = write_inputs();
        let garbage = dir.path().join("garbage.png");
        std::fs::write(&garbage, b"not an image").unwrap();
        let mut p = pipeline(vec![]);

        let err = p.run(&garbage, &target, |_| {}).unwrap_err();
        assert!(matches!(err, SwapError::NotFound { role: FaceRole::Source, .. }), "{err}");
        assert_eq!(p.analyzer.calls, 0);
    }

    #[test]
    fn test_run_detection_failure() {
        let (_dir, source, target) = write_inputs();
        let mut p = pipeline(vec![Err(MockError)]);
        let err = p.run(&source, &target, |_| {}).unwrap_err();
        match err {
            SwapError::ModelFailure { stage, message } => {
                assert_eq!(stage, ModelStage::Detection);
                assert_eq!(message, "mock failure");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_run_swap_failure() {
        let (_dir, source, target) = write_inputs();
        let mut p = pipeline(vec![Ok(vec![face(0.9)]), Ok(vec![face(0.8)])]);
        p.swapper.fail = true;

        let mut seen = Vec::new();
        let err = p.run(&source, &target, |pr| seen.push(pr.percent())).unwrap_err();
        assert!(matches!(err, SwapError::ModelFailure { stage: ModelStage::Swap, .. }));
        assert_eq!(seen, vec![20, 50]);
    }

    #[test]
    fn test_model_paths_in_dir() {
        let paths = ModelPaths::in_dir(Path::new("/models"));
        assert_eq!(paths.swap_model, PathBuf::from("/models/inswapper_128.onnx"));
        assert_eq!(paths.swap_emap, PathBuf::from("/models/inswapper_128.emap"));
    }

    #[test]
    fn test_load_missing_models_is_load_failure() {
        let paths = ModelPaths::in_dir(Path::new("/nonexistent/models"));
        let err = SwapPipeline::load(&paths, 1).err();
        assert!(matches!(
            err,
            Some(SwapError::ModelFailure { stage: ModelStage::Load, .. })
        ));
    }

    #[test]
    fn test_progress_order() {
        assert!(Progress::LOADED < Progress::DETECTED);
        assert!(Progress::DETECTED < Progress::SWAPPED);
        assert!(Progress::SWAPPED < Progress::COMPLETE);
        assert_eq!(Progress::COMPLETE.percent(), 100);
    }
}
