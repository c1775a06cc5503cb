//! faceswap-core — Face analysis, face swap and blending.
//!
//! Uses SCRFD for face detection, ArcFace for identity embeddings and
//! InSwapper for the swap itself, all running via ONNX Runtime on the CPU.

pub mod alignment;
pub mod analysis;
pub mod blend;
pub mod detector;
pub mod pipeline;
pub mod recognizer;
pub mod swapper;
pub mod types;

pub use analysis::FaceAnalysis;
pub use blend::{blend, BlendError, Strength};
pub use detector::FaceDetector;
pub use pipeline::{
    FaceAnalyzer, FaceSwapper, ModelPaths, ModelStage, Progress, SwapError, SwapOutcome,
    SwapPipeline,
};
pub use recognizer::FaceRecognizer;
pub use swapper::InSwapper;
pub use types::{BoundingBox, DetectedFace, Embedding, FaceRole, Landmarks};

use std::path::PathBuf;

/// Default model directory: `$XDG_DATA_HOME/faceswap/models`, falling back to
/// `$HOME/.local/share/faceswap/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceswap")
        .join("models")
}
