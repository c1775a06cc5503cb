//! Background execution: one worker thread per swap run.
//!
//! The worker performs all blocking work (model loading, image decoding,
//! inference) and reports back over an ordered one-way channel: zero or more
//! progress events, then exactly one of `Finished` or `Failed`.

use crate::session::SwapRequest;
use faceswap_core::{FaceAnalyzer, FaceSwapper, Progress, SwapError, SwapOutcome, SwapPipeline};
use tokio::sync::mpsc;

/// Messages sent from the worker thread to the front end.
#[derive(Debug)]
pub enum SwapEvent {
    Progress(Progress),
    Finished(SwapOutcome),
    Failed(SwapError),
}

/// Receiving end of one run.
pub struct SwapRun {
    rx: mpsc::UnboundedReceiver<SwapEvent>,
    done: bool,
}

impl SwapRun {
    /// Next event from the worker, or `None` once a terminal event was delivered.
    ///
    /// A worker that disappears without reporting yields
    /// `Failed(SwapError::WorkerExited)`.
    pub async fn next_event(&mut self) -> Option<SwapEvent> {
        if self.done {
            return None;
        }
        let event = self
            .rx
            .recv()
            .await
            .unwrap_or(SwapEvent::Failed(SwapError::WorkerExited));
        if matches!(event, SwapEvent::Finished(_) | SwapEvent::Failed(_)) {
            self.done = true;
        }
        Some(event)
    }

    /// Drive the run to completion, forwarding progress.
    ///
    /// [`Progress::COMPLETE`] is reported here, on receipt of the result.
    pub async fn wait(
        mut self,
        mut on_progress: impl FnMut(Progress),
    ) -> Result<SwapOutcome, SwapError> {
        while let Some(event) = self.next_event().await {
            match event {
                SwapEvent::Progress(p) => on_progress(p),
                SwapEvent::Finished(outcome) => {
                    on_progress(Progress::COMPLETE);
                    return Ok(outcome);
                }
                SwapEvent::Failed(err) => return Err(err),
            }
        }
        Err(SwapError::WorkerExited)
    }
}

/// Spawn a worker thread for `request`.
///
/// `build` runs on the worker, so model loading never blocks the caller.
pub fn spawn_swap<A, S, F>(request: &SwapRequest, build: F) -> std::io::Result<SwapRun>
where
    A: FaceAnalyzer,
    S: FaceSwapper,
    F: FnOnce() -> Result<SwapPipeline<A, S>, SwapError> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let source = request.source.clone();
    let target = request.target.clone();

    std::thread::Builder::new()
        .name("faceswap-worker".into())
        .spawn(move || {
            tracing::debug!("worker thread started");
            let result = build().and_then(|mut pipeline| {
                pipeline.run(&source, &target, |p| {
                    let _ = tx.send(SwapEvent::Progress(p));
                })
            });
            let event = match result {
                Ok(outcome) => SwapEvent::Finished(outcome),
                Err(err) => {
                    tracing::warn!(error = %err, "swap run failed");
                    SwapEvent::Failed(err)
                }
            };
            let _ = tx.send(event);
            tracing::debug!("worker thread exiting");
        })?;

    Ok(SwapRun { rx, done: false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceswap_core::{BoundingBox, DetectedFace, FaceRole, ModelPaths, Strength};
    use image::{Rgb, RgbImage};
    use std::path::{Path, PathBuf};

    #[derive(Debug, thiserror::Error)]
    #[error("stub failure")]
    struct StubError;

    /// Reports `faces` faces in every image.
    struct StubAnalyzer {
        faces: usize,
    }

    impl FaceAnalyzer for StubAnalyzer {
        type Error = StubError;

        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<DetectedFace>, StubError> {
            let face = DetectedFace {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 8.0,
                    height: 8.0,
                    confidence: 0.9,
                    landmarks: None,
                },
                embedding: None,
            };
            Ok(vec![face; self.faces])
        }
    }

    /// Returns a black image the size of the target.
    struct StubSwapper;

    impl FaceSwapper for StubSwapper {
        type Error = StubError;

        fn swap(
            &mut self,
            image: &RgbImage,
            _target_face: &DetectedFace,
            _source_face: &DetectedFace,
            _paste_back: bool,
        ) -> Result<RgbImage, StubError> {
            Ok(RgbImage::new(image.width(), image.height()))
        }
    }

    fn request(dir: &Path) -> SwapRequest {
        let source = dir.join("source.png");
        let target = dir.join("target.png");
        RgbImage::from_pixel(32, 32, Rgb([1, 2, 3])).save(&source).unwrap();
        RgbImage::from_pixel(40, 30, Rgb([4, 5, 6])).save(&target).unwrap();
        SwapRequest {
            source,
            target,
            models: ModelPaths::in_dir(dir),
            strength: Strength::FULL,
        }
    }

    #[tokio::test]
    async fn test_successful_run_progress_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path());

        let run = spawn_swap(&req, || {
            Ok(SwapPipeline::new(StubAnalyzer { faces: 1 }, StubSwapper))
        })
        .unwrap();

        let mut seen = Vec::new();
        let outcome = run.wait(|p| seen.push(p.percent())).await.unwrap();
        assert_eq!(seen, vec![20, 50, 90, 100]);
        assert_eq!(outcome.composite.dimensions(), (40, 30));
    }

    #[tokio::test]
    async fn test_events_end_with_single_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path());

        let mut run = spawn_swap(&req, || {
            Ok(SwapPipeline::new(StubAnalyzer { faces: 0 }, StubSwapper))
        })
        .unwrap();

        let mut events = Vec::new();
        while let Some(event) = run.next_event().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], SwapEvent::Progress(Progress::LOADED)));
        assert!(matches!(
            events[1],
            SwapEvent::Failed(SwapError::NoFaceDetected { role: FaceRole::Source })
        ));
        assert!(run.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_build_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path());

        let run = spawn_swap(&req, || -> Result<SwapPipeline<StubAnalyzer, StubSwapper>, _> {
            Err(SwapError::WorkerExited)
        })
        .unwrap();

        let mut seen = Vec::new();
        let err = run.wait(|p| seen.push(p)).await.unwrap_err();
        assert!(matches!(err, SwapError::WorkerExited));
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn test_missing_input_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path());
        req.source = PathBuf::from("/nonexistent/source.jpg");

        let run = spawn_swap(&req, || {
            Ok(SwapPipeline::new(StubAnalyzer { faces: 1 }, StubSwapper))
        })
        .unwrap();
        let err = run.wait(|_| {}).await.unwrap_err();
        assert!(matches!(err, SwapError::NotFound { role: FaceRole::Source, .. }));
    }

    #[tokio::test]
    async fn test_panicking_worker_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path());

        type StubPipeline = SwapPipeline<StubAnalyzer, StubSwapper>;
        let run = spawn_swap(&req, || -> Result<StubPipeline, SwapError> {
            panic!("model loader crashed")
        })
        .unwrap();
        let err = run.wait(|_| {}).await.unwrap_err();
        assert!(matches!(err, SwapError::WorkerExited));
    }
}
