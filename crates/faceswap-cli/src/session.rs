//! Front-end session: the user's current selections and whether a run is in flight.

use faceswap_core::{FaceRole, ModelPaths, Strength};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("please select both source and target images ({0} image missing)")]
    MissingInput(FaceRole),
    #[error("a swap is already running")]
    AlreadyRunning,
}

/// Everything one run needs. Built by [`Session::begin`], consumed by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapRequest {
    pub source: PathBuf,
    pub target: PathBuf,
    pub models: ModelPaths,
    pub strength: Strength,
}

/// Selections plus the Idle/Running state machine. At most one run at a time.
#[derive(Debug)]
pub struct Session {
    source: Option<PathBuf>,
    target: Option<PathBuf>,
    strength: Strength,
    models: ModelPaths,
    state: SessionState,
}

impl Session {
    pub fn new(models: ModelPaths, strength: Strength) -> Self {
        Self {
            source: None,
            target: None,
            strength,
            models,
            state: SessionState::Idle,
        }
    }

    pub fn select_source(&mut self, path: PathBuf) {
        self.source = Some(path);
    }

    pub fn select_target(&mut self, path: PathBuf) {
        self.target = Some(path);
    }

    /// Set the strength, clamped to [0, 100].
    pub fn set_strength(&mut self, percent: i64) {
        self.strength = Strength::new(percent);
    }

    pub fn strength(&self) -> Strength {
        self.strength
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Idle → Running. Requires both images to be selected.
    pub fn begin(&mut self) -> Result<SwapRequest, SessionError> {
        if self.state == SessionState::Running {
            return Err(SessionError::AlreadyRunning);
        }
        let source = self
            .source
            .clone()
            .ok_or(SessionError::MissingInput(FaceRole::Source))?;
        let target = self
            .target
            .clone()
            .ok_or(SessionError::MissingInput(FaceRole::Target))?;

        self.state = SessionState::Running;
        tracing::debug!(source = %source.display(), target = %target.display(), "session running");

        Ok(SwapRequest {
            source,
            target,
            models: self.models.clone(),
            strength: self.strength,
        })
    }

    /// Running → Idle, after either success or failure.
    pub fn finish(&mut self) {
        self.state = SessionState::Idle;
    }
}
