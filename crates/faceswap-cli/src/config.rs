use faceswap_core::{ModelPaths, Strength};
use std::path::PathBuf;

/// CLI configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Swap model path; defaults to `inswapper_128.onnx` inside `model_dir`.
    pub swap_model: Option<PathBuf>,
    /// ONNX Runtime intra-op threads per model.
    pub intra_threads: usize,
    /// Strength used when `--strength` is not given.
    pub default_strength: Strength,
}

impl Config {
    /// Load configuration from `FACESWAP_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            model_dir: get("FACESWAP_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(faceswap_core::default_model_dir),
            swap_model: get("FACESWAP_SWAP_MODEL").map(PathBuf::from),
            intra_threads: parse_or(get("FACESWAP_INTRA_THREADS"), 2usize).max(1),
            default_strength: Strength::new(parse_or(get("FACESWAP_DEFAULT_STRENGTH"), 100i64)),
        }
    }

    /// Apply command-line overrides.
    pub fn with_overrides(
        mut self,
        model_dir: Option<PathBuf>,
        swap_model: Option<PathBuf>,
    ) -> Self {
        if let Some(dir) = model_dir {
            self.model_dir = dir;
        }
        if swap_model.is_some() {
            self.swap_model = swap_model;
        }
        self
    }

    /// Resolved model file locations.
    pub fn model_paths(&self) -> ModelPaths {
        match &self.swap_model {
            Some(swap_model) => ModelPaths::with_swap_model(&self.model_dir, swap_model),
            None => ModelPaths::in_dir(&self.model_dir),
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
