//! Conversion error types

use thiserror::Error;

/// Guidance attached to incompatible-weights failures
pub const INCOMPATIBLE_WEIGHTS_HINT: &str =
    "tried to access some of the model weights but they were unavailable; \
     check the model config or open a bug report";

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Safetensors error: {0}")]
    Safetensors(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Missing parameter: {0}")]
    MissingParameter(String),

    #[error("Incompatible model weights ({key}): {hint}")]
    IncompatibleWeights { key: String, hint: &'static str },

    #[error("Shape mismatch for {name}: expected rank {expected_rank}, got shape {got:?}")]
    ShapeMismatch {
        name: String,
        expected_rank: usize,
        got: Vec<usize>,
    },

    #[error("Buffer size mismatch: shape {shape:?} needs {expected} bytes, got {got}")]
    BufferSize {
        shape: Vec<usize>,
        expected: usize,
        got: usize,
    },

    #[error("Unsupported data type: {0}")]
    UnsupportedDtype(String),

    #[error("Model config error: {0}")]
    Config(String),
}

impl ModelError {
    /// Build the strict-mode failure for an absent optional parameter
    pub fn incompatible(key: impl Into<String>) -> Self {
        ModelError::IncompatibleWeights {
            key: key.into(),
            hint: INCOMPATIBLE_WEIGHTS_HINT,
        }
    }
}

impl From<safetensors::SafeTensorError> for ModelError {
    fn from(e: safetensors::SafeTensorError) -> Self {
        ModelError::Safetensors(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
