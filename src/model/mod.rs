//! Inference pipeline: feature building, ONNX model execution, symbolic
//! calibration, and the model bundle contract.

pub mod engine;
pub mod equations;
pub mod features;
pub mod manifest;
pub mod types;

pub use engine::{InferenceEngine, PredictOptions, Prediction};
pub use manifest::{FamilyAllowlist, ModelManifest};
pub use types::{Action, DecisionSource, NodeAssessment, NodeState};

use std::path::PathBuf;

/// Error type for model loading and inference.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Failed to load model {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: ort::Error,
    },

    #[error("Inference failed: {0}")]
    Inference(#[from] ort::Error),

    #[error("Model contract violation: {0}")]
    Contract(String),

    #[error("Model manifest error: {0}")]
    Manifest(String),

    #[error("Manifest checksum mismatch for {artifact}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        artifact: String,
        expected: String,
        actual: String,
    },

    #[error("Cloud mismatch: agent expects {expected}, bundle built for {actual}")]
    CloudMismatch { expected: String, actual: String },

    #[error("Equation error: {0}")]
    Equation(#[from] equations::EquationError),

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
