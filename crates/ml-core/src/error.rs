use std::path::PathBuf;

use thiserror::Error;

/// Model bundle could not be turned into a usable engine.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model bundle {path:?} does not exist")]
    Missing { path: PathBuf },
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed bundle manifest {path:?}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid bundle schema: {0}")]
    Schema(String),
    #[error("model backend unavailable: {0}")]
    Backend(String),
}

/// A single forward pass failed.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("input {actual} does not match the model input {expected}")]
    InputMismatch { expected: String, actual: String },
    #[error("model produced {actual} output value(s), schema declares {expected}")]
    OutputMismatch { expected: usize, actual: usize },
    #[error("forward pass failed: {0}")]
    Backend(String),
}

impl From<anyhow::Error> for InferenceError {
    fn from(err: anyhow::Error) -> Self {
        InferenceError::Backend(format!("{err:#}"))
    }
}
