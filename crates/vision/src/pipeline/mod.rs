//! Single-shot capture pipeline: camera photo, upright frame, model result,
//! presentation.
//!
//! The module is split into focused submodules:
//! - `config`: CLI configuration parsing.
//! - `coordinator`: the single in-flight capture request and its completion.
//! - `convert`: pixel layout and orientation normalisation.
//! - `inference`: worker thread running conversion and the model.
//! - `runner`: the `Pipeline` owned by the UI-affine thread.
//! - `presentation`: the `ResultSink` seam.
//! - `source`: camera backend selection.
//! - `telemetry`: tracing subscriber, metrics and thread helpers.
//! - `error`: failure taxonomy.

pub mod config;
pub mod convert;
pub mod coordinator;
pub mod error;
mod inference;
pub mod presentation;
pub mod runner;
pub mod source;
pub mod telemetry;

pub use config::{
    CameraSource, DEFAULT_BUNDLE, DEFAULT_OUTPUTS, PipelineCliArgs, PipelineConfig,
    TelemetryOptions, resolve_model_path,
};
pub use convert::FrameConverter;
pub use coordinator::{CaptureCoordinator, CompletionOutcome};
pub use error::{ConvertError, FailureKind, PipelineError};
pub use presentation::{InferenceResult, NullSink, Presentation, ResultSink};
pub use runner::{FeatureStatus, Pipeline, PipelineEvent, PipelineStatus};
