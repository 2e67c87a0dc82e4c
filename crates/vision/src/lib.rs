//! Capture-to-inference pipeline built on `video-ingest` and `ml-core`.

pub mod pipeline;

pub use pipeline::{
    CameraSource, CaptureCoordinator, CompletionOutcome, ConvertError, FailureKind,
    FeatureStatus, FrameConverter, NullSink, Pipeline, PipelineCliArgs, PipelineConfig,
    PipelineError, PipelineEvent, PipelineStatus, Presentation, ResultSink, TelemetryOptions,
    telemetry,
};
