use std::fmt;

use ml_core::{InferenceError, LoadError};
use serde::Serialize;
use thiserror::Error;
use video_ingest::{CaptureError, CaptureFormat, PixelFormat};

/// Failure taxonomy surfaced to callers and telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoDeviceAvailable,
    AttachmentFailed,
    CaptureFailed,
    UnsupportedPixelFormat,
    LoadFailed,
    InferenceFailed,
    Timeout,
    Busy,
    InvalidState,
}

impl FailureKind {
    pub fn label(self) -> &'static str {
        match self {
            FailureKind::NoDeviceAvailable => "no_device_available",
            FailureKind::AttachmentFailed => "attachment_failed",
            FailureKind::CaptureFailed => "capture_failed",
            FailureKind::UnsupportedPixelFormat => "unsupported_pixel_format",
            FailureKind::LoadFailed => "load_failed",
            FailureKind::InferenceFailed => "inference_failed",
            FailureKind::Timeout => "timeout",
            FailureKind::Busy => "busy",
            FailureKind::InvalidState => "invalid_state",
        }
    }

    /// Whether the user can simply try again with a new capture.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            FailureKind::CaptureFailed
                | FailureKind::InferenceFailed
                | FailureKind::Timeout
                | FailureKind::Busy
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A captured frame could not be turned into an upright image or model input.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("pixel format {format} cannot be mapped to a 3-channel model input")]
    UnsupportedPixelFormat { format: PixelFormat },
    #[error(
        "frame {actual_format} {actual_width}x{actual_height} does not match the capture contract {}",
        describe(.expected)
    )]
    FormatMismatch {
        expected: CaptureFormat,
        actual_format: PixelFormat,
        actual_width: u32,
        actual_height: u32,
    },
    #[error("frame buffer holds {actual} bytes, layout requires {expected}")]
    BufferSize { expected: usize, actual: usize },
    #[error("failed to decode photo: {0}")]
    Decode(#[from] image::ImageError),
}

fn describe(format: &CaptureFormat) -> String {
    format!("{} {}x{}", format.pixel_format, format.width, format.height)
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error("model bundle failed to load: {0}")]
    Load(#[from] LoadError),
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("{stage} timed out after {after_ms} ms")]
    Timeout { stage: &'static str, after_ms: u64 },
    #[error("{feature} is disabled ({kind})")]
    Unavailable {
        feature: &'static str,
        kind: FailureKind,
    },
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::Capture(err) => match err {
                CaptureError::NoDeviceAvailable => FailureKind::NoDeviceAvailable,
                CaptureError::AttachmentFailed { .. } => FailureKind::AttachmentFailed,
                CaptureError::Busy => FailureKind::Busy,
                CaptureError::InvalidState { .. } => FailureKind::InvalidState,
                CaptureError::Timeout { .. } => FailureKind::Timeout,
                CaptureError::CaptureFailed { .. } | CaptureError::Other(_) => {
                    FailureKind::CaptureFailed
                }
            },
            PipelineError::Convert(ConvertError::Decode(_)) => FailureKind::CaptureFailed,
            PipelineError::Convert(_) => FailureKind::UnsupportedPixelFormat,
            PipelineError::Load(_) => FailureKind::LoadFailed,
            PipelineError::Inference(_) => FailureKind::InferenceFailed,
            PipelineError::Timeout { .. } => FailureKind::Timeout,
            PipelineError::Unavailable { kind, .. } => *kind,
        }
    }
}
