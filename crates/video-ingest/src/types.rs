use std::{fmt, str::FromStr};

use anyhow::Error;
use thiserror::Error;

/// Direction a capture device faces relative to the screen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Facing {
    Front,
    Back,
    Unspecified,
}

impl Facing {
    pub fn label(self) -> &'static str {
        match self {
            Facing::Front => "front",
            Facing::Back => "back",
            Facing::Unspecified => "unspecified",
        }
    }
}

impl fmt::Display for Facing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Pixel layout of a captured frame.
///
/// `Jpeg` carries an encoded photo; every other variant is a tightly packed
/// raw plane of `width * height * bytes_per_pixel` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Bgr8,
    Rgb8,
    Bgra8,
    Rgba8,
    Gray8,
    Jpeg,
}

impl PixelFormat {
    /// Bytes per pixel for raw layouts, `None` for encoded payloads.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => Some(3),
            PixelFormat::Bgra8 | PixelFormat::Rgba8 => Some(4),
            PixelFormat::Gray8 => Some(1),
            PixelFormat::Jpeg => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PixelFormat::Bgr8 => "bgr8",
            PixelFormat::Rgb8 => "rgb8",
            PixelFormat::Bgra8 => "bgra8",
            PixelFormat::Rgba8 => "rgba8",
            PixelFormat::Gray8 => "gray8",
            PixelFormat::Jpeg => "jpeg",
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "bgr8" | "bgr" => Ok(PixelFormat::Bgr8),
            "rgb8" | "rgb" => Ok(PixelFormat::Rgb8),
            "bgra8" | "bgra" => Ok(PixelFormat::Bgra8),
            "rgba8" | "rgba" => Ok(PixelFormat::Rgba8),
            "gray8" | "gray" => Ok(PixelFormat::Gray8),
            "jpeg" | "jpg" => Ok(PixelFormat::Jpeg),
            other => Err(format!("unknown pixel format {other:?}")),
        }
    }
}

/// Orientation of the stored pixels relative to the upright scene, using the
/// EXIF numbering (1..=8).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Orientation {
    #[default]
    Up,
    UpMirrored,
    Down,
    DownMirrored,
    LeftMirrored,
    Right,
    RightMirrored,
    Left,
}

impl Orientation {
    pub fn from_exif(value: u8) -> Option<Self> {
        match value {
            1 => Some(Orientation::Up),
            2 => Some(Orientation::UpMirrored),
            3 => Some(Orientation::Down),
            4 => Some(Orientation::DownMirrored),
            5 => Some(Orientation::LeftMirrored),
            6 => Some(Orientation::Right),
            7 => Some(Orientation::RightMirrored),
            8 => Some(Orientation::Left),
            _ => None,
        }
    }

    pub fn exif(self) -> u8 {
        match self {
            Orientation::Up => 1,
            Orientation::UpMirrored => 2,
            Orientation::Down => 3,
            Orientation::DownMirrored => 4,
            Orientation::LeftMirrored => 5,
            Orientation::Right => 6,
            Orientation::RightMirrored => 7,
            Orientation::Left => 8,
        }
    }

    /// Whether restoring the upright image swaps width and height.
    pub fn swaps_dimensions(self) -> bool {
        matches!(
            self,
            Orientation::LeftMirrored
                | Orientation::Right
                | Orientation::RightMirrored
                | Orientation::Left
        )
    }
}

/// Output contract of the photo sink.
///
/// The capture session configures its output with this value and the frame
/// converter refuses frames that do not match it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureFormat {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl CaptureFormat {
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub max_width: u32,
    pub max_height: u32,
    pub pixel_formats: Vec<PixelFormat>,
}

impl Capabilities {
    pub fn supports(&self, format: &CaptureFormat) -> bool {
        self.pixel_formats.contains(&format.pixel_format)
            && format.width <= self.max_width
            && format.height <= self.max_height
    }
}

/// Capture device as reported by a camera backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub facing: Facing,
    pub capabilities: Capabilities,
}

/// Still photo produced by the hardware for one capture request.
#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub orientation: Orientation,
    pub timestamp_ms: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unconfigured,
    Configured,
    Running,
    Stopped,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Unconfigured => "unconfigured",
            SessionState::Configured => "configured",
            SessionState::Running => "running",
            SessionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no capture device available")]
    NoDeviceAvailable,
    #[error("failed to attach {device:?} to the capture session: {reason}")]
    AttachmentFailed { device: String, reason: String },
    #[error("capture failed: {reason}")]
    CaptureFailed { reason: String },
    #[error("a capture request is already in flight")]
    Busy,
    #[error("capture session is {state}; cannot {action}")]
    InvalidState {
        state: SessionState,
        action: &'static str,
    },
    #[error("{operation} timed out after {after_ms} ms")]
    Timeout {
        operation: &'static str,
        after_ms: u64,
    },
    #[error(transparent)]
    Other(#[from] Error),
}

impl CaptureError {
    pub fn capture_failed(reason: impl Into<String>) -> Self {
        CaptureError::CaptureFailed {
            reason: reason.into(),
        }
    }

    pub fn attachment_failed(device: impl Into<String>, reason: impl Into<String>) -> Self {
        CaptureError::AttachmentFailed {
            device: device.into(),
            reason: reason.into(),
        }
    }
}
