//! Seams between the capture session and the camera hardware.

use crate::types::{CaptureError, CaptureFormat, Device, Frame};

/// Hardware capability query plus the ability to open one device as input.
pub trait CameraBackend: Send + Sync {
    /// Short backend name used in log messages.
    fn name(&self) -> &str;

    /// Enumerate the devices currently visible to the backend.
    fn enumerate(&self) -> Result<Vec<Device>, CaptureError>;

    /// Open `device` as the input of a capture session.
    fn open(&self, device: &Device) -> Result<Box<dyn CameraStream>, CaptureError>;
}

/// An opened device. Owned by the session's hardware thread once configured.
pub trait CameraStream: Send {
    /// Attach the photo output sink producing frames in `format`.
    fn attach_output(&mut self, format: &CaptureFormat) -> Result<(), CaptureError>;

    /// Begin continuous delivery and arm the photo output.
    fn start(&mut self) -> Result<(), CaptureError>;

    fn stop(&mut self);

    /// Take one still photo. Blocks the hardware thread until the photo is ready.
    fn capture_photo(&mut self) -> Result<Frame, CaptureError>;
}
