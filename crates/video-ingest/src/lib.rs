//! Camera device discovery and single-shot photo capture.
//!
//! - `registry`: enumerate devices and choose the active one.
//! - `session`: own the input/output pair and the hardware thread.
//! - `backend`: traits implemented by camera backends.
//! - `virtual_camera`: software camera serving a fixed image.
//! - `camera`: OpenCV backend (feature `with-opencv`).

pub mod backend;
#[cfg(feature = "with-opencv")]
pub mod camera;
pub mod registry;
pub mod session;
mod types;
pub mod virtual_camera;

pub use backend::{CameraBackend, CameraStream};
#[cfg(feature = "with-opencv")]
pub use camera::OpenCvCamera;
pub use registry::{DeviceRegistry, FacingPreference};
pub use session::{CaptureSession, CaptureTicket, Completion};
pub use types::{
    Capabilities, CaptureError, CaptureFormat, Device, Facing, Frame, Orientation, PixelFormat,
    SessionState,
};
pub use virtual_camera::{ShutterControl, VirtualCamera};
