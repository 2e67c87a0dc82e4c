//! Software camera serving a fixed image as its photo output.
//!
//! Used when no hardware is available (`virtual:<image>` sources) and to drive
//! the capture pipeline deterministically. A [`ShutterControl`] turns every
//! capture into a manual step so callers decide when, and whether, a photo
//! completes.

use std::{io::Cursor, path::Path, sync::Arc};

use anyhow::{Context, anyhow};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, unbounded};
use image::{
    DynamicImage, ImageFormat, RgbImage,
    imageops::{self, FilterType},
};
use tracing::debug;

use crate::{
    backend::{CameraBackend, CameraStream},
    types::{
        Capabilities, CaptureError, CaptureFormat, Device, Facing, Frame, Orientation, PixelFormat,
    },
};

const VIRTUAL_MAX_EDGE: u32 = 8192;

enum ShutterEvent {
    Release,
    Fail(String),
}

/// Manual trigger for a virtual camera created with [`VirtualCamera::with_shutter`].
///
/// Each call resolves exactly one pending or future photo. Dropping the
/// control fails every later capture.
#[derive(Clone)]
pub struct ShutterControl {
    tx: Sender<ShutterEvent>,
}

impl ShutterControl {
    pub fn release(&self) {
        let _ = self.tx.send(ShutterEvent::Release);
    }

    /// Make the next photo fail with `reason`, as an encoder or I/O fault would.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.tx.send(ShutterEvent::Fail(reason.into()));
    }
}

#[derive(Clone)]
pub struct VirtualCamera {
    devices: Vec<Device>,
    image: Arc<RgbImage>,
    orientation: Orientation,
    shutter: Option<Receiver<ShutterEvent>>,
    busy: bool,
}

impl VirtualCamera {
    /// Camera whose photos are `image`, exposed as a single front-facing device.
    pub fn new(image: RgbImage) -> Self {
        Self {
            devices: vec![virtual_device("virtual-front", Facing::Front)],
            image: Arc::new(image),
            orientation: Orientation::Up,
            shutter: None,
            busy: false,
        }
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("failed to load virtual camera image {}", path.display()))?;
        Ok(Self::new(image.to_rgb8()))
    }

    /// Uniformly coloured `width`x`height` photos.
    pub fn solid(rgb: [u8; 3], width: u32, height: u32) -> Self {
        Self::new(RgbImage::from_pixel(width, height, image::Rgb(rgb)))
    }

    pub fn with_devices(mut self, devices: Vec<(&str, Facing)>) -> Self {
        self.devices = devices
            .into_iter()
            .map(|(id, facing)| virtual_device(id, facing))
            .collect();
        self
    }

    /// Report photos as stored with `orientation` instead of upright.
    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn with_max_size(mut self, width: u32, height: u32) -> Self {
        for device in &mut self.devices {
            device.capabilities.max_width = width;
            device.capabilities.max_height = height;
        }
        self
    }

    /// Every `open` fails as if another process held the device.
    pub fn busy(mut self) -> Self {
        self.busy = true;
        self
    }

    pub fn with_shutter(mut self) -> (Self, ShutterControl) {
        let (tx, rx) = unbounded();
        self.shutter = Some(rx);
        (self, ShutterControl { tx })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }
}

impl CameraBackend for VirtualCamera {
    fn name(&self) -> &str {
        "virtual"
    }

    fn enumerate(&self) -> Result<Vec<Device>, CaptureError> {
        Ok(self.devices.clone())
    }

    fn open(&self, device: &Device) -> Result<Box<dyn CameraStream>, CaptureError> {
        if !self.devices.iter().any(|known| known.id == device.id) {
            return Err(anyhow!("unknown virtual device {:?}", device.id).into());
        }
        if self.busy {
            return Err(anyhow!("device {} is busy", device.id).into());
        }
        Ok(Box::new(VirtualStream {
            image: self.image.clone(),
            orientation: self.orientation,
            shutter: self.shutter.clone(),
            format: None,
            streaming: false,
        }))
    }
}

struct VirtualStream {
    image: Arc<RgbImage>,
    orientation: Orientation,
    shutter: Option<Receiver<ShutterEvent>>,
    format: Option<CaptureFormat>,
    streaming: bool,
}

impl CameraStream for VirtualStream {
    fn attach_output(&mut self, format: &CaptureFormat) -> Result<(), CaptureError> {
        self.format = Some(*format);
        Ok(())
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if self.format.is_none() {
            return Err(CaptureError::capture_failed("photo output not attached"));
        }
        self.streaming = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.streaming = false;
    }

    fn capture_photo(&mut self) -> Result<Frame, CaptureError> {
        if let Some(shutter) = &self.shutter {
            match shutter.recv() {
                Ok(ShutterEvent::Release) => {}
                Ok(ShutterEvent::Fail(reason)) => return Err(CaptureError::capture_failed(reason)),
                Err(_) => return Err(CaptureError::capture_failed("shutter control dropped")),
            }
        }
        let format = self
            .format
            .ok_or_else(|| CaptureError::capture_failed("photo output not attached"))?;
        if !self.streaming {
            return Err(CaptureError::capture_failed("virtual camera not started"));
        }

        let frame = render_frame(&self.image, self.orientation, &format)?;
        debug!(
            width = frame.width,
            height = frame.height,
            format = %frame.format,
            bytes = frame.data.len(),
            "virtual photo rendered"
        );
        Ok(frame)
    }
}

fn virtual_device(id: &str, facing: Facing) -> Device {
    Device {
        id: id.to_string(),
        name: format!("Virtual camera ({facing})"),
        facing,
        capabilities: Capabilities {
            max_width: VIRTUAL_MAX_EDGE,
            max_height: VIRTUAL_MAX_EDGE,
            pixel_formats: vec![
                PixelFormat::Bgr8,
                PixelFormat::Rgb8,
                PixelFormat::Bgra8,
                PixelFormat::Rgba8,
                PixelFormat::Gray8,
                PixelFormat::Jpeg,
            ],
        },
    }
}

/// Produce the photo the sensor would store: scaled to the output size and
/// encoded in the output layout. Quarter-turn orientations store the scene
/// with swapped edges, as a sensor mounted sideways would.
fn render_frame(
    scene: &RgbImage,
    orientation: Orientation,
    format: &CaptureFormat,
) -> Result<Frame, CaptureError> {
    let (width, height) = if orientation.swaps_dimensions() {
        (format.height, format.width)
    } else {
        (format.width, format.height)
    };
    let upright = if scene.dimensions() == (width, height) {
        scene.clone()
    } else {
        imageops::resize(scene, width, height, FilterType::Triangle)
    };
    let stored = to_sensor_orientation(&upright, orientation);
    let (stored_w, stored_h) = stored.dimensions();

    let data = match format.pixel_format {
        PixelFormat::Rgb8 => stored.into_raw(),
        PixelFormat::Bgr8 => stored
            .pixels()
            .flat_map(|p| [p[2], p[1], p[0]])
            .collect(),
        PixelFormat::Rgba8 => stored
            .pixels()
            .flat_map(|p| [p[0], p[1], p[2], u8::MAX])
            .collect(),
        PixelFormat::Bgra8 => stored
            .pixels()
            .flat_map(|p| [p[2], p[1], p[0], u8::MAX])
            .collect(),
        PixelFormat::Gray8 => DynamicImage::ImageRgb8(stored).to_luma8().into_raw(),
        PixelFormat::Jpeg => {
            let mut encoded = Cursor::new(Vec::new());
            DynamicImage::ImageRgb8(stored)
                .write_to(&mut encoded, ImageFormat::Jpeg)
                .map_err(|err| CaptureError::capture_failed(format!("jpeg encode: {err}")))?;
            encoded.into_inner()
        }
    };

    Ok(Frame {
        data,
        width: stored_w,
        height: stored_h,
        format: format.pixel_format,
        orientation,
        timestamp_ms: Utc::now().timestamp_millis(),
    })
}

/// Inverse of the upright correction: how an upright scene is laid out in
/// memory when the photo is tagged with `orientation`.
fn to_sensor_orientation(upright: &RgbImage, orientation: Orientation) -> RgbImage {
    match orientation {
        Orientation::Up => upright.clone(),
        Orientation::UpMirrored => imageops::flip_horizontal(upright),
        Orientation::Down => imageops::rotate180(upright),
        Orientation::DownMirrored => imageops::flip_vertical(upright),
        Orientation::LeftMirrored => imageops::rotate270(&imageops::flip_horizontal(upright)),
        Orientation::Right => imageops::rotate270(upright),
        Orientation::RightMirrored => imageops::rotate90(&imageops::flip_horizontal(upright)),
        Orientation::Left => imageops::rotate90(upright),
    }
}
