//! OpenCV-backed camera backend (V4L devices, files and URLs).

use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use opencv::{
    core::{self, Mat, MatTraitConstManual, Vector},
    imgcodecs,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
use tracing::{debug, warn};

use crate::{
    backend::{CameraBackend, CameraStream},
    types::{
        Capabilities, CaptureError, CaptureFormat, Device, Facing, Frame, Orientation, PixelFormat,
    },
};

/// Number of `/dev/videoN` indices probed during enumeration.
const PROBE_LIMIT: i32 = 8;
/// Frames read and thrown away before a photo so the driver's queue holds a
/// fresh exposure.
const STALE_FRAMES: usize = 3;
const JPEG_QUALITY: i32 = 90;

/// Camera backend for local V4L devices, or a single explicit source URI.
#[derive(Clone, Debug, Default)]
pub struct OpenCvCamera {
    source: Option<String>,
}

impl OpenCvCamera {
    /// Probe `/dev/video0..` for devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose exactly one device backed by `uri` (index, `/dev/videoX`, file or URL).
    pub fn with_source(uri: impl Into<String>) -> Self {
        Self {
            source: Some(uri.into()),
        }
    }
}

impl CameraBackend for OpenCvCamera {
    fn name(&self) -> &str {
        "opencv"
    }

    fn enumerate(&self) -> Result<Vec<Device>, CaptureError> {
        if let Some(uri) = &self.source {
            let mut cap = open_video_capture(uri)?;
            let device = describe(uri, &cap);
            let _ = cap.release();
            return Ok(vec![device]);
        }

        let mut devices = Vec::new();
        for index in 0..PROBE_LIMIT {
            let mut cap = match VideoCapture::new(index, videoio::CAP_V4L) {
                Ok(cap) => cap,
                Err(_) => continue,
            };
            if !cap.is_opened().unwrap_or(false) {
                continue;
            }
            devices.push(describe(&format!("/dev/video{index}"), &cap));
            let _ = cap.release();
        }
        Ok(devices)
    }

    fn open(&self, device: &Device) -> Result<Box<dyn CameraStream>, CaptureError> {
        let cap = open_video_capture(&device.id)?;
        Ok(Box::new(OpenCvStream {
            uri: device.id.clone(),
            cap,
            format: None,
        }))
    }
}

struct OpenCvStream {
    uri: String,
    cap: VideoCapture,
    format: Option<CaptureFormat>,
}

impl CameraStream for OpenCvStream {
    fn attach_output(&mut self, format: &CaptureFormat) -> Result<(), CaptureError> {
        if !matches!(format.pixel_format, PixelFormat::Bgr8 | PixelFormat::Jpeg) {
            return Err(CaptureError::attachment_failed(
                &self.uri,
                format!("opencv delivers bgr8 or jpeg, not {}", format.pixel_format),
            ));
        }
        configure_camera(&mut self.cap, format);
        self.format = Some(*format);
        Ok(())
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if !self.cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
            self.cap = open_video_capture(&self.uri)?;
            if let Some(format) = self.format {
                configure_camera(&mut self.cap, &format);
            }
        }
        Ok(())
    }

    fn stop(&mut self) {
        if let Err(err) = self.cap.release() {
            warn!("video-ingest: failed to release {}: {err}", self.uri);
        }
    }

    fn capture_photo(&mut self) -> Result<Frame, CaptureError> {
        let format = self
            .format
            .ok_or_else(|| CaptureError::capture_failed("photo output not attached"))?;

        for _ in 0..STALE_FRAMES {
            let _ = self.cap.grab();
        }

        let mut frame = Mat::default();
        let mut grabbed = false;
        for _ in 0..10 {
            if self
                .cap
                .read(&mut frame)
                .map_err(|e| CaptureError::capture_failed(e.to_string()))?
                && frame.cols() > 0
            {
                grabbed = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if !grabbed {
            return Err(CaptureError::capture_failed(format!(
                "{} returned no frame",
                self.uri
            )));
        }

        let mut scratch = Mat::default();
        let size = frame.size().map_err(|e| CaptureError::Other(e.into()))?;
        let (target_w, target_h) = (format.width as i32, format.height as i32);
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &frame,
                &mut scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::capture_failed(e.to_string()))?;
            &scratch
        } else {
            &frame
        };

        let data = match format.pixel_format {
            PixelFormat::Jpeg => {
                let mut encoded = Vector::<u8>::new();
                let params = Vector::from_slice(&[imgcodecs::IMWRITE_JPEG_QUALITY, JPEG_QUALITY]);
                let ok = imgcodecs::imencode(".jpg", working, &mut encoded, &params)
                    .map_err(|e| CaptureError::capture_failed(format!("jpeg encode: {e}")))?;
                if !ok {
                    return Err(CaptureError::capture_failed("jpeg encoder rejected frame"));
                }
                encoded.to_vec()
            }
            _ => working
                .data_bytes()
                .map_err(|e| CaptureError::capture_failed(e.to_string()))?
                .to_vec(),
        };

        debug!(uri = %self.uri, bytes = data.len(), "opencv photo captured");
        Ok(Frame {
            data,
            width: format.width,
            height: format.height,
            format: format.pixel_format,
            orientation: Orientation::Up,
            timestamp_ms: Utc::now().timestamp_millis(),
        })
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub(crate) fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    uri.strip_prefix("/dev/video")
        .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .and_then(|rest| rest.parse().ok())
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) if cap.is_opened().unwrap_or(false) => return Ok(cap),
                Ok(_) => {}
                Err(err) => {
                    debug!(
                        "video-ingest: failed to open device #{index} with backend {backend}: {err}"
                    )
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) if cap.is_opened().unwrap_or(false) => return Ok(cap),
            Ok(_) => {}
            Err(err) => debug!("video-ingest: failed to open {uri} with backend {backend}: {err}"),
        }
    }

    Err(anyhow!("failed to open video source {uri:?}").into())
}

fn describe(uri: &str, cap: &VideoCapture) -> Device {
    let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0).max(0.0) as u32;
    let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0).max(0.0) as u32;
    Device {
        id: uri.to_string(),
        name: format!("OpenCV {uri}"),
        facing: Facing::Unspecified,
        capabilities: Capabilities {
            // Drivers rescale on request; OpenCV only reports the active mode.
            max_width: width.max(4096),
            max_height: height.max(4096),
            pixel_formats: vec![PixelFormat::Bgr8, PixelFormat::Jpeg],
        },
    }
}

/// Apply capture resolution and preferred sensor encoding.
fn configure_camera(cap: &mut VideoCapture, format: &CaptureFormat) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, format.width as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, format.height as f64);
    let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
}

#[cfg(test)]
mod tests {
    use super::parse_device_index;

    #[test]
    fn parses_device_indices() {
        assert_eq!(parse_device_index("2"), Some(2));
        assert_eq!(parse_device_index("/dev/video10"), Some(10));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam/stream"), None);
    }
}
