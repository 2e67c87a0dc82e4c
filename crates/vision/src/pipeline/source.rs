use std::sync::Arc;

use anyhow::Result;
#[cfg(not(feature = "with-opencv"))]
use anyhow::bail;
use video_ingest::{CameraBackend, VirtualCamera};

use crate::pipeline::config::CameraSource;

/// Camera backend for `source`.
pub fn camera_backend(source: &CameraSource) -> Result<Arc<dyn CameraBackend>> {
    match source {
        CameraSource::Virtual(path) => Ok(Arc::new(VirtualCamera::from_path(path)?)),
        #[cfg(feature = "with-opencv")]
        CameraSource::Auto => Ok(Arc::new(video_ingest::OpenCvCamera::new())),
        #[cfg(feature = "with-opencv")]
        CameraSource::Device(uri) => Ok(Arc::new(video_ingest::OpenCvCamera::with_source(
            uri.clone(),
        ))),
        #[cfg(not(feature = "with-opencv"))]
        CameraSource::Auto | CameraSource::Device(_) => bail!(
            "this build has no hardware camera backend; rebuild with `--features with-opencv` \
             or use --source virtual:<image>"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_virtual_image_is_an_error() {
        let source = CameraSource::Virtual("/nonexistent/face.png".into());
        assert!(camera_backend(&source).is_err());
    }

    #[test]
    fn virtual_image_becomes_a_front_camera() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        image::RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3]))
            .save(&path)
            .unwrap();
        let backend = camera_backend(&CameraSource::Virtual(path)).unwrap();
        let devices = backend.enumerate().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].facing, video_ingest::Facing::Front);
    }
}
