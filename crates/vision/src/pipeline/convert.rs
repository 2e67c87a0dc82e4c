//! Frame conversion: captured photo to upright RGB image to model input.
//!
//! Conversion is pure. The same frame bytes and orientation always produce the
//! same upright image and the same model input.

use image::{
    ImageFormat, RgbImage,
    imageops::{self, FilterType},
};
use ml_core::{ImageInputSpec, ModelInput};
use tracing::error;
use video_ingest::{CaptureFormat, Frame, Orientation, PixelFormat};

use crate::pipeline::error::ConvertError;

/// Converts frames produced under one capture contract.
#[derive(Clone, Copy, Debug)]
pub struct FrameConverter {
    contract: CaptureFormat,
}

impl FrameConverter {
    pub fn new(contract: CaptureFormat) -> Self {
        Self { contract }
    }

    pub fn contract(&self) -> &CaptureFormat {
        &self.contract
    }

    /// Decode `frame` and rotate/mirror it upright.
    ///
    /// The frame must carry the contract's pixel format, and the upright image
    /// must have the contract's dimensions.
    pub fn upright(&self, frame: &Frame) -> Result<RgbImage, ConvertError> {
        let result = self.decode(frame).and_then(|stored| {
            let upright = correct_orientation(&stored, frame.orientation);
            if upright.dimensions() != (self.contract.width, self.contract.height) {
                return Err(self.mismatch(frame));
            }
            Ok(upright)
        });
        if let Err(err) = &result {
            if matches!(
                err,
                ConvertError::UnsupportedPixelFormat { .. } | ConvertError::FormatMismatch { .. }
            ) {
                error!(
                    error = %err,
                    contract = ?self.contract,
                    "captured frame violates the capture contract"
                );
            }
        }
        result
    }

    /// Upright frame scaled and laid out for the model input.
    pub fn to_model_input(
        &self,
        frame: &Frame,
        spec: &ImageInputSpec,
    ) -> Result<ModelInput, ConvertError> {
        let upright = self.upright(frame)?;
        fit(&upright, spec)
    }

    fn decode(&self, frame: &Frame) -> Result<RgbImage, ConvertError> {
        if frame.format != self.contract.pixel_format {
            return Err(self.mismatch(frame));
        }

        let (width, height) = (frame.width, frame.height);
        let rgb: Vec<u8> = match frame.format {
            PixelFormat::Rgb8 => raw_plane(frame, 3)?.to_vec(),
            PixelFormat::Bgr8 => raw_plane(frame, 3)?
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            PixelFormat::Rgba8 => raw_plane(frame, 4)?
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
            PixelFormat::Bgra8 => raw_plane(frame, 4)?
                .chunks_exact(4)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
            PixelFormat::Jpeg => {
                let decoded = image::load_from_memory_with_format(&frame.data, ImageFormat::Jpeg)?;
                return Ok(decoded.to_rgb8());
            }
            PixelFormat::Gray8 => {
                return Err(ConvertError::UnsupportedPixelFormat {
                    format: frame.format,
                });
            }
        };

        let len = rgb.len();
        RgbImage::from_raw(width, height, rgb).ok_or(ConvertError::BufferSize {
            expected: width as usize * height as usize * 3,
            actual: len,
        })
    }

    fn mismatch(&self, frame: &Frame) -> ConvertError {
        ConvertError::FormatMismatch {
            expected: self.contract,
            actual_format: frame.format,
            actual_width: frame.width,
            actual_height: frame.height,
        }
    }
}

fn raw_plane(frame: &Frame, bytes_per_pixel: usize) -> Result<&[u8], ConvertError> {
    let expected = frame.width as usize * frame.height as usize * bytes_per_pixel;
    if frame.data.len() != expected {
        return Err(ConvertError::BufferSize {
            expected,
            actual: frame.data.len(),
        });
    }
    Ok(&frame.data)
}

/// Scale an upright image to the model input size and channel order.
pub fn fit(image: &RgbImage, spec: &ImageInputSpec) -> Result<ModelInput, ConvertError> {
    let resized = if image.dimensions() == (spec.width, spec.height) {
        image.clone()
    } else {
        imageops::resize(image, spec.width, spec.height, FilterType::Triangle)
    };
    let raw = resized.into_raw();
    let actual = raw.len();
    ModelInput::from_rgb(spec.width, spec.height, raw, spec.channel_order).map_err(|_| {
        ConvertError::BufferSize {
            expected: spec.width as usize * spec.height as usize * 3,
            actual,
        }
    })
}

/// Undo the stored orientation so the top row is the top of the scene.
fn correct_orientation(stored: &RgbImage, orientation: Orientation) -> RgbImage {
    match orientation {
        Orientation::Up => stored.clone(),
        Orientation::UpMirrored => imageops::flip_horizontal(stored),
        Orientation::Down => imageops::rotate180(stored),
        Orientation::DownMirrored => imageops::flip_vertical(stored),
        Orientation::LeftMirrored => imageops::flip_horizontal(&imageops::rotate90(stored)),
        Orientation::Right => imageops::rotate90(stored),
        Orientation::RightMirrored => imageops::flip_horizontal(&imageops::rotate270(stored)),
        Orientation::Left => imageops::rotate270(stored),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, Rgb};
    use ml_core::{ChannelOrder, Normalization};

    use super::*;

    fn spec(width: u32, height: u32, channel_order: ChannelOrder) -> ImageInputSpec {
        ImageInputSpec {
            name: "image".into(),
            width,
            height,
            channel_order,
            normalization: Normalization::None,
        }
    }

    /// 2x1 image: red on the left, blue on the right.
    fn red_blue() -> RgbImage {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([255, 0, 0]));
        image.put_pixel(1, 0, Rgb([0, 0, 255]));
        image
    }

    fn frame(data: Vec<u8>, width: u32, height: u32, format: PixelFormat) -> Frame {
        Frame {
            data,
            width,
            height,
            format,
            orientation: Orientation::Up,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn bgr_frame_becomes_rgb() {
        let converter = FrameConverter::new(CaptureFormat::new(PixelFormat::Bgr8, 2, 1));
        let upright = converter
            .upright(&frame(vec![0, 0, 255, 255, 0, 0], 2, 1, PixelFormat::Bgr8))
            .unwrap();
        assert_eq!(upright, red_blue());
    }

    #[test]
    fn sideways_frame_is_rotated_upright() {
        // Sensor mounted a quarter turn from the scene.
        let stored = imageops::rotate270(&red_blue());
        let mut input = frame(stored.into_raw(), 1, 2, PixelFormat::Rgb8);
        input.orientation = Orientation::Right;

        let converter = FrameConverter::new(CaptureFormat::new(PixelFormat::Rgb8, 2, 1));
        assert_eq!(converter.upright(&input).unwrap(), red_blue());
    }

    #[test]
    fn mirrored_frame_is_flipped_back() {
        let stored = imageops::flip_horizontal(&red_blue());
        let mut input = frame(stored.into_raw(), 2, 1, PixelFormat::Rgb8);
        input.orientation = Orientation::UpMirrored;

        let converter = FrameConverter::new(CaptureFormat::new(PixelFormat::Rgb8, 2, 1));
        assert_eq!(converter.upright(&input).unwrap(), red_blue());
    }

    #[test]
    fn conversion_is_deterministic() {
        let mut image = RgbImage::new(16, 12);
        for (x, y, px) in image.enumerate_pixels_mut() {
            *px = Rgb([(x * 13) as u8, (y * 19) as u8, ((x + y) * 7) as u8]);
        }
        let converter = FrameConverter::new(CaptureFormat::new(PixelFormat::Rgb8, 16, 12));
        let input = frame(image.into_raw(), 16, 12, PixelFormat::Rgb8);
        let spec = spec(8, 8, ChannelOrder::Bgr);

        let first = converter.to_model_input(&input, &spec).unwrap();
        let second = converter.to_model_input(&input, &spec).unwrap();
        assert_eq!(first, second);
        assert_eq!((first.width(), first.height()), (8, 8));
        assert_eq!(first.channel_order(), ChannelOrder::Bgr);
    }

    #[test]
    fn jpeg_frames_are_decoded() {
        let mut encoded = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([90, 90, 90])))
            .write_to(&mut encoded, ImageFormat::Jpeg)
            .unwrap();
        let converter = FrameConverter::new(CaptureFormat::new(PixelFormat::Jpeg, 8, 8));
        let upright = converter
            .upright(&frame(encoded.into_inner(), 8, 8, PixelFormat::Jpeg))
            .unwrap();
        assert_eq!(upright.dimensions(), (8, 8));
    }

    #[test]
    fn contract_violations_are_rejected() {
        let converter = FrameConverter::new(CaptureFormat::new(PixelFormat::Bgr8, 2, 1));

        let wrong_format = frame(vec![0; 6], 2, 1, PixelFormat::Rgb8);
        assert!(matches!(
            converter.upright(&wrong_format),
            Err(ConvertError::FormatMismatch { .. })
        ));

        let short = frame(vec![0; 5], 2, 1, PixelFormat::Bgr8);
        assert!(matches!(
            converter.upright(&short),
            Err(ConvertError::BufferSize {
                expected: 6,
                actual: 5
            })
        ));

        let wrong_size = frame(vec![0; 12], 4, 1, PixelFormat::Bgr8);
        assert!(matches!(
            converter.upright(&wrong_size),
            Err(ConvertError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn grayscale_is_unsupported() {
        let converter = FrameConverter::new(CaptureFormat::new(PixelFormat::Gray8, 2, 1));
        let err = converter
            .upright(&frame(vec![0, 0], 2, 1, PixelFormat::Gray8))
            .unwrap_err();
        assert!(matches!(
            err,
            ConvertError::UnsupportedPixelFormat {
                format: PixelFormat::Gray8
            }
        ));
    }
}
