use crate::{
    bundle::{ChannelOrder, ImageInputSpec},
    error::InferenceError,
};

/// Upright, interleaved 8-bit pixel buffer sized for one model input.
///
/// Always three channels in `channel_order`, row-major, top row first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelInput {
    width: u32,
    height: u32,
    channel_order: ChannelOrder,
    pixels: Vec<u8>,
}

impl ModelInput {
    /// Wrap upright RGB pixels, reordering channels to `channel_order`.
    pub fn from_rgb(
        width: u32,
        height: u32,
        rgb: Vec<u8>,
        channel_order: ChannelOrder,
    ) -> Result<Self, InferenceError> {
        let expected = width as usize * height as usize * 3;
        if rgb.len() != expected {
            return Err(InferenceError::InputMismatch {
                expected: format!("{expected} bytes"),
                actual: format!("{} bytes", rgb.len()),
            });
        }
        let pixels = match channel_order {
            ChannelOrder::Rgb => rgb,
            ChannelOrder::Bgr => rgb
                .chunks_exact(3)
                .flat_map(|px| [px[2], px[1], px[0]])
                .collect(),
        };
        Ok(Self {
            width,
            height,
            channel_order,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channel_order(&self) -> ChannelOrder {
        self.channel_order
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Check dimensions and channel order against the bundle input.
    pub fn matches(&self, spec: &ImageInputSpec) -> Result<(), InferenceError> {
        if (self.width, self.height, self.channel_order)
            != (spec.width, spec.height, spec.channel_order)
        {
            return Err(InferenceError::InputMismatch {
                expected: format!("{}x{} {:?}", spec.width, spec.height, spec.channel_order),
                actual: format!("{}x{} {:?}", self.width, self.height, self.channel_order),
            });
        }
        Ok(())
    }

    /// Normalised HWC floats. The bias of a scale/bias normalisation is indexed
    /// by colour (R, G, B) regardless of the buffer's channel order.
    pub fn to_hwc_f32(&self, spec: &ImageInputSpec) -> Vec<f32> {
        let norm = spec.normalization;
        self.pixels
            .chunks_exact(3)
            .flat_map(|px| {
                let (r, g, b) = match self.channel_order {
                    ChannelOrder::Rgb => (px[0], px[1], px[2]),
                    ChannelOrder::Bgr => (px[2], px[1], px[0]),
                };
                let (r, g, b) = (norm.apply(0, r), norm.apply(1, g), norm.apply(2, b));
                match self.channel_order {
                    ChannelOrder::Rgb => [r, g, b],
                    ChannelOrder::Bgr => [b, g, r],
                }
            })
            .collect()
    }
}
