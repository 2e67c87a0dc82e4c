use image::RgbImage;
pub use ml_core::InferenceResult;

use crate::pipeline::error::PipelineError;

/// What the presentation layer shows: the last photo and its inference.
///
/// Both values are replaced together. `inference` is `None` when inference is
/// disabled or the forward pass failed for this photo.
#[derive(Clone, Debug, Default)]
pub struct Presentation {
    pub image: Option<RgbImage>,
    pub inference: Option<InferenceResult>,
}

impl Presentation {
    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.inference.is_none()
    }
}

/// Presentation layer fed by the pipeline.
///
/// Only ever called from the thread that owns the pipeline.
pub trait ResultSink {
    /// A capture finished; render `presentation` in place of the previous one.
    fn present(&mut self, presentation: &Presentation);

    /// A capture produced nothing to show. The current presentation stays.
    fn capture_failed(&mut self, _error: &PipelineError) {}
}

/// Sink that keeps nothing; for headless runs.
#[derive(Debug, Default)]
pub struct NullSink;

impl ResultSink for NullSink {
    fn present(&mut self, _presentation: &Presentation) {}
}
