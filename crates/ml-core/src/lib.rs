//! Model bundles and the inference engine that runs them.
//!
//! A bundle is opened and validated once; the resulting [`InferenceEngine`]
//! is immutable and may be shared across threads for the life of the process.
//! Enable the `with-tch` feature to execute TorchScript bundles through `tch`.

pub mod bundle;
pub mod engine;
mod error;
pub mod input;
mod result;
#[cfg(feature = "with-tch")]
pub mod torch;

pub use bundle::{ChannelOrder, ImageInputSpec, ModelBundle, Normalization, OutputSpec};
pub use engine::{EngineOptions, InferenceEngine, ModelBackend};
pub use error::{InferenceError, LoadError};
pub use input::ModelInput;
pub use result::InferenceResult;

#[cfg(feature = "with-tch")]
pub use tch;
