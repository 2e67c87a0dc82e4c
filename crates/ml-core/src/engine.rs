//! Inference engine: one loaded bundle plus the backend executing it.

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{Mutex, PoisonError},
    time::Instant,
};

use tracing::{debug, info};

use crate::{
    bundle::{ImageInputSpec, ModelBundle},
    error::{InferenceError, LoadError},
    input::ModelInput,
    result::InferenceResult,
};

/// Executes forward passes for a bundle.
///
/// Returns one value per declared output, in declaration order.
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    fn forward(
        &self,
        input: &ModelInput,
        spec: &ImageInputSpec,
    ) -> Result<Vec<f64>, InferenceError>;

    /// Whether `forward` may run concurrently from several threads.
    /// Non-reentrant backends are serialised by the engine.
    fn is_reentrant(&self) -> bool {
        false
    }
}

#[derive(Clone, Debug, Default)]
pub struct EngineOptions {
    /// Output names the caller relies on. When set, the bundle must declare
    /// exactly this set.
    pub expected_outputs: Option<Vec<String>>,
}

/// Loaded model, shared read-only for the life of the process.
pub struct InferenceEngine {
    bundle: ModelBundle,
    backend: Box<dyn ModelBackend>,
    serial: Mutex<()>,
}

impl InferenceEngine {
    /// Open the bundle at `path` with the backend its manifest names.
    pub fn load(path: impl AsRef<Path>, options: &EngineOptions) -> Result<Self, LoadError> {
        Self::load_with(path, options, open_backend)
    }

    /// Open the bundle at `path`, building the backend with `open`.
    pub fn load_with<F>(
        path: impl AsRef<Path>,
        options: &EngineOptions,
        open: F,
    ) -> Result<Self, LoadError>
    where
        F: FnOnce(&ModelBundle) -> Result<Box<dyn ModelBackend>, LoadError>,
    {
        let start = Instant::now();
        let bundle = ModelBundle::open(path)?;
        if let Some(expected) = &options.expected_outputs {
            check_expected_outputs(&bundle, expected)?;
        }
        let backend = open(&bundle)?;

        info!(
            bundle = bundle.name(),
            id = bundle.id().unwrap_or("-"),
            version = bundle.version().unwrap_or("-"),
            backend = backend.name(),
            input = format_args!(
                "{}x{} {:?}",
                bundle.input().width,
                bundle.input().height,
                bundle.input().channel_order
            ),
            outputs = bundle.outputs().len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model bundle loaded"
        );

        Ok(Self {
            bundle,
            backend,
            serial: Mutex::new(()),
        })
    }

    pub fn bundle(&self) -> &ModelBundle {
        &self.bundle
    }

    pub fn input_spec(&self) -> &ImageInputSpec {
        self.bundle.input()
    }

    /// Run one forward pass and name its outputs.
    pub fn run(&self, input: &ModelInput) -> Result<InferenceResult, InferenceError> {
        input.matches(self.bundle.input())?;

        let values = {
            let _serial = if self.backend.is_reentrant() {
                None
            } else {
                Some(self.serial.lock().unwrap_or_else(PoisonError::into_inner))
            };
            self.backend.forward(input, self.bundle.input())?
        };

        let outputs = self.bundle.outputs();
        if values.len() != outputs.len() {
            return Err(InferenceError::OutputMismatch {
                expected: outputs.len(),
                actual: values.len(),
            });
        }

        let named: BTreeMap<String, f64> = outputs
            .iter()
            .map(|output| output.name.clone())
            .zip(values)
            .collect();
        debug!(backend = self.backend.name(), outputs = ?named, "forward pass complete");
        Ok(InferenceResult::new(named))
    }
}

fn check_expected_outputs(bundle: &ModelBundle, expected: &[String]) -> Result<(), LoadError> {
    let mut declared: Vec<&str> = bundle.output_names().collect();
    let mut wanted: Vec<&str> = expected.iter().map(String::as_str).collect();
    declared.sort_unstable();
    wanted.sort_unstable();
    wanted.dedup();
    if declared != wanted {
        return Err(LoadError::Schema(format!(
            "bundle outputs {declared:?} do not match expected {wanted:?}"
        )));
    }
    Ok(())
}

/// Built-in backends, selected by the manifest's `backend` field.
fn open_backend(bundle: &ModelBundle) -> Result<Box<dyn ModelBackend>, LoadError> {
    match bundle.backend() {
        #[cfg(feature = "with-tch")]
        "torchscript" => Ok(Box::new(crate::torch::TorchScriptBackend::load(bundle)?)),
        #[cfg(not(feature = "with-tch"))]
        "torchscript" => Err(LoadError::Backend(
            "torchscript bundles require the `with-tch` feature".into(),
        )),
        "tflite" | "tensorflow" => Err(LoadError::Backend(format!(
            "{} bundles are not supported; export the model to TorchScript and set \
             \"backend\": \"torchscript\"",
            bundle.backend()
        ))),
        other => Err(LoadError::Backend(format!(
            "unsupported model backend {other:?}"
        ))),
    }
}
