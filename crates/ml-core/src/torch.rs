//! TorchScript backend built on `tch`.

use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use tch::{CModule, Device, IValue, Kind, Tensor};
use tracing::debug;

use crate::{
    bundle::{ImageInputSpec, ModelBundle},
    engine::ModelBackend,
    error::{InferenceError, LoadError},
    input::ModelInput,
};

/// TorchScript module taking a `[1, 3, H, W]` float tensor.
///
/// The module may return a single tensor or a tuple/list of tensors; all
/// elements are flattened in order and must add up to the declared outputs.
pub struct TorchScriptBackend {
    module: Mutex<CModule>,
    device: Device,
}

impl TorchScriptBackend {
    pub fn load(bundle: &ModelBundle) -> Result<Self, LoadError> {
        let device = Device::cuda_if_available();
        let module = CModule::load_on_device(bundle.model_file(), device).map_err(|err| {
            LoadError::Backend(format!(
                "failed to load TorchScript module {}: {err}",
                bundle.model_file().display()
            ))
        })?;
        debug!(device = ?device, "torchscript module loaded");
        Ok(Self {
            module: Mutex::new(module),
            device,
        })
    }

    /// Normalised HWC pixels as a `[1, 3, H, W]` tensor on the module's device.
    fn to_tensor(&self, input: &ModelInput, spec: &ImageInputSpec) -> Tensor {
        let data = input.to_hwc_f32(spec);
        Tensor::from_slice(&data)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, input.height() as i64, input.width() as i64, 3])
            .permute([0, 3, 1, 2])
    }
}

impl ModelBackend for TorchScriptBackend {
    fn name(&self) -> &str {
        "torchscript"
    }

    fn forward(
        &self,
        input: &ModelInput,
        spec: &ImageInputSpec,
    ) -> Result<Vec<f64>, InferenceError> {
        let tensor = self.to_tensor(input, spec);
        let output = {
            let module = self.module.lock().unwrap_or_else(PoisonError::into_inner);
            module
                .forward_is(&[IValue::Tensor(tensor)])
                .context("TorchScript forward failed")?
        };

        let mut values = Vec::new();
        flatten(output, &mut values)?;
        Ok(values)
    }
}

fn flatten(value: IValue, out: &mut Vec<f64>) -> Result<(), InferenceError> {
    match value {
        IValue::Tensor(tensor) => {
            let flat = tensor
                .to_device(Device::Cpu)
                .to_kind(Kind::Double)
                .contiguous()
                .view([-1]);
            let values = Vec::<f64>::try_from(&flat).context("failed to read output tensor")?;
            out.extend(values);
        }
        IValue::Double(value) => out.push(value),
        IValue::Int(value) => out.push(value as f64),
        IValue::Tuple(items) | IValue::GenericList(items) => {
            for item in items {
                flatten(item, out)?;
            }
        }
        IValue::TensorList(tensors) => {
            for tensor in tensors {
                flatten(IValue::Tensor(tensor), out)?;
            }
        }
        other => {
            return Err(InferenceError::Backend(format!(
                "unsupported TorchScript output {other:?}"
            )));
        }
    }
    Ok(())
}
