//! Device enumeration and default device selection.

use std::{collections::HashSet, fmt, str::FromStr, sync::Arc};

use tracing::debug;

use crate::{
    backend::CameraBackend,
    types::{CaptureError, Device, Facing},
};

/// Which facing to look for first when choosing the active device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FacingPreference {
    #[default]
    Front,
    Back,
    Any,
}

impl FromStr for FacingPreference {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "front" => Ok(FacingPreference::Front),
            "back" | "rear" => Ok(FacingPreference::Back),
            "any" => Ok(FacingPreference::Any),
            other => Err(format!(
                "unknown facing {other:?} (expected front, back or any)"
            )),
        }
    }
}

impl fmt::Display for FacingPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacingPreference::Front => f.write_str("front"),
            FacingPreference::Back => f.write_str("back"),
            FacingPreference::Any => f.write_str("any"),
        }
    }
}

/// Read-only view over the devices a backend exposes.
///
/// The registry is queried once during setup. Devices that appear or vanish
/// afterwards are not tracked.
#[derive(Clone)]
pub struct DeviceRegistry {
    backend: Arc<dyn CameraBackend>,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn CameraBackend> {
        &self.backend
    }

    /// List the devices visible right now, deduplicated by identifier.
    pub fn list_devices(&self) -> Result<Vec<Device>, CaptureError> {
        let mut seen = HashSet::new();
        let devices: Vec<Device> = self
            .backend
            .enumerate()?
            .into_iter()
            .filter(|device| seen.insert(device.id.clone()))
            .collect();
        debug!(
            backend = self.backend.name(),
            count = devices.len(),
            "enumerated capture devices"
        );
        Ok(devices)
    }

    /// Front camera if present, otherwise the first available device.
    pub fn select_default(devices: &[Device]) -> Result<Device, CaptureError> {
        Self::select_preferred(devices, FacingPreference::Front)
    }

    /// First device with the preferred facing, otherwise the first device.
    pub fn select_preferred(
        devices: &[Device],
        preference: FacingPreference,
    ) -> Result<Device, CaptureError> {
        let wanted = match preference {
            FacingPreference::Front => Some(Facing::Front),
            FacingPreference::Back => Some(Facing::Back),
            FacingPreference::Any => None,
        };
        wanted
            .and_then(|facing| devices.iter().find(|device| device.facing == facing))
            .or_else(|| devices.first())
            .cloned()
            .ok_or(CaptureError::NoDeviceAvailable)
    }
}
