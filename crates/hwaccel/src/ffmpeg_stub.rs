//! Placeholder used when the `ffmpeg` feature is disabled.

use cutline_common::error::{CutlineError, CutlineResult};

use crate::backend::{HardwareBackend, HardwareDevice};
use crate::registry::{DeviceHandle, DeviceProvider};

/// Whether this build links the native codec libraries.
pub const AVAILABLE: bool = false;

/// Reports every backend as unavailable.
#[derive(Debug, Default)]
pub struct FfmpegDeviceProvider;

impl FfmpegDeviceProvider {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceProvider for FfmpegDeviceProvider {
    fn name(&self) -> &str {
        "ffmpeg (disabled)"
    }

    fn probe(&self, backend: HardwareBackend) -> CutlineResult<Vec<HardwareDevice>> {
        Err(CutlineError::unsupported(format!(
            "cannot probe {backend}: built without the `ffmpeg` feature"
        )))
    }

    fn open(&self, device: &HardwareDevice) -> CutlineResult<Box<dyn DeviceHandle>> {
        Err(CutlineError::unsupported(format!(
            "cannot open {} device {}: built without the `ffmpeg` feature",
            device.backend, device.index
        )))
    }
}
