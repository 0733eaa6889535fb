//! Device discovery and sessions through libavutil's hwcontext API.

use std::any::Any;
use std::ffi::c_int;
use std::path::Path;
use std::ptr;

use cutline_common::error::{CutlineError, CutlineResult};
use ffmpeg_sys_next as ffi;

use super::sys::{check_ffmpeg, to_cstring, QuietLogGuard};
use crate::backend::{HardwareBackend, HardwareDevice};
use crate::registry::{DeviceHandle, DeviceProvider};

/// Upper bound on device indices tried per backend.
const MAX_DEVICES_PER_BACKEND: u32 = 8;

fn device_type(backend: HardwareBackend) -> Option<ffi::AVHWDeviceType> {
    match backend {
        HardwareBackend::Cuda => Some(ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA),
        HardwareBackend::Vaapi => Some(ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI),
        HardwareBackend::VideoToolbox => {
            Some(ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX)
        }
        HardwareBackend::None | HardwareBackend::Auto => None,
    }
}

/// Whether the linked libavutil was built with `kind`.
fn compiled_in(kind: ffi::AVHWDeviceType) -> bool {
    let mut current = ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE;
    loop {
        // SAFETY: av_hwdevice_iterate_types is a pure enumeration.
        current = unsafe { ffi::av_hwdevice_iterate_types(current) };
        if current == ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_NONE {
            return false;
        }
        if current == kind {
            return true;
        }
    }
}

/// Why a device is being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenPurpose {
    /// Trial creation while listing devices.
    Probe,
    /// The shared context a render will use.
    Session,
}

impl OpenPurpose {
    /// Trial probes run with libav silenced; real sessions keep its output.
    fn log_guard(self) -> Option<QuietLogGuard> {
        match self {
            OpenPurpose::Probe => Some(QuietLogGuard::new()),
            OpenPurpose::Session => None,
        }
    }
}

/// A live `AVHWDeviceContext` reference.
#[derive(Debug)]
pub struct FfmpegDevice {
    backend: HardwareBackend,
    buffer: *mut ffi::AVBufferRef,
}

// SAFETY: the AVHWDeviceContext is reference counted by libavutil and safe
// to share once created; all mutation happens through new references.
unsafe impl Send for FfmpegDevice {}
unsafe impl Sync for FfmpegDevice {}

impl FfmpegDevice {
    fn create(
        backend: HardwareBackend,
        path: Option<&Path>,
        purpose: OpenPurpose,
    ) -> CutlineResult<Self> {
        let kind = device_type(backend)
            .ok_or_else(|| CutlineError::hardware(format!("{backend} has no device type")))?;
        let device = path.map(|p| to_cstring(&p.to_string_lossy())).transpose()?;
        let device_ptr = device.as_ref().map_or(ptr::null(), |c| c.as_ptr());

        let mut buffer: *mut ffi::AVBufferRef = ptr::null_mut();
        let _quiet = purpose.log_guard();
        // SAFETY: buffer is an out-pointer; device_ptr is null or a valid
        // NUL-terminated string that outlives the call.
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(&mut buffer, kind, device_ptr, ptr::null_mut(), 0)
        };
        check_ffmpeg(ret, "av_hwdevice_ctx_create").map_err(|e| e.into_hardware())?;
        if buffer.is_null() {
            return Err(CutlineError::hardware("av_hwdevice_ctx_create returned null"));
        }
        Ok(Self { backend, buffer })
    }

    /// Borrowed device reference. Valid while `self` lives.
    pub fn as_ptr(&self) -> *mut ffi::AVBufferRef {
        self.buffer
    }

    /// New owned reference for attaching to a codec context.
    ///
    /// The caller owns the result and must unref it (codec contexts do so
    /// when they are freed).
    pub fn new_ref(&self) -> CutlineResult<*mut ffi::AVBufferRef> {
        // SAFETY: self.buffer is a valid, non-null AVBufferRef.
        let r = unsafe { ffi::av_buffer_ref(self.buffer) };
        if r.is_null() {
            return Err(CutlineError::hardware("av_buffer_ref failed for device context"));
        }
        Ok(r)
    }
}

impl DeviceHandle for FfmpegDevice {
    fn backend(&self) -> HardwareBackend {
        self.backend
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for FfmpegDevice {
    fn drop(&mut self) {
        // SAFETY: buffer came from av_hwdevice_ctx_create and is unreffed once.
        unsafe { ffi::av_buffer_unref(&mut self.buffer) };
    }
}

/// Probes backends by trial device creation.
#[derive(Debug, Default)]
pub struct FfmpegDeviceProvider;

impl FfmpegDeviceProvider {
    pub fn new() -> Self {
        Self
    }

    fn try_open(backend: HardwareBackend, index: u32) -> Option<HardwareDevice> {
        let device = HardwareDevice::with_default_path(backend, index);
        if let (HardwareBackend::Vaapi, Some(path)) = (backend, device.path.as_deref()) {
            if !path.exists() {
                return None;
            }
        }
        match FfmpegDevice::create(backend, device.path.as_deref(), OpenPurpose::Probe) {
            Ok(_probe) => Some(device),
            Err(e) => {
                tracing::trace!(%backend, index, error = %e, "Device probe failed");
                None
            }
        }
    }
}

impl DeviceProvider for FfmpegDeviceProvider {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn probe(&self, backend: HardwareBackend) -> CutlineResult<Vec<HardwareDevice>> {
        let kind = device_type(backend)
            .ok_or_else(|| CutlineError::hardware(format!("{backend} is not probeable")))?;
        if !compiled_in(kind) {
            return Err(CutlineError::unsupported(format!(
                "libavutil was built without {backend}"
            )));
        }

        let mut devices = Vec::new();
        let limit = match backend {
            HardwareBackend::VideoToolbox => 1,
            _ => MAX_DEVICES_PER_BACKEND,
        };
        for index in 0..limit {
            match Self::try_open(backend, index) {
                Some(device) => devices.push(device),
                None if backend == HardwareBackend::Vaapi => continue,
                None => break,
            }
        }
        Ok(devices)
    }

    fn open(&self, device: &HardwareDevice) -> CutlineResult<Box<dyn DeviceHandle>> {
        let opened =
            FfmpegDevice::create(device.backend, device.path.as_deref(), OpenPurpose::Session)?;
        Ok(Box::new(opened))
    }
}

/// Number of frames to allocate in a hardware frame pool.
pub const HW_FRAME_POOL_SIZE: c_int = 20;

#[cfg(test)]
mod tests {
    use super::super::sys::LOG_LEVEL_LOCK;
    use super::*;

    #[test]
    fn software_backends_have_no_device_type() {
        assert!(device_type(HardwareBackend::None).is_none());
        assert!(device_type(HardwareBackend::Auto).is_none());
        assert!(FfmpegDeviceProvider::new()
            .probe(HardwareBackend::None)
            .is_err());
    }

    #[test]
    fn probing_never_panics() {
        let _lock = LOG_LEVEL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let provider = FfmpegDeviceProvider::new();
        for backend in HardwareBackend::PROBE_ORDER {
            let _ = provider.probe(backend);
        }
    }

    #[test]
    fn trial_device_opens_silence_libav() {
        let _lock = LOG_LEVEL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let before = unsafe { ffi::av_log_get_level() };
        {
            let _guard = OpenPurpose::Session.log_guard();
            assert_eq!(unsafe { ffi::av_log_get_level() }, before);
        }
        {
            let _guard = OpenPurpose::Probe.log_guard();
            assert_eq!(unsafe { ffi::av_log_get_level() }, ffi::AV_LOG_QUIET as c_int);
        }
        assert_eq!(unsafe { ffi::av_log_get_level() }, before);
    }
}
