//! Pixel formats and frame residency.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::backend::HardwareBackend;

/// Pixel layouts understood by the pipeline.
///
/// The last three are opaque device formats: the pixels live in GPU
/// memory and are only reachable through the owning backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    P010le,
    Rgba,
    Bgra,
    Rgb24,
    Cuda,
    Vaapi,
    #[serde(rename = "videotoolbox")]
    VideoToolbox,
}

impl PixelFormat {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "yuv420p" | "i420" => Some(Self::Yuv420p),
            "nv12" => Some(Self::Nv12),
            "p010" | "p010le" => Some(Self::P010le),
            "rgba" => Some(Self::Rgba),
            "bgra" => Some(Self::Bgra),
            "rgb24" | "rgb" => Some(Self::Rgb24),
            "cuda" => Some(Self::Cuda),
            "vaapi" => Some(Self::Vaapi),
            "videotoolbox" | "videotoolbox_vld" => Some(Self::VideoToolbox),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Yuv420p => "yuv420p",
            Self::Nv12 => "nv12",
            Self::P010le => "p010le",
            Self::Rgba => "rgba",
            Self::Bgra => "bgra",
            Self::Rgb24 => "rgb24",
            Self::Cuda => "cuda",
            Self::Vaapi => "vaapi",
            Self::VideoToolbox => "videotoolbox",
        }
    }

    /// Backend owning this device format, if it is one.
    pub fn device_backend(&self) -> Option<HardwareBackend> {
        match self {
            Self::Cuda => Some(HardwareBackend::Cuda),
            Self::Vaapi => Some(HardwareBackend::Vaapi),
            Self::VideoToolbox => Some(HardwareBackend::VideoToolbox),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a frame's pixels live. Assigned once when the frame is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Residency {
    Cpu,
    Gpu(HardwareBackend),
}

impl Residency {
    pub fn is_gpu(&self) -> bool {
        matches!(self, Self::Gpu(_))
    }

    pub fn backend(&self) -> Option<HardwareBackend> {
        match self {
            Self::Gpu(backend) => Some(*backend),
            Self::Cpu => None,
        }
    }
}

/// Whether `format` tags device-resident pixels on any backend.
pub fn is_resident_format(format: PixelFormat) -> bool {
    format.device_backend().is_some()
}

/// Classify a native frame at the point it is first wrapped.
///
/// A populated device-context reference on the native frame is enough to
/// call it resident even when the format tag alone is ambiguous; the
/// session's own backend is then the owner.
pub fn classify_residency(
    format: Option<PixelFormat>,
    has_device_context: bool,
    session_backend: HardwareBackend,
) -> Residency {
    if let Some(backend) = format.and_then(|f| f.device_backend()) {
        return Residency::Gpu(backend);
    }
    if has_device_context && session_backend.is_hardware() {
        return Residency::Gpu(session_backend);
    }
    Residency::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_formats_are_resident_on_every_backend() {
        for backend in HardwareBackend::PROBE_ORDER {
            let format = backend.device_format().unwrap();
            assert!(is_resident_format(format));
            assert_eq!(
                classify_residency(Some(format), false, HardwareBackend::None),
                Residency::Gpu(backend)
            );
        }
        assert!(!is_resident_format(PixelFormat::Nv12));
    }

    #[test]
    fn device_context_alone_marks_frame_resident() {
        assert_eq!(
            classify_residency(None, true, HardwareBackend::Vaapi),
            Residency::Gpu(HardwareBackend::Vaapi)
        );
        assert_eq!(
            classify_residency(Some(PixelFormat::Nv12), true, HardwareBackend::Cuda),
            Residency::Gpu(HardwareBackend::Cuda)
        );
        // A stray context on a software session is not evidence of anything.
        assert_eq!(
            classify_residency(Some(PixelFormat::Nv12), true, HardwareBackend::None),
            Residency::Cpu
        );
    }

    #[test]
    fn parse_round_trips_names() {
        for format in [
            PixelFormat::Yuv420p,
            PixelFormat::Nv12,
            PixelFormat::Rgba,
            PixelFormat::VideoToolbox,
        ] {
            assert_eq!(PixelFormat::parse(format.name()), Some(format));
        }
        assert_eq!(PixelFormat::parse("yuv444p"), None);
    }
}
