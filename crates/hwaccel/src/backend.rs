//! Backend and codec identifiers, plus the static codec-session tables.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::format::PixelFormat;

/// A GPU acceleration path.
///
/// `Auto` is a request, never a resolved value: the registry turns it into
/// one of the concrete backends (or `None`) before any session sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HardwareBackend {
    /// Software only.
    #[default]
    None,
    /// Pick the best available backend at resolve time.
    Auto,
    /// NVIDIA CUDA (NVDEC/NVENC).
    Cuda,
    /// VA-API (Intel/AMD on Linux).
    Vaapi,
    /// Apple VideoToolbox.
    #[serde(rename = "videotoolbox")]
    VideoToolbox,
}

impl HardwareBackend {
    /// Order in which backends are probed.
    pub const PROBE_ORDER: [HardwareBackend; 3] = [Self::Cuda, Self::Vaapi, Self::VideoToolbox];

    /// Order in which available backends are preferred.
    pub const PRIORITY: [HardwareBackend; 3] = [Self::Cuda, Self::VideoToolbox, Self::Vaapi];

    /// Parse a user-facing backend name. Unrecognized names map to `None`.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "auto" => Self::Auto,
            "cuda" | "nvenc" | "nvdec" | "nvidia" => Self::Cuda,
            "vaapi" => Self::Vaapi,
            "videotoolbox" | "vt" => Self::VideoToolbox,
            "none" | "off" | "software" | "cpu" => Self::None,
            other => {
                tracing::debug!(name = other, "Unrecognized hardware backend name");
                Self::None
            }
        }
    }

    /// Canonical lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Auto => "auto",
            Self::Cuda => "cuda",
            Self::Vaapi => "vaapi",
            Self::VideoToolbox => "videotoolbox",
        }
    }

    /// True for the three concrete GPU backends.
    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::Cuda | Self::Vaapi | Self::VideoToolbox)
    }

    /// Pixel format tag of device-resident frames on this backend.
    pub fn device_format(&self) -> Option<PixelFormat> {
        match self {
            Self::Cuda => Some(PixelFormat::Cuda),
            Self::Vaapi => Some(PixelFormat::Vaapi),
            Self::VideoToolbox => Some(PixelFormat::VideoToolbox),
            Self::None | Self::Auto => None,
        }
    }

    /// CPU layout used when moving pixels to or from device memory.
    pub fn transfer_format(&self) -> PixelFormat {
        PixelFormat::Nv12
    }

    /// Default device string for a device index, when the backend uses one.
    pub fn default_device_path(&self, index: u32) -> Option<String> {
        match self {
            Self::Cuda => Some(index.to_string()),
            Self::Vaapi => Some(format!("/dev/dri/renderD{}", 128 + index)),
            Self::VideoToolbox | Self::None | Self::Auto => None,
        }
    }
}

impl fmt::Display for HardwareBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&str> for HardwareBackend {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

/// One discovered GPU device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareDevice {
    pub backend: HardwareBackend,
    /// Zero-based index among devices of this backend.
    pub index: u32,
    /// Platform handle: CUDA ordinal, DRM render node path, or none.
    pub path: Option<PathBuf>,
}

impl HardwareDevice {
    /// Device with the backend's default path for `index`.
    pub fn with_default_path(backend: HardwareBackend, index: u32) -> Self {
        Self {
            backend,
            index,
            path: backend.default_device_path(index).map(PathBuf::from),
        }
    }
}

/// Codec families the renderer can produce and consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Hevc,
    Av1,
}

impl VideoCodec {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "h264" | "avc" | "x264" => Some(Self::H264),
            "hevc" | "h265" | "x265" => Some(Self::Hevc),
            "av1" => Some(Self::Av1),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Av1 => "av1",
        }
    }

    /// Software encoder used when no hardware session is available.
    pub fn software_encoder_name(&self) -> &'static str {
        match self {
            Self::H264 => "libx264",
            Self::Hevc => "libx265",
            Self::Av1 => "libsvtav1",
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a backend decodes a given codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    /// A backend-specific decoder looked up by name.
    Dedicated(&'static str),
    /// The plain software decoder with the device context attached.
    AttachContext,
    /// The backend cannot decode this codec.
    Unsupported,
}

/// Hardware encoder session name, or `None` if the pair is unsupported.
pub fn encoder_name(codec: VideoCodec, backend: HardwareBackend) -> Option<&'static str> {
    match (codec, backend) {
        (VideoCodec::H264, HardwareBackend::Cuda) => Some("h264_nvenc"),
        (VideoCodec::Hevc, HardwareBackend::Cuda) => Some("hevc_nvenc"),
        (VideoCodec::Av1, HardwareBackend::Cuda) => Some("av1_nvenc"),
        (VideoCodec::H264, HardwareBackend::Vaapi) => Some("h264_vaapi"),
        (VideoCodec::Hevc, HardwareBackend::Vaapi) => Some("hevc_vaapi"),
        (VideoCodec::Av1, HardwareBackend::Vaapi) => Some("av1_vaapi"),
        (VideoCodec::H264, HardwareBackend::VideoToolbox) => Some("h264_videotoolbox"),
        (VideoCodec::Hevc, HardwareBackend::VideoToolbox) => Some("hevc_videotoolbox"),
        _ => None,
    }
}

/// Dedicated hardware decoder name. Only CUDA uses one; VA-API and
/// VideoToolbox decode through the software decoder plus a context.
pub fn decoder_name(codec: VideoCodec, backend: HardwareBackend) -> Option<&'static str> {
    match (codec, backend) {
        (VideoCodec::H264, HardwareBackend::Cuda) => Some("h264_cuvid"),
        (VideoCodec::Hevc, HardwareBackend::Cuda) => Some("hevc_cuvid"),
        (VideoCodec::Av1, HardwareBackend::Cuda) => Some("av1_cuvid"),
        _ => None,
    }
}

/// Resolve how `backend` decodes `codec`.
pub fn decode_strategy(codec: VideoCodec, backend: HardwareBackend) -> DecodeStrategy {
    if let Some(name) = decoder_name(codec, backend) {
        return DecodeStrategy::Dedicated(name);
    }
    match (codec, backend) {
        (_, HardwareBackend::Vaapi) => DecodeStrategy::AttachContext,
        (VideoCodec::H264 | VideoCodec::Hevc, HardwareBackend::VideoToolbox) => {
            DecodeStrategy::AttachContext
        }
        _ => DecodeStrategy::Unsupported,
    }
}

/// Whether a codec session name denotes a hardware session.
///
/// Only for names the caller looked up itself; resolved sessions carry
/// their backend explicitly.
pub fn is_hardware_session_name(name: &str) -> bool {
    ["_nvenc", "_cuvid", "_vaapi", "_videotoolbox", "_qsv"]
        .iter()
        .any(|suffix| name.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_aliases_and_rejects_unknown() {
        assert_eq!(HardwareBackend::parse("AUTO"), HardwareBackend::Auto);
        assert_eq!(HardwareBackend::parse("nvenc"), HardwareBackend::Cuda);
        assert_eq!(HardwareBackend::parse("vt"), HardwareBackend::VideoToolbox);
        assert_eq!(HardwareBackend::parse("quicksync"), HardwareBackend::None);
        assert_eq!(HardwareBackend::parse(""), HardwareBackend::None);
    }

    #[test]
    fn only_cuda_has_dedicated_decoders() {
        for codec in [VideoCodec::H264, VideoCodec::Hevc, VideoCodec::Av1] {
            assert!(decoder_name(codec, HardwareBackend::Cuda).is_some());
            assert!(decoder_name(codec, HardwareBackend::Vaapi).is_none());
            assert!(decoder_name(codec, HardwareBackend::VideoToolbox).is_none());
        }
        assert_eq!(
            decode_strategy(VideoCodec::Hevc, HardwareBackend::Vaapi),
            DecodeStrategy::AttachContext
        );
        assert_eq!(
            decode_strategy(VideoCodec::H264, HardwareBackend::Cuda),
            DecodeStrategy::Dedicated("h264_cuvid")
        );
        assert_eq!(
            decode_strategy(VideoCodec::Av1, HardwareBackend::VideoToolbox),
            DecodeStrategy::Unsupported
        );
    }

    #[test]
    fn encoder_table_is_empty_for_unsupported_pairs() {
        assert_eq!(
            encoder_name(VideoCodec::H264, HardwareBackend::VideoToolbox),
            Some("h264_videotoolbox")
        );
        assert_eq!(encoder_name(VideoCodec::Av1, HardwareBackend::VideoToolbox), None);
        assert_eq!(encoder_name(VideoCodec::H264, HardwareBackend::None), None);
        assert_eq!(encoder_name(VideoCodec::H264, HardwareBackend::Auto), None);
    }

    #[test]
    fn session_names_from_tables_are_hardware() {
        for backend in HardwareBackend::PROBE_ORDER {
            for codec in [VideoCodec::H264, VideoCodec::Hevc] {
                let name = encoder_name(codec, backend).unwrap();
                assert!(is_hardware_session_name(name), "{name}");
            }
        }
        assert!(!is_hardware_session_name("libx264"));
    }

    #[test]
    fn vaapi_device_paths_start_at_render_node_128() {
        let dev = HardwareDevice::with_default_path(HardwareBackend::Vaapi, 1);
        assert_eq!(dev.path, Some(PathBuf::from("/dev/dri/renderD129")));
        assert_eq!(
            HardwareDevice::with_default_path(HardwareBackend::VideoToolbox, 0).path,
            None
        );
    }
}
