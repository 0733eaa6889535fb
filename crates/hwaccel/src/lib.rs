//! Cutline hardware acceleration
//!
//! Backend discovery, codec-session naming, pixel residency, and the
//! process-wide device context shared by decoders and encoders.
//!
//! The native provider needs the `ffmpeg` feature; without it every backend
//! reports unavailable and the pipeline runs in software.

pub mod backend;
pub mod context;
pub mod format;
pub mod registry;
pub mod synthetic;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

#[cfg(not(feature = "ffmpeg"))]
#[path = "ffmpeg_stub.rs"]
pub mod ffmpeg;

pub use backend::{
    decode_strategy, decoder_name, encoder_name, is_hardware_session_name, DecodeStrategy,
    HardwareBackend, HardwareDevice, VideoCodec,
};
pub use context::{ContextRequest, HardwareContext, HardwareContextManager};
pub use format::{classify_residency, is_resident_format, PixelFormat, Residency};
pub use registry::{CapabilityReport, DeviceHandle, DeviceProvider, HardwareRegistry};

use std::sync::Arc;

/// The platform device provider for this build.
pub fn default_provider() -> Arc<dyn DeviceProvider> {
    Arc::new(ffmpeg::FfmpegDeviceProvider::new())
}
