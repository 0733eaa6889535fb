//! Native device provider built on libavutil.

mod device;
pub mod sys;

pub use device::{FfmpegDevice, FfmpegDeviceProvider, HW_FRAME_POOL_SIZE};

/// Whether this build links the native codec libraries.
pub const AVAILABLE: bool = true;
