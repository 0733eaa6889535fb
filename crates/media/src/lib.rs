//! Cutline media sessions
//!
//! Frame model, pooled CPU buffers, and the two session types the renderer
//! drives:
//! - [`SourceDecoder`]: frame-accurate random access over one source file,
//!   optionally keeping frames on the GPU
//! - [`OutputEncoder`]: synchronous or asynchronous batched encoding into
//!   one output container
//!
//! Native codec access goes through the traits in [`codec`]; the FFmpeg
//! implementation needs the `ffmpeg` feature.

pub mod codec;
pub mod decoder;
pub mod encoder;
pub mod frame;
pub mod pool;
pub mod rational;
pub mod synthetic;
pub mod teardown;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

#[cfg(not(feature = "ffmpeg"))]
#[path = "ffmpeg_stub.rs"]
pub mod ffmpeg;

pub use codec::{
    CodecLifecycle, CodecStatus, EncoderSettings, FallbackReason, FrameConverter, FrameDecoder,
    FrameEncoder, MediaBackend, Packet, PacketSink, PacketSource, RateControl, StreamInfo,
    StreamParameters,
};
pub use decoder::{DecoderOptions, DecoderStats, SourceDecoder};
pub use encoder::{
    encoder_tuning, ContextOwnership, EncodeMode, EncoderOptions, EncoderStats, EncoderTuning,
    OutputEncoder,
};
pub use frame::{ColorMetadata, Frame, FramePayload, GpuSurface, Rgba};
pub use pool::{FramePool, PoolStats, PooledBuffer};
pub use rational::Rational;
pub use teardown::retire_codec;
