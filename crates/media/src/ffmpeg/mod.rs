//! libavformat/libavcodec implementation of the codec seams.

mod context;
mod decoder;
mod demuxer;
mod encoder;
mod frames;
mod mapping;
mod muxer;
mod scale;

use std::path::Path;

use cutline_common::error::CutlineResult;
use cutline_hwaccel::HardwareContext;

use crate::codec::{
    EncoderSettings, FallbackReason, FrameConverter, FrameDecoder, FrameEncoder, MediaBackend,
    PacketSink, PacketSource, StreamInfo,
};
use crate::pool::FramePool;

pub use decoder::FfmpegDecoder;
pub use demuxer::FfmpegDemuxer;
pub use encoder::FfmpegEncoder;
pub use frames::FfmpegSurface;
pub use muxer::FfmpegMuxer;
pub use scale::SwsConverter;

/// Media backend that opens real files through FFmpeg.
#[derive(Debug, Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        Self
    }
}

impl MediaBackend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn open_source(&self, path: &Path) -> CutlineResult<Box<dyn PacketSource>> {
        Ok(Box::new(FfmpegDemuxer::open(path)?))
    }

    fn open_hardware_decoder(
        &self,
        info: &StreamInfo,
        context: &HardwareContext,
        pool: &FramePool,
        threads: u32,
    ) -> Result<Box<dyn FrameDecoder>, FallbackReason> {
        Ok(Box::new(FfmpegDecoder::open_hardware(
            info, context, pool, threads,
        )?))
    }

    fn open_software_decoder(
        &self,
        info: &StreamInfo,
        pool: &FramePool,
        threads: u32,
    ) -> CutlineResult<Box<dyn FrameDecoder>> {
        Ok(Box::new(FfmpegDecoder::open_software(info, pool, threads)?))
    }

    fn open_sink(&self, path: &Path) -> CutlineResult<Box<dyn PacketSink>> {
        Ok(Box::new(FfmpegMuxer::create(path)?))
    }

    fn needs_global_header(&self, path: &Path) -> bool {
        muxer::wants_global_header(path)
    }

    fn open_hardware_encoder(
        &self,
        settings: &EncoderSettings,
        context: &HardwareContext,
        _pool: &FramePool,
    ) -> Result<Box<dyn FrameEncoder>, FallbackReason> {
        Ok(Box::new(FfmpegEncoder::open_hardware(settings, context)?))
    }

    fn open_software_encoder(
        &self,
        settings: &EncoderSettings,
        _pool: &FramePool,
    ) -> CutlineResult<Box<dyn FrameEncoder>> {
        Ok(Box::new(FfmpegEncoder::open_software(settings)?))
    }

    fn converter(&self) -> Box<dyn FrameConverter> {
        Box::<SwsConverter>::default()
    }
}
