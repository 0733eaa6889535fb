//! Placeholder used when the `ffmpeg` feature is disabled.

use std::path::Path;

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::HardwareContext;

use crate::codec::{
    EncoderSettings, FallbackReason, FrameConverter, FrameDecoder, FrameEncoder, MediaBackend,
    PacketSink, PacketSource, StreamInfo,
};
use crate::frame::Frame;
use crate::pool::FramePool;

fn disabled(what: &str) -> CutlineError {
    CutlineError::unsupported(format!("{what} needs the `ffmpeg` feature"))
}

/// Media backend that refuses every request.
#[derive(Debug, Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        Self
    }
}

struct DisabledConverter;

impl FrameConverter for DisabledConverter {
    fn convert(
        &mut self,
        _frame: &Frame,
        _width: u32,
        _height: u32,
        _format: cutline_hwaccel::PixelFormat,
        _pool: &FramePool,
    ) -> CutlineResult<Frame> {
        Err(disabled("pixel conversion"))
    }
}

impl MediaBackend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg (disabled)"
    }

    fn open_source(&self, path: &Path) -> CutlineResult<Box<dyn PacketSource>> {
        Err(disabled(&format!("opening {}", path.display())))
    }

    fn open_hardware_decoder(
        &self,
        info: &StreamInfo,
        _context: &HardwareContext,
        _pool: &FramePool,
        _threads: u32,
    ) -> Result<Box<dyn FrameDecoder>, FallbackReason> {
        Err(FallbackReason::OpenFailed {
            name: info.codec_name.clone(),
            message: "built without the `ffmpeg` feature".into(),
        })
    }

    fn open_software_decoder(
        &self,
        info: &StreamInfo,
        _pool: &FramePool,
        _threads: u32,
    ) -> CutlineResult<Box<dyn FrameDecoder>> {
        Err(disabled(&format!("decoding {}", info.codec_name)))
    }

    fn open_sink(&self, path: &Path) -> CutlineResult<Box<dyn PacketSink>> {
        Err(disabled(&format!("writing {}", path.display())))
    }

    fn open_hardware_encoder(
        &self,
        settings: &EncoderSettings,
        _context: &HardwareContext,
        _pool: &FramePool,
    ) -> Result<Box<dyn FrameEncoder>, FallbackReason> {
        Err(FallbackReason::OpenFailed {
            name: settings.codec.name().to_string(),
            message: "built without the `ffmpeg` feature".into(),
        })
    }

    fn open_software_encoder(
        &self,
        settings: &EncoderSettings,
        _pool: &FramePool,
    ) -> CutlineResult<Box<dyn FrameEncoder>> {
        Err(disabled(&format!("encoding {}", settings.codec)))
    }

    fn converter(&self) -> Box<dyn FrameConverter> {
        Box::new(DisabledConverter)
    }
}
