//! Frame-accurate source decoding.
//!
//! A [`SourceDecoder`] serves random frame requests from one container.
//! Nearby forward requests are satisfied by decoding sequentially; backward
//! requests and long forward jumps reposition the container at a keyframe
//! and decode forward to the exact target.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cutline_common::config::AppConfig;
use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::{
    decode_strategy, ContextRequest, DecodeStrategy, HardwareBackend, HardwareContext,
    HardwareContextManager, PixelFormat,
};

use crate::codec::{
    CodecStatus, FallbackReason, FrameConverter, FrameDecoder, MediaBackend, Packet,
    PacketSource, StreamInfo,
};
use crate::frame::Frame;
use crate::pool::FramePool;
use crate::rational::pts_to_frame;
use crate::teardown::retire_codec;

/// Default forward distance served by sequential decode.
pub const DEFAULT_SEEK_THRESHOLD: u64 = 60;

/// Decoder session parameters.
#[derive(Debug, Clone)]
pub struct DecoderOptions {
    /// Requested backend; `Auto` resolves through the context manager.
    pub backend: HardwareBackend,
    pub device_index: u32,
    pub allow_hardware: bool,
    pub seek_threshold: u64,
    /// Layout of frames returned by [`SourceDecoder::get_frame`].
    pub output_format: PixelFormat,
    pub threads: u32,
    pub teardown_delay: Duration,
    pub pool_soft_limit: usize,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            backend: HardwareBackend::None,
            device_index: 0,
            allow_hardware: false,
            seek_threshold: DEFAULT_SEEK_THRESHOLD,
            output_format: PixelFormat::Yuv420p,
            threads: 0,
            teardown_delay: Duration::from_millis(100),
            pool_soft_limit: 8,
        }
    }
}

impl DecoderOptions {
    pub fn from_config(config: &AppConfig) -> CutlineResult<Self> {
        let output_format = PixelFormat::parse(&config.decoder.output_format)
            .filter(|f| f.device_backend().is_none())
            .ok_or_else(|| {
                CutlineError::config(format!(
                    "unsupported decoder output format {:?}",
                    config.decoder.output_format
                ))
            })?;
        Ok(Self {
            backend: HardwareBackend::parse(&config.hardware.backend),
            device_index: config.hardware.device_index,
            allow_hardware: config.hardware.decode,
            seek_threshold: config.decoder.seek_threshold_frames,
            output_format,
            threads: config.decoder.threads,
            teardown_delay: config.drain.teardown_delay(),
            pool_soft_limit: config.pool.soft_limit,
        })
    }
}

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub container_seeks: u64,
    pub frames_decoded: u64,
    pub frames_discarded: u64,
    pub frames_delivered: u64,
    pub decode_errors: u64,
}

/// Random-access decoder over one source file.
pub struct SourceDecoder {
    path: PathBuf,
    info: StreamInfo,
    total_frames: u64,
    options: DecoderOptions,
    source: Option<Box<dyn PacketSource>>,
    codec: Option<Box<dyn FrameDecoder>>,
    converter: Box<dyn FrameConverter>,
    pool: FramePool,
    context: Option<HardwareContext>,
    fallback: Option<FallbackReason>,

    /// Index of the last frame handed out; unknown after a container seek.
    last_delivered: Option<u64>,
    last_frame: Option<Frame>,
    /// First decoded frame at or past the positioned target.
    peeked: Option<(u64, Frame)>,
    positioned: Option<u64>,
    /// Index of the first frame after the last container seek.
    seek_landing: Option<u64>,
    decode_cursor: Option<u64>,
    pending: Option<Packet>,
    flush_sent: bool,
    exhausted: bool,
    stats: DecoderStats,
}

impl SourceDecoder {
    /// Open `path`, trying hardware first when the options allow it.
    ///
    /// Hardware problems fall back to software. Only a source without a
    /// usable video decoder is an error.
    pub fn open(
        path: impl AsRef<Path>,
        media: &dyn MediaBackend,
        manager: &HardwareContextManager,
        options: DecoderOptions,
    ) -> CutlineResult<Self> {
        let path = path.as_ref().to_path_buf();
        let source = media.open_source(&path)?;
        let info = source.stream_info().clone();
        if !info.frame_rate.is_valid() || !info.time_base.is_valid() {
            return Err(CutlineError::decode(format!(
                "{} has no usable frame rate or time base",
                path.display()
            )));
        }
        let pool = FramePool::new(options.pool_soft_limit);

        let (codec, context, fallback) =
            match Self::try_hardware(media, manager, &info, &pool, &options) {
                Ok((codec, context)) => (codec, Some(context), None),
                Err(reason) => {
                    if reason != FallbackReason::Disabled {
                        tracing::warn!(
                            path = %path.display(),
                            %reason,
                            "Hardware decode unavailable; falling back to software"
                        );
                    }
                    let codec = media.open_software_decoder(&info, &pool, options.threads)?;
                    (codec, None, Some(reason))
                }
            };

        let total_frames = info.total_frames();
        tracing::info!(
            path = %path.display(),
            decoder = codec.name(),
            hardware = context.is_some(),
            width = info.width,
            height = info.height,
            total_frames,
            "Source decoder opened"
        );

        Ok(Self {
            path,
            info,
            total_frames,
            options,
            source: Some(source),
            codec: Some(codec),
            converter: media.converter(),
            pool,
            context,
            fallback,
            last_delivered: None,
            last_frame: None,
            peeked: None,
            positioned: None,
            seek_landing: None,
            decode_cursor: None,
            pending: None,
            flush_sent: false,
            exhausted: false,
            stats: DecoderStats::default(),
        })
    }

    fn try_hardware(
        media: &dyn MediaBackend,
        manager: &HardwareContextManager,
        info: &StreamInfo,
        pool: &FramePool,
        options: &DecoderOptions,
    ) -> Result<(Box<dyn FrameDecoder>, HardwareContext), FallbackReason> {
        if !options.allow_hardware || options.backend == HardwareBackend::None {
            return Err(FallbackReason::Disabled);
        }
        if !manager.initialize(ContextRequest::new(options.backend, options.device_index)) {
            return Err(FallbackReason::ContextUnavailable(options.backend));
        }
        let context = manager
            .shared_context()
            .ok_or(FallbackReason::ContextUnavailable(options.backend))?;
        let backend = context.backend();

        let unsupported = || FallbackReason::UnsupportedCodec {
            backend,
            codec: info.codec_name.clone(),
            role: "decode",
        };
        let family = info.codec.ok_or_else(unsupported)?;
        if decode_strategy(family, backend) == DecodeStrategy::Unsupported {
            return Err(unsupported());
        }

        let codec = media.open_hardware_decoder(info, &context, pool, options.threads)?;
        Ok((codec, context))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn frame_count(&self) -> u64 {
        self.total_frames
    }

    pub fn is_using_hardware(&self) -> bool {
        self.context.is_some()
    }

    pub fn backend(&self) -> HardwareBackend {
        self.context
            .as_ref()
            .map(HardwareContext::backend)
            .unwrap_or(HardwareBackend::None)
    }

    pub fn fallback_reason(&self) -> Option<&FallbackReason> {
        self.fallback.as_ref()
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Position the session so the next delivered frame is `target`.
    ///
    /// Returns `false` when the stream ends first or decoding fails.
    pub fn seek_to(&mut self, target: u64) -> bool {
        if self.last_delivered == Some(target) && self.last_frame.is_some() {
            return true;
        }
        if self.needs_container_seek(target) && !self.container_seek(target) {
            return false;
        }
        self.skip_to(target)
    }

    fn needs_container_seek(&self, target: u64) -> bool {
        match self.last_delivered {
            None => self.positioned != Some(target),
            Some(last) => target < last || target - last > self.options.seek_threshold,
        }
    }

    fn container_seek(&mut self, target: u64) -> bool {
        let Some(source) = self.source.as_mut() else {
            return false;
        };
        self.stats.container_seeks += 1;
        tracing::debug!(path = %self.path.display(), target, "Container seek");
        let landed = match source.seek_keyframe(target) {
            Ok(Some(landed)) => landed,
            Ok(None) if target == 0 => 0,
            Ok(None) => {
                // Without timestamps the landing keyframe is unknown; count
                // forward from the start instead.
                tracing::debug!(
                    path = %self.path.display(),
                    target,
                    "Seek landing unknown; rewinding to the first frame"
                );
                self.stats.container_seeks += 1;
                if let Err(e) = source.seek_keyframe(0) {
                    tracing::warn!(path = %self.path.display(), error = %e, "Rewind failed");
                    return false;
                }
                0
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), target, error = %e, "Seek failed");
                return false;
            }
        };
        if let Some(codec) = self.codec.as_mut() {
            codec.flush();
        }
        self.pending = None;
        self.peeked = None;
        self.flush_sent = false;
        self.exhausted = false;
        self.last_delivered = None;
        self.last_frame = None;
        self.decode_cursor = None;
        self.positioned = None;
        self.seek_landing = Some(landed);
        true
    }

    /// Decode and discard until a frame at or past `target` is peeked.
    fn skip_to(&mut self, target: u64) -> bool {
        loop {
            if let Some((index, _)) = &self.peeked {
                if *index >= target {
                    self.positioned = Some(target);
                    return true;
                }
                self.peeked = None;
                self.stats.frames_discarded += 1;
            }
            let Some(frame) = self.decode_next() else {
                return false;
            };
            let index = self.frame_index(&frame);
            self.decode_cursor = Some(index);
            self.peeked = Some((index, frame));
        }
    }

    fn frame_index(&self, frame: &Frame) -> u64 {
        match frame.pts {
            Some(pts) => pts_to_frame(
                pts - self.info.start_pts.unwrap_or(0),
                self.info.time_base,
                self.info.frame_rate,
            ),
            None => self
                .decode_cursor
                .map(|c| c + 1)
                .or(self.seek_landing)
                .unwrap_or(0),
        }
    }

    /// Next frame in presentation order, `None` when the stream is done.
    fn decode_next(&mut self) -> Option<Frame> {
        let (Some(codec), Some(source)) = (self.codec.as_mut(), self.source.as_mut()) else {
            return None;
        };
        if self.exhausted {
            return None;
        }
        let mut stalled = false;

        loop {
            match codec.receive_frame() {
                Ok(CodecStatus::Ready(frame)) => {
                    self.stats.frames_decoded += 1;
                    return Some(frame);
                }
                Ok(CodecStatus::EndOfStream) => {
                    self.exhausted = true;
                    return None;
                }
                Ok(CodecStatus::Again) => {}
                Err(e) => {
                    self.stats.decode_errors += 1;
                    tracing::warn!(path = %self.path.display(), error = %e, "Decode failed");
                    return None;
                }
            }

            if self.flush_sent {
                // Flushed codecs that still ask for input have nothing left.
                self.exhausted = true;
                return None;
            }

            let packet = match self.pending.take() {
                Some(packet) => Some(packet),
                None => match source.read_packet() {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::warn!(
                            path = %self.path.display(),
                            error = %e,
                            "Packet read failed; treating as end of container"
                        );
                        None
                    }
                },
            };

            match packet {
                Some(packet) => match codec.send_packet(Some(&packet)) {
                    Ok(CodecStatus::Ready(())) => stalled = false,
                    Ok(CodecStatus::Again) => {
                        if stalled {
                            tracing::warn!(
                                path = %self.path.display(),
                                "Decoder refuses input and produces no output"
                            );
                            self.exhausted = true;
                            return None;
                        }
                        stalled = true;
                        self.pending = Some(packet);
                    }
                    Ok(CodecStatus::EndOfStream) => {
                        self.exhausted = true;
                        return None;
                    }
                    Err(e) => {
                        self.stats.decode_errors += 1;
                        tracing::warn!(
                            path = %self.path.display(),
                            pts = ?packet.pts,
                            error = %e,
                            "Dropping packet the decoder rejected"
                        );
                    }
                },
                None => {
                    self.flush_sent = true;
                    if let Err(e) = codec.send_packet(None) {
                        tracing::warn!(path = %self.path.display(), error = %e, "Flush failed");
                        self.exhausted = true;
                        return None;
                    }
                }
            }
        }
    }

    /// Decoded frame at `index` in whatever residency the codec produced.
    fn fetch(&mut self, index: u64) -> Option<Frame> {
        if self.last_delivered == Some(index) {
            if let Some(frame) = &self.last_frame {
                return Some(frame.clone());
            }
        }
        if !self.seek_to(index) {
            return None;
        }
        let (peeked_index, frame) = self.peeked.take()?;
        let frame = if peeked_index > index {
            // Gap in the source timeline: hold the next frame.
            let held = frame.clone();
            self.peeked = Some((peeked_index, frame));
            held
        } else {
            frame
        };
        self.last_delivered = Some(index);
        self.last_frame = Some(frame.clone());
        self.stats.frames_delivered += 1;
        Some(frame)
    }

    /// CPU frame at `index` in the configured output format.
    ///
    /// `None` means the source has no more frames for this request.
    pub fn get_frame(&mut self, index: u64) -> Option<Frame> {
        let frame = self.fetch(index)?;
        let frame = if frame.is_resident() {
            let codec = self.codec.as_mut()?;
            match codec.download(&frame, &self.pool) {
                Ok(cpu) => cpu,
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), index, error = %e, "Download failed");
                    return None;
                }
            }
        } else {
            frame
        };
        if frame.format == self.options.output_format {
            return Some(frame);
        }
        match self.converter.convert(
            &frame,
            frame.width,
            frame.height,
            self.options.output_format,
            &self.pool,
        ) {
            Ok(converted) => Some(converted),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), index, error = %e, "Conversion failed");
                None
            }
        }
    }

    /// Device-resident frame at `index`, for zero-copy encoding.
    ///
    /// Software sessions return the CPU frame from [`Self::get_frame`].
    pub fn get_hardware_frame(&mut self, index: u64) -> Option<Frame> {
        if !self.is_using_hardware() {
            return self.get_frame(index);
        }
        self.fetch(index)
    }
}

impl Drop for SourceDecoder {
    fn drop(&mut self) {
        self.peeked = None;
        self.last_frame = None;
        self.pending = None;
        if let Some(mut codec) = self.codec.take() {
            retire_codec(codec.as_mut(), self.options.teardown_delay);
        }
        self.source = None;
        self.context = None;
        tracing::debug!(path = %self.path.display(), stats = ?self.stats, "Source decoder closed");
    }
}
