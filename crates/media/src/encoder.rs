//! Output encoding.
//!
//! An [`OutputEncoder`] owns one codec session and one container. With a
//! hardware session it runs asynchronously: frames are queued without
//! waiting, the number of unanswered frames is tracked, and packets are
//! drained before the codec queue saturates. Software sessions encode
//! synchronously.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cutline_common::config::{AppConfig, DrainPolicy};
use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::{
    encoder_name, ContextRequest, HardwareBackend, HardwareContext, HardwareContextManager,
    PixelFormat, Residency, VideoCodec,
};

use crate::codec::{
    CodecStatus, EncoderSettings, FallbackReason, FrameConverter, FrameEncoder, MediaBackend,
    PacketSink, RateControl,
};
use crate::frame::{ColorMetadata, Frame};
use crate::pool::FramePool;
use crate::rational::Rational;
use crate::teardown::retire_codec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeMode {
    Synchronous,
    /// Batched submission with bounded draining; used by hardware sessions.
    Asynchronous,
}

/// Whether this encoder created the shared hardware context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOwnership {
    Borrowed,
    /// Reset the manager on teardown.
    Owned,
}

/// Encoder session parameters.
#[derive(Debug, Clone)]
pub struct EncoderOptions {
    pub backend: HardwareBackend,
    pub device_index: u32,
    pub allow_hardware: bool,
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub bitrate_kbps: Option<u32>,
    pub quality: Option<u32>,
    pub preset: Option<String>,
    pub gop_size: u32,
    pub threads: u32,
    /// Frames will arrive device-resident from a hardware decoder.
    pub zero_copy: bool,
    /// CPU layout fed to software sessions.
    pub software_format: PixelFormat,
    pub color: ColorMetadata,
    pub drain: DrainPolicy,
    pub pool_soft_limit: usize,
}

impl EncoderOptions {
    pub fn new(codec: VideoCodec, width: u32, height: u32, frame_rate: Rational) -> Self {
        Self {
            backend: HardwareBackend::None,
            device_index: 0,
            allow_hardware: false,
            codec,
            width,
            height,
            frame_rate,
            bitrate_kbps: None,
            quality: None,
            preset: None,
            gop_size: 60,
            threads: 0,
            zero_copy: false,
            software_format: PixelFormat::Yuv420p,
            color: ColorMetadata::BT709_LIMITED,
            drain: DrainPolicy::default(),
            pool_soft_limit: 8,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        width: u32,
        height: u32,
        frame_rate: Rational,
    ) -> CutlineResult<Self> {
        let codec = VideoCodec::parse(&config.encoder.codec).ok_or_else(|| {
            CutlineError::config(format!("unknown codec {:?}", config.encoder.codec))
        })?;
        Ok(Self {
            backend: HardwareBackend::parse(&config.hardware.backend),
            device_index: config.hardware.device_index,
            allow_hardware: config.hardware.encode,
            bitrate_kbps: config.encoder.bitrate_kbps,
            quality: config.encoder.quality,
            preset: config.encoder.preset.clone(),
            gop_size: config.encoder.gop_size,
            threads: config.encoder.threads,
            drain: config.drain,
            pool_soft_limit: config.pool.soft_limit,
            ..Self::new(codec, width, height, frame_rate)
        })
    }
}

/// Backend-specific codec options.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EncoderTuning {
    pub options: Vec<(String, String)>,
    pub max_b_frames: Option<u32>,
}

/// Codec tuning for a backend.
///
/// VideoToolbox cannot keep decode and display order straight with
/// device-resident input once B-frames are enabled, so zero-copy sessions
/// there run without them. Every other combination keeps the codec default.
pub fn encoder_tuning(
    codec: VideoCodec,
    backend: HardwareBackend,
    zero_copy: bool,
    preset: Option<&str>,
    rate: RateControl,
) -> EncoderTuning {
    let mut options: Vec<(String, String)> = Vec::new();
    let mut push = |k: &str, v: String| options.push((k.to_string(), v));
    let mut max_b_frames = None;

    match backend {
        HardwareBackend::Cuda => {
            push("preset", preset.unwrap_or("p4").to_string());
            push("tune", "hq".to_string());
            match rate {
                RateControl::Quality(q) => {
                    push("rc", "vbr".to_string());
                    push("cq", q.to_string());
                }
                RateControl::BitrateKbps(_) => push("rc", "cbr".to_string()),
            }
        }
        HardwareBackend::Vaapi => match rate {
            RateControl::Quality(q) => {
                push("rc_mode", "CQP".to_string());
                push("qp", q.to_string());
            }
            RateControl::BitrateKbps(_) => push("rc_mode", "VBR".to_string()),
        },
        HardwareBackend::VideoToolbox => {
            push("allow_sw", "0".to_string());
            push("realtime", "0".to_string());
            if zero_copy {
                max_b_frames = Some(0);
            }
        }
        HardwareBackend::None | HardwareBackend::Auto => {
            let default_preset = match codec {
                VideoCodec::Av1 => "8",
                VideoCodec::H264 | VideoCodec::Hevc => "medium",
            };
            push("preset", preset.unwrap_or(default_preset).to_string());
            if let RateControl::Quality(q) = rate {
                push("crf", q.to_string());
            }
        }
    }

    EncoderTuning {
        options,
        max_b_frames,
    }
}

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    pub frames_submitted: u64,
    pub packets_written: u64,
    pub zero_copy_frames: u64,
    pub uploads: u64,
    pub conversions: u64,
    /// Frames given up on when the flush budget ran out.
    pub abandoned_frames: u64,
}

/// Encoder plus muxer for one output file.
pub struct OutputEncoder {
    path: PathBuf,
    settings: EncoderSettings,
    mode: EncodeMode,
    policy: DrainPolicy,
    codec: Option<Box<dyn FrameEncoder>>,
    sink: Option<Box<dyn PacketSink>>,
    converter: Box<dyn FrameConverter>,
    pool: FramePool,
    context: Option<HardwareContext>,
    manager: Arc<HardwareContextManager>,
    ownership: ContextOwnership,
    fallback: Option<FallbackReason>,
    next_pts: i64,
    in_flight: u64,
    codec_drained: bool,
    finalized: bool,
    /// First finalize error; the trailer was never written.
    finalize_failure: Option<String>,
    closed: bool,
    stats: EncoderStats,
}

impl OutputEncoder {
    /// Open the output, trying a hardware session first when allowed.
    ///
    /// Hardware problems fall back to software; only a failure to open any
    /// encoder or the container is an error.
    pub fn create(
        path: impl AsRef<Path>,
        media: &dyn MediaBackend,
        manager: &Arc<HardwareContextManager>,
        options: EncoderOptions,
    ) -> CutlineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if options.width == 0 || options.height == 0 || !options.frame_rate.is_valid() {
            return Err(CutlineError::config(format!(
                "invalid output geometry {}x{} @ {}",
                options.width, options.height, options.frame_rate
            )));
        }
        let pool = FramePool::new(options.pool_soft_limit);
        let was_initialized = manager.is_initialized();
        let global_header = media.needs_global_header(&path);

        let (mut codec, context, settings, fallback) =
            match Self::try_hardware(media, manager, &options, &pool, global_header) {
                Ok((codec, context, settings)) => (codec, Some(context), settings, None),
                Err(reason) => {
                    if reason != FallbackReason::Disabled {
                        tracing::warn!(
                            path = %path.display(),
                            %reason,
                            "Hardware encode unavailable; falling back to software"
                        );
                    }
                    if !was_initialized && manager.is_initialized() {
                        manager.reset();
                    }
                    let settings =
                        Self::resolve_settings(&options, HardwareBackend::None, global_header);
                    let codec = media.open_software_encoder(&settings, &pool)?;
                    (codec, None, settings, Some(reason))
                }
            };

        let ownership = if context.is_some() && !was_initialized {
            ContextOwnership::Owned
        } else {
            ContextOwnership::Borrowed
        };

        let params = codec.stream_parameters();
        let sink = media.open_sink(&path).and_then(|mut sink| {
            sink.begin(&params)?;
            Ok(sink)
        });
        let sink = match sink {
            Ok(sink) => sink,
            Err(e) => {
                retire_codec(codec.as_mut(), options.drain.teardown_delay());
                drop(codec);
                drop(context);
                if ownership == ContextOwnership::Owned {
                    manager.reset();
                }
                return Err(e);
            }
        };

        let mode = if context.is_some() {
            EncodeMode::Asynchronous
        } else {
            EncodeMode::Synchronous
        };
        tracing::info!(
            path = %path.display(),
            encoder = codec.name(),
            ?mode,
            width = settings.width,
            height = settings.height,
            frame_rate = %settings.frame_rate,
            "Output encoder opened"
        );

        Ok(Self {
            path,
            settings,
            mode,
            policy: options.drain,
            codec: Some(codec),
            sink: Some(sink),
            converter: media.converter(),
            pool,
            context,
            manager: manager.clone(),
            ownership,
            fallback,
            next_pts: 0,
            in_flight: 0,
            codec_drained: false,
            finalized: false,
            finalize_failure: None,
            closed: false,
            stats: EncoderStats::default(),
        })
    }

    fn try_hardware(
        media: &dyn MediaBackend,
        manager: &HardwareContextManager,
        options: &EncoderOptions,
        pool: &FramePool,
        global_header: bool,
    ) -> Result<(Box<dyn FrameEncoder>, HardwareContext, EncoderSettings), FallbackReason> {
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
        if encoder_name(options.codec, backend).is_none() {
            return Err(FallbackReason::UnsupportedCodec {
                backend,
                codec: options.codec.name().to_string(),
                role: "encode",
            });
        }

        let settings = Self::resolve_settings(options, backend, global_header);
        if settings.max_b_frames == Some(0) {
            tracing::debug!(%backend, "B-frames disabled for zero-copy input");
        } else if options.zero_copy {
            // Reorder under zero-copy is only known to break on VideoToolbox.
            tracing::debug!(%backend, "B-frames left at codec default for zero-copy input");
        }
        let codec = media.open_hardware_encoder(&settings, &context, pool)?;
        Ok((codec, context, settings))
    }

    fn resolve_settings(
        options: &EncoderOptions,
        backend: HardwareBackend,
        global_header: bool,
    ) -> EncoderSettings {
        let rate = RateControl::choose(options.bitrate_kbps, options.quality);
        let tuning = encoder_tuning(
            options.codec,
            backend,
            options.zero_copy && backend.is_hardware(),
            options.preset.as_deref(),
            rate,
        );
        EncoderSettings {
            codec: options.codec,
            width: options.width,
            height: options.height,
            frame_rate: options.frame_rate,
            time_base: options.frame_rate.invert(),
            input_format: if backend.is_hardware() {
                backend.transfer_format()
            } else {
                options.software_format
            },
            rate,
            gop_size: options.gop_size,
            threads: options.threads,
            max_b_frames: tuning.max_b_frames,
            options: tuning.options,
            color: options.color,
            global_header,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn mode(&self) -> EncodeMode {
        self.mode
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

    pub fn ownership(&self) -> ContextOwnership {
        self.ownership
    }

    pub fn fallback_reason(&self) -> Option<&FallbackReason> {
        self.fallback.as_ref()
    }

    /// Frames accepted by the codec that have not produced a packet.
    pub fn in_flight(&self) -> u64 {
        self.in_flight
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    fn codec_mut(&mut self) -> CutlineResult<&mut (dyn FrameEncoder + 'static)> {
        self.codec
            .as_deref_mut()
            .ok_or_else(|| CutlineError::encode("encoder session already closed"))
    }

    fn sink_mut(&mut self) -> CutlineResult<&mut (dyn PacketSink + 'static)> {
        self.sink
            .as_deref_mut()
            .ok_or_else(|| CutlineError::encode("output already closed"))
    }

    fn ensure_writable(&self) -> CutlineResult<()> {
        if self.finalized || self.finalize_failure.is_some() {
            return Err(CutlineError::encode(format!(
                "{} is finalized; no more frames accepted",
                self.path.display()
            )));
        }
        Ok(())
    }

    /// Encode a CPU frame, converting it to the session layout if needed.
    pub fn write_frame(&mut self, frame: &Frame) -> CutlineResult<()> {
        self.ensure_writable()?;
        if frame.is_resident() {
            return Err(CutlineError::unsupported(
                "device-resident frames must go through write_hardware_frame",
            ));
        }
        let prepared = self.prepare_cpu(frame)?;
        let ready = if self.is_using_hardware() {
            self.stats.uploads += 1;
            self.codec_mut()?.upload(&prepared)?
        } else {
            prepared
        };
        self.submit(ready)
    }

    /// Encode on the device. Matching device frames are passed by
    /// reference; CPU frames are uploaded first.
    pub fn write_hardware_frame(&mut self, frame: &Frame) -> CutlineResult<()> {
        if !self.is_using_hardware() {
            return self.write_frame(frame);
        }
        self.ensure_writable()?;
        let backend = self.backend();
        let ready = match frame.residency() {
            Residency::Gpu(owner)
                if owner == backend
                    && frame.width == self.settings.width
                    && frame.height == self.settings.height =>
            {
                self.stats.zero_copy_frames += 1;
                frame.clone()
            }
            Residency::Gpu(owner) => {
                return Err(CutlineError::unsupported(format!(
                    "{owner} {}x{} surface cannot feed a {backend} {}x{} session",
                    frame.width, frame.height, self.settings.width, self.settings.height
                )));
            }
            Residency::Cpu => {
                let prepared = self.prepare_cpu(frame)?;
                self.stats.uploads += 1;
                self.codec_mut()?.upload(&prepared)?
            }
        };
        self.submit(ready)
    }

    fn prepare_cpu(&mut self, frame: &Frame) -> CutlineResult<Frame> {
        let s = &self.settings;
        if frame.width == s.width && frame.height == s.height && frame.format == s.input_format {
            return Ok(frame.clone());
        }
        self.stats.conversions += 1;
        let mut converted =
            self.converter
                .convert(frame, s.width, s.height, s.input_format, &self.pool)?;
        converted.color = frame.color;
        Ok(converted)
    }

    fn submit(&mut self, frame: Frame) -> CutlineResult<()> {
        let frame = frame.with_pts(self.next_pts);
        self.send(Some(&frame))?;
        self.next_pts += 1;
        self.stats.frames_submitted += 1;

        match self.mode {
            EncodeMode::Synchronous => {
                self.drain_available()?;
            }
            EncodeMode::Asynchronous => {
                let capacity = self.codec.as_ref().and_then(|c| c.queue_capacity());
                if self.in_flight >= self.policy.proactive_drain_threshold(capacity) {
                    self.drain_available()?;
                }
            }
        }
        Ok(())
    }

    /// Send a frame (or end of stream), draining while the codec is full.
    fn send(&mut self, frame: Option<&Frame>) -> CutlineResult<()> {
        let mut attempts = 0;
        loop {
            let status = self.codec_mut()?.send_frame(frame)?;
            match status {
                CodecStatus::Ready(()) => {
                    if frame.is_some() {
                        self.in_flight += 1;
                    }
                    return Ok(());
                }
                CodecStatus::EndOfStream if frame.is_none() => return Ok(()),
                CodecStatus::EndOfStream => {
                    return Err(CutlineError::encode("encoder already flushed"));
                }
                CodecStatus::Again => {
                    attempts += 1;
                    if attempts > self.policy.max_drain_attempts {
                        return Err(CutlineError::encode(format!(
                            "encoder refused input after {attempts} drain attempts"
                        )));
                    }
                    if self.drain_available()? == 0 {
                        self.backoff();
                    }
                }
            }
        }
    }

    /// Write every packet the codec has ready. Returns how many.
    fn drain_available(&mut self) -> CutlineResult<usize> {
        let mut written = 0;
        loop {
            let status = self.codec_mut()?.receive_packet()?;
            match status {
                CodecStatus::Ready(mut packet) => {
                    let sink = self.sink_mut()?;
                    packet.rescale(sink.time_base());
                    sink.write_packet(packet)?;
                    self.in_flight = self.in_flight.saturating_sub(1);
                    self.stats.packets_written += 1;
                    written += 1;
                }
                CodecStatus::Again => break,
                CodecStatus::EndOfStream => {
                    self.in_flight = 0;
                    self.codec_drained = true;
                    break;
                }
            }
        }
        Ok(written)
    }

    fn backoff(&self) {
        let delay = self.policy.drain_backoff();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    /// Flush the codec and write the container trailer. Idempotent.
    ///
    /// A failed finalize is not retried; later calls, and `close`, report
    /// the same failure.
    pub fn finalize(&mut self) -> CutlineResult<()> {
        if let Some(reason) = &self.finalize_failure {
            return Err(CutlineError::encode(format!(
                "{} was not finalized: {reason}",
                self.path.display()
            )));
        }
        if self.finalized {
            return Ok(());
        }
        match self.finish_stream() {
            Ok(()) => {
                self.finalized = true;
                Ok(())
            }
            Err(e) => {
                self.finalize_failure = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn finish_stream(&mut self) -> CutlineResult<()> {
        if self.mode == EncodeMode::Asynchronous {
            let mut attempts = 0;
            while self.in_flight > 0 && attempts < self.policy.max_drain_attempts {
                attempts += 1;
                if self.drain_available()? == 0 {
                    self.backoff();
                }
            }
            if self.in_flight > 0 {
                tracing::warn!(
                    path = %self.path.display(),
                    in_flight = self.in_flight,
                    attempts,
                    "Frames still in flight after drain budget; flushing anyway"
                );
            }
        }

        self.send(None)?;
        let mut iterations = 0;
        while !self.codec_drained && iterations < self.policy.max_flush_iterations {
            iterations += 1;
            if self.drain_available()? == 0 && !self.codec_drained {
                self.backoff();
            }
        }
        if !self.codec_drained {
            tracing::warn!(
                path = %self.path.display(),
                iterations,
                in_flight = self.in_flight,
                "Flush budget exhausted; abandoning remaining packets"
            );
            self.stats.abandoned_frames = self.in_flight;
            self.in_flight = 0;
        }

        self.sink_mut()?.write_trailer()?;
        tracing::info!(
            path = %self.path.display(),
            frames = self.stats.frames_submitted,
            packets = self.stats.packets_written,
            zero_copy = self.stats.zero_copy_frames,
            "Output finalized"
        );
        Ok(())
    }

    /// Finalize, close the container, and retire the codec session.
    pub fn close(mut self) -> CutlineResult<EncoderStats> {
        self.shutdown()?;
        Ok(self.stats)
    }

    fn shutdown(&mut self) -> CutlineResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let finalized = self.finalize();
        let closed = match self.sink.take() {
            Some(mut sink) => sink.close(),
            None => Ok(()),
        };
        if let Some(mut codec) = self.codec.take() {
            retire_codec(codec.as_mut(), self.policy.teardown_delay());
        }
        self.pool.trim();
        self.context = None;
        if self.ownership == ContextOwnership::Owned {
            self.manager.reset();
        }
        finalized.and(closed)
    }
}

impl Drop for OutputEncoder {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(path = %self.path.display(), error = %e, "Encoder teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn videotoolbox_zero_copy_disables_b_frames() {
        let rate = RateControl::Quality(20);
        let vt = encoder_tuning(VideoCodec::H264, HardwareBackend::VideoToolbox, true, None, rate);
        assert_eq!(vt.max_b_frames, Some(0));
        let vt_cpu =
            encoder_tuning(VideoCodec::H264, HardwareBackend::VideoToolbox, false, None, rate);
        assert_eq!(vt_cpu.max_b_frames, None);
        for backend in [HardwareBackend::Cuda, HardwareBackend::Vaapi, HardwareBackend::None] {
            assert_eq!(
                encoder_tuning(VideoCodec::H264, backend, true, None, rate).max_b_frames,
                None
            );
        }
    }

    #[test]
    fn quality_and_bitrate_are_exclusive() {
        let q = encoder_tuning(
            VideoCodec::H264,
            HardwareBackend::None,
            false,
            Some("fast"),
            RateControl::Quality(18),
        );
        assert!(q.options.contains(&("crf".into(), "18".into())));
        assert!(q.options.contains(&("preset".into(), "fast".into())));

        let b = encoder_tuning(
            VideoCodec::H264,
            HardwareBackend::None,
            false,
            None,
            RateControl::BitrateKbps(6000),
        );
        assert!(!b.options.iter().any(|(k, _)| k == "crf"));

        let nv = encoder_tuning(
            VideoCodec::Hevc,
            HardwareBackend::Cuda,
            false,
            None,
            RateControl::Quality(25),
        );
        assert!(nv.options.contains(&("cq".into(), "25".into())));
    }

    #[test]
    fn options_follow_config() {
        let mut config = AppConfig::default();
        config.encoder.codec = "hevc".into();
        config.encoder.bitrate_kbps = Some(4000);
        config.hardware.encode = false;
        let options = EncoderOptions::from_config(&config, 1280, 720, Rational::new(25, 1)).unwrap();
        assert_eq!(options.codec, VideoCodec::Hevc);
        assert!(!options.allow_hardware);
        assert_eq!(options.backend, HardwareBackend::Auto);

        config.encoder.codec = "mpeg2".into();
        assert!(EncoderOptions::from_config(&config, 1280, 720, Rational::new(25, 1)).is_err());
    }
}
