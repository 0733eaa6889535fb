//! Seams between the session state machines and the native codec library.
//!
//! [`SourceDecoder`](crate::decoder::SourceDecoder) and
//! [`OutputEncoder`](crate::encoder::OutputEncoder) only talk to these
//! traits. The FFmpeg implementation lives in [`crate::ffmpeg`]; an
//! in-memory one lives in [`crate::synthetic`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use cutline_common::error::CutlineResult;
use cutline_hwaccel::{HardwareBackend, HardwareContext, PixelFormat, VideoCodec};

use crate::frame::{ColorMetadata, Frame};
use crate::pool::FramePool;
use crate::rational::Rational;

/// Outcome of a non-blocking codec call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecStatus<T> {
    Ready(T),
    /// Nothing available right now; feed or drain and retry.
    Again,
    /// The codec has been fully flushed.
    EndOfStream,
}

impl<T> CodecStatus<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

/// Why a hardware session was not used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FallbackReason {
    #[error("hardware acceleration disabled")]
    Disabled,

    #[error("hardware context for {0} could not be created")]
    ContextUnavailable(HardwareBackend),

    #[error("{backend} has no {role} session for {codec}")]
    UnsupportedCodec {
        backend: HardwareBackend,
        codec: String,
        role: &'static str,
    },

    #[error("{name} failed to open: {message}")]
    OpenFailed { name: String, message: String },

    #[error("hardware frame pool setup failed: {0}")]
    FramePool(String),
}

/// A compressed packet of the selected video stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub keyframe: bool,
    /// Units of `pts`, `dts` and `duration`.
    pub time_base: Rational,
}

impl Packet {
    /// Re-express timestamps in `target` units.
    pub fn rescale(&mut self, target: Rational) {
        if self.time_base == target {
            return;
        }
        let from = self.time_base;
        self.pts = self.pts.map(|v| Rational::rescale(v, from, target));
        self.dts = self.dts.map(|v| Rational::rescale(v, from, target));
        self.duration = Rational::rescale(self.duration, from, target);
        self.time_base = target;
    }
}

/// Properties of the selected video stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Codec family, when it is one the renderer can also encode.
    pub codec: Option<VideoCodec>,
    /// Native codec name (e.g. `"h264"`, `"prores"`).
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    /// Decoded software layout, when known.
    pub format: Option<PixelFormat>,
    pub frame_rate: Rational,
    pub time_base: Rational,
    /// First presentation timestamp, in `time_base` units.
    pub start_pts: Option<i64>,
    /// Frame count stored in the container, if any.
    pub frame_count: Option<u64>,
    /// Stream duration in `time_base` units.
    pub duration: Option<i64>,
    /// Whole-container duration in microseconds.
    pub container_duration_us: Option<i64>,
    pub color: ColorMetadata,
    /// Codec configuration record.
    #[serde(skip)]
    pub extradata: Vec<u8>,
}

impl StreamInfo {
    /// Frame count, preferring the stored count, then the stream duration,
    /// then the container duration.
    pub fn total_frames(&self) -> u64 {
        if let Some(count) = self.frame_count.filter(|c| *c > 0) {
            return count;
        }
        let fps = self.frame_rate.as_f64();
        if fps <= 0.0 {
            return 0;
        }
        if let Some(duration) = self.duration.filter(|d| *d > 0) {
            let seconds = duration as f64 * self.time_base.as_f64();
            return (seconds * fps).round() as u64;
        }
        if let Some(us) = self.container_duration_us.filter(|d| *d > 0) {
            return (us as f64 / 1_000_000.0 * fps).round() as u64;
        }
        0
    }
}

/// Everything a container needs to describe the encoded stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParameters {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    /// Time base of packets coming out of the encoder.
    pub time_base: Rational,
    pub bitrate: Option<u64>,
    pub color: ColorMetadata,
    pub extradata: Vec<u8>,
}

/// Rate control actually applied to an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControl {
    BitrateKbps(u32),
    Quality(u32),
}

impl RateControl {
    pub const DEFAULT_QUALITY: u32 = 23;

    /// An explicit bitrate wins over a quality factor.
    pub fn choose(bitrate_kbps: Option<u32>, quality: Option<u32>) -> Self {
        match (bitrate_kbps, quality) {
            (Some(kbps), _) if kbps > 0 => Self::BitrateKbps(kbps),
            (_, Some(q)) => Self::Quality(q),
            _ => Self::Quality(Self::DEFAULT_QUALITY),
        }
    }
}

/// Fully resolved encoder parameters handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub time_base: Rational,
    /// Layout of CPU frames the session accepts (hardware sessions upload
    /// from this layout).
    pub input_format: PixelFormat,
    pub rate: RateControl,
    pub gop_size: u32,
    pub threads: u32,
    /// `Some(0)` disables B-frames; `None` keeps the codec default.
    pub max_b_frames: Option<u32>,
    /// Private codec options, applied in order.
    pub options: Vec<(String, String)>,
    pub color: ColorMetadata,
    /// Codec configuration goes in the container header, not in-band.
    pub global_header: bool,
}

/// Stop-then-release lifecycle of a codec session.
pub trait CodecLifecycle {
    fn is_hardware(&self) -> bool;

    /// Finish outstanding device work. Does not free memory.
    fn stop(&mut self);

    /// Free the session. Must tolerate being called more than once.
    fn release(&mut self);
}

/// Demuxer for the selected video stream of one container.
pub trait PacketSource: Send {
    fn stream_info(&self) -> &StreamInfo;

    /// Next packet of the video stream, `None` at end of container.
    fn read_packet(&mut self) -> CutlineResult<Option<Packet>>;

    /// Reposition at the nearest keyframe at or before `frame_index`.
    ///
    /// Returns the index of the frame the next packet starts, or `None` when
    /// the container carries no timestamps to tell.
    fn seek_keyframe(&mut self, frame_index: u64) -> CutlineResult<Option<u64>>;
}

/// Packet-in, frame-out decoder.
pub trait FrameDecoder: CodecLifecycle + Send {
    fn name(&self) -> &str;

    /// `None` signals end of stream (flush).
    fn send_packet(&mut self, packet: Option<&Packet>) -> CutlineResult<CodecStatus<()>>;

    fn receive_frame(&mut self) -> CutlineResult<CodecStatus<Frame>>;

    /// Drop buffered state after a container seek.
    fn flush(&mut self);

    /// Copy a device-resident frame into a pooled CPU buffer.
    fn download(&mut self, frame: &Frame, pool: &FramePool) -> CutlineResult<Frame>;
}

/// Frame-in, packet-out encoder.
pub trait FrameEncoder: CodecLifecycle + Send {
    fn name(&self) -> &str;

    /// `None` signals end of stream.
    fn send_frame(&mut self, frame: Option<&Frame>) -> CutlineResult<CodecStatus<()>>;

    fn receive_packet(&mut self) -> CutlineResult<CodecStatus<Packet>>;

    /// Move a CPU frame (already in the input layout) into device memory.
    fn upload(&mut self, frame: &Frame) -> CutlineResult<Frame>;

    /// Depth of the session's internal queue, if it reports one.
    fn queue_capacity(&self) -> Option<u32>;

    fn stream_parameters(&self) -> StreamParameters;
}

/// Muxer for a single video stream.
pub trait PacketSink: Send {
    /// Create the stream and write the header.
    fn begin(&mut self, params: &StreamParameters) -> CutlineResult<()>;

    /// Container time base, valid after `begin`.
    fn time_base(&self) -> Rational;

    fn write_packet(&mut self, packet: Packet) -> CutlineResult<()>;

    fn write_trailer(&mut self) -> CutlineResult<()>;

    /// Close the output handle. Idempotent.
    fn close(&mut self) -> CutlineResult<()>;
}

/// CPU scaling and pixel format conversion.
pub trait FrameConverter: Send {
    fn convert(
        &mut self,
        frame: &Frame,
        width: u32,
        height: u32,
        format: PixelFormat,
        pool: &FramePool,
    ) -> CutlineResult<Frame>;
}

/// Factory for every native object a render needs.
pub trait MediaBackend: Send + Sync {
    fn name(&self) -> &str;

    fn open_source(&self, path: &Path) -> CutlineResult<Box<dyn PacketSource>>;

    fn open_hardware_decoder(
        &self,
        info: &StreamInfo,
        context: &HardwareContext,
        pool: &FramePool,
        threads: u32,
    ) -> Result<Box<dyn FrameDecoder>, FallbackReason>;

    fn open_software_decoder(
        &self,
        info: &StreamInfo,
        pool: &FramePool,
        threads: u32,
    ) -> CutlineResult<Box<dyn FrameDecoder>>;

    fn open_sink(&self, path: &Path) -> CutlineResult<Box<dyn PacketSink>>;

    /// Whether the container chosen for `path` stores codec configuration
    /// out of band.
    fn needs_global_header(&self, _path: &Path) -> bool {
        false
    }

    fn open_hardware_encoder(
        &self,
        settings: &EncoderSettings,
        context: &HardwareContext,
        pool: &FramePool,
    ) -> Result<Box<dyn FrameEncoder>, FallbackReason>;

    fn open_software_encoder(
        &self,
        settings: &EncoderSettings,
        pool: &FramePool,
    ) -> CutlineResult<Box<dyn FrameEncoder>>;

    fn converter(&self) -> Box<dyn FrameConverter>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> StreamInfo {
        StreamInfo {
            codec: Some(VideoCodec::H264),
            codec_name: "h264".into(),
            width: 1920,
            height: 1080,
            format: Some(PixelFormat::Yuv420p),
            frame_rate: Rational::new(30, 1),
            time_base: Rational::new(1, 90000),
            start_pts: Some(0),
            frame_count: None,
            duration: None,
            container_duration_us: None,
            color: ColorMetadata::default(),
            extradata: Vec::new(),
        }
    }

    #[test]
    fn total_frames_follows_preference_order() {
        let mut i = info();
        i.container_duration_us = Some(2_000_000);
        assert_eq!(i.total_frames(), 60);
        i.duration = Some(90000 * 10);
        assert_eq!(i.total_frames(), 300);
        i.frame_count = Some(299);
        assert_eq!(i.total_frames(), 299);
    }

    #[test]
    fn total_frames_is_zero_without_any_hint() {
        assert_eq!(info().total_frames(), 0);
    }

    #[test]
    fn bitrate_wins_over_quality() {
        assert_eq!(RateControl::choose(Some(8000), Some(18)), RateControl::BitrateKbps(8000));
        assert_eq!(RateControl::choose(None, Some(18)), RateControl::Quality(18));
        assert_eq!(RateControl::choose(None, None), RateControl::Quality(23));
        assert_eq!(RateControl::choose(Some(0), None), RateControl::Quality(23));
    }

    #[test]
    fn packet_rescale_moves_every_timestamp() {
        let mut packet = Packet {
            data: vec![],
            pts: Some(2),
            dts: Some(1),
            duration: 1,
            keyframe: false,
            time_base: Rational::new(1, 30),
        };
        packet.rescale(Rational::new(1, 90000));
        assert_eq!(packet.pts, Some(6000));
        assert_eq!(packet.dts, Some(3000));
        assert_eq!(packet.duration, 3000);
    }
}
