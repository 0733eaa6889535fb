use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::{PixelFormat, VideoCodec};

use crate::codec::{Packet, PacketSource, StreamInfo};
use crate::frame::ColorMetadata;
use crate::pool::{FramePool, PooledBuffer};
use crate::rational::{frame_to_pts, Rational};

/// Deterministic sample value for a frame, component and position.
fn pattern_value(index: u64, component: usize, x: usize, y: usize) -> u8 {
    let (a, b, c) = match component {
        0 => (7, 1, 3),
        1 => (13, 2, 1),
        _ => (29, 1, 5),
    };
    ((index.wrapping_mul(a) as usize + b * x + c * y) % 256) as u8
}

/// Render frame `index` of the test pattern into a pooled buffer.
///
/// Planar and semi-planar layouts carry the same samples, so converting a
/// rendered NV12 frame to YUV 4:2:0 gives the rendered YUV 4:2:0 frame.
pub fn render_pattern(
    index: u64,
    width: u32,
    height: u32,
    format: PixelFormat,
    pool: &FramePool,
) -> CutlineResult<PooledBuffer> {
    let mut buffer = pool.acquire(width, height, format)?;
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    match format {
        PixelFormat::Yuv420p => {
            for y in 0..h {
                for (x, v) in buffer.row_mut(0, y).iter_mut().enumerate() {
                    *v = pattern_value(index, 0, x, y);
                }
            }
            for component in 1..3 {
                for y in 0..ch {
                    for (x, v) in buffer.row_mut(component, y).iter_mut().enumerate().take(cw) {
                        *v = pattern_value(index, component, x, y);
                    }
                }
            }
        }
        PixelFormat::Nv12 => {
            for y in 0..h {
                for (x, v) in buffer.row_mut(0, y).iter_mut().enumerate() {
                    *v = pattern_value(index, 0, x, y);
                }
            }
            for y in 0..ch {
                let row = buffer.row_mut(1, y);
                for x in 0..cw {
                    row[2 * x] = pattern_value(index, 1, x, y);
                    row[2 * x + 1] = pattern_value(index, 2, x, y);
                }
            }
        }
        other => {
            return Err(CutlineError::unsupported(format!(
                "test pattern has no {other} rendering"
            )));
        }
    }
    Ok(buffer)
}

/// Which frame-count hint the synthetic container exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameCountHint {
    #[default]
    Stored,
    StreamDuration,
    ContainerDuration,
    Unknown,
}

/// How much timing information the synthetic container carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampMode {
    #[default]
    Full,
    /// Packets carry no pts or dts; seeks still report their keyframe.
    IndexOnly,
    /// No packet timestamps and no seek index.
    Missing,
}

/// Description of a synthetic source file.
#[derive(Debug, Clone)]
pub struct SyntheticClip {
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub time_base: Rational,
    /// Keyframe interval.
    pub gop: u64,
    pub codec: VideoCodec,
    pub count_hint: FrameCountHint,
    pub timestamps: TimestampMode,
    /// Frames whose packets arrive corrupted.
    pub corrupt: BTreeSet<u64>,
}

impl SyntheticClip {
    pub fn new(frames: u64, width: u32, height: u32, frame_rate: Rational) -> Self {
        Self {
            frames,
            width,
            height,
            frame_rate,
            time_base: Rational::new(1, 90000),
            gop: 30,
            codec: VideoCodec::H264,
            count_hint: FrameCountHint::Stored,
            timestamps: TimestampMode::Full,
            corrupt: BTreeSet::new(),
        }
    }

    pub fn with_gop(mut self, gop: u64) -> Self {
        self.gop = gop.max(1);
        self
    }

    pub fn with_codec(mut self, codec: VideoCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_count_hint(mut self, hint: FrameCountHint) -> Self {
        self.count_hint = hint;
        self
    }

    pub fn with_timestamps(mut self, timestamps: TimestampMode) -> Self {
        self.timestamps = timestamps;
        self
    }

    pub fn with_corrupt_frames(mut self, frames: impl IntoIterator<Item = u64>) -> Self {
        self.corrupt.extend(frames);
        self
    }

    pub fn stream_info(&self) -> StreamInfo {
        let duration = frame_to_pts(self.frames, self.frame_rate, self.time_base);
        let duration_us = frame_to_pts(self.frames, self.frame_rate, Rational::new(1, 1_000_000));
        StreamInfo {
            codec: Some(self.codec),
            codec_name: self.codec.name().to_string(),
            width: self.width,
            height: self.height,
            format: Some(PixelFormat::Yuv420p),
            frame_rate: self.frame_rate,
            time_base: self.time_base,
            start_pts: Some(0),
            frame_count: (self.count_hint == FrameCountHint::Stored).then_some(self.frames),
            duration: (self.count_hint == FrameCountHint::StreamDuration).then_some(duration),
            container_duration_us: (self.count_hint == FrameCountHint::ContainerDuration)
                .then_some(duration_us),
            color: ColorMetadata::BT709_LIMITED,
            extradata: Vec::new(),
        }
    }

    /// Checksum of frame `index` as a decoder would deliver it in YUV 4:2:0.
    pub fn frame_checksum(&self, index: u64) -> CutlineResult<u64> {
        let pool = FramePool::new(1);
        render_pattern(index, self.width, self.height, PixelFormat::Yuv420p, &pool)
            .map(|buffer| buffer.checksum())
    }
}

/// Shared counters of a [`SyntheticSource`], readable after the source has
/// been moved into a decoder.
#[derive(Debug, Clone, Default)]
pub struct SourceProbe {
    seeks: Arc<AtomicU64>,
    packets: Arc<AtomicU64>,
    seek_targets: Arc<Mutex<Vec<u64>>>,
}

impl SourceProbe {
    pub fn seeks(&self) -> u64 {
        self.seeks.load(Ordering::SeqCst)
    }

    pub fn packets_read(&self) -> u64 {
        self.packets.load(Ordering::SeqCst)
    }

    pub fn seek_targets(&self) -> Vec<u64> {
        self.seek_targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Container with one packet per frame, in presentation order.
pub struct SyntheticSource {
    clip: SyntheticClip,
    info: StreamInfo,
    position: u64,
    probe: SourceProbe,
}

impl SyntheticSource {
    pub fn new(clip: SyntheticClip) -> Self {
        Self::with_probe(clip, SourceProbe::default())
    }

    pub fn with_probe(clip: SyntheticClip, probe: SourceProbe) -> Self {
        let info = clip.stream_info();
        Self {
            clip,
            info,
            position: 0,
            probe,
        }
    }

    pub fn probe(&self) -> SourceProbe {
        self.probe.clone()
    }
}

impl PacketSource for SyntheticSource {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_packet(&mut self) -> CutlineResult<Option<Packet>> {
        if self.position >= self.clip.frames {
            return Ok(None);
        }
        let index = self.position;
        self.position += 1;
        self.probe.packets.fetch_add(1, Ordering::SeqCst);

        let data = if self.clip.corrupt.contains(&index) {
            vec![0xde, 0xad]
        } else {
            index.to_le_bytes().to_vec()
        };
        let pts = (self.clip.timestamps == TimestampMode::Full)
            .then(|| frame_to_pts(index, self.clip.frame_rate, self.clip.time_base));
        Ok(Some(Packet {
            data,
            pts,
            dts: pts,
            duration: frame_to_pts(1, self.clip.frame_rate, self.clip.time_base),
            keyframe: index % self.clip.gop == 0,
            time_base: self.clip.time_base,
        }))
    }

    fn seek_keyframe(&mut self, frame_index: u64) -> CutlineResult<Option<u64>> {
        self.probe.seeks.fetch_add(1, Ordering::SeqCst);
        self.probe
            .seek_targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(frame_index);
        let last = self.clip.frames.saturating_sub(1);
        self.position = frame_index.min(last) / self.clip.gop * self.clip.gop;
        Ok((self.clip.timestamps != TimestampMode::Missing).then_some(self.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeks_land_on_keyframes() {
        let clip = SyntheticClip::new(100, 16, 16, Rational::new(25, 1)).with_gop(10);
        let mut source = SyntheticSource::new(clip);
        assert_eq!(source.seek_keyframe(37).unwrap(), Some(30));
        let packet = source.read_packet().unwrap().unwrap();
        assert!(packet.keyframe);
        assert_eq!(packet.data, 30u64.to_le_bytes().to_vec());
        assert_eq!(source.probe().seeks(), 1);
        assert_eq!(source.probe().seek_targets(), vec![37]);

        assert_eq!(source.seek_keyframe(1000).unwrap(), Some(90));
        let packet = source.read_packet().unwrap().unwrap();
        assert_eq!(packet.data, 90u64.to_le_bytes().to_vec());
    }

    #[test]
    fn planar_and_semi_planar_patterns_agree() {
        let pool = FramePool::new(2);
        let planar = render_pattern(5, 7, 5, PixelFormat::Yuv420p, &pool).unwrap();
        let semi = render_pattern(5, 7, 5, PixelFormat::Nv12, &pool).unwrap();
        assert_eq!(planar.row(0, 3), semi.row(0, 3));
        assert_eq!(planar.row(1, 2)[3], semi.row(1, 2)[6]);
        assert_eq!(planar.row(2, 2)[3], semi.row(1, 2)[7]);
    }

    #[test]
    fn frames_have_distinct_checksums() {
        let clip = SyntheticClip::new(10, 32, 18, Rational::new(30, 1));
        assert_ne!(clip.frame_checksum(0).unwrap(), clip.frame_checksum(1).unwrap());
        assert_eq!(clip.frame_checksum(3).unwrap(), clip.frame_checksum(3).unwrap());
    }
}
