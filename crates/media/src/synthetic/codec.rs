use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::synthetic::LifecycleLog;
use cutline_hwaccel::{HardwareBackend, PixelFormat, Residency};

use super::source::render_pattern;
use crate::codec::{
    CodecLifecycle, CodecStatus, EncoderSettings, FrameDecoder, FrameEncoder, Packet,
    StreamInfo, StreamParameters,
};
use crate::frame::{DeviceSurface, Frame, FramePayload, GpuSurface};
use crate::pool::{FramePool, PooledBuffer};

/// Pixels of a [`SyntheticSurface`].
#[derive(Debug)]
pub enum SurfaceContent {
    /// Test pattern frame, rendered on download.
    Pattern(u64),
    /// An uploaded NV12 buffer.
    Uploaded(Arc<PooledBuffer>),
}

/// Stand-in for a device surface.
#[derive(Debug)]
pub struct SyntheticSurface {
    pub backend: HardwareBackend,
    pub width: u32,
    pub height: u32,
    pub content: SurfaceContent,
}

impl SyntheticSurface {
    /// Copy the surface into an NV12 pool buffer.
    pub fn download(&self, pool: &FramePool) -> CutlineResult<PooledBuffer> {
        match &self.content {
            SurfaceContent::Pattern(index) => {
                render_pattern(*index, self.width, self.height, PixelFormat::Nv12, pool)
            }
            SurfaceContent::Uploaded(source) => {
                let mut copy = pool.acquire(self.width, self.height, PixelFormat::Nv12)?;
                for plane in 0..copy.plane_count() {
                    copy.copy_plane_from(plane, source.plane(plane), source.stride(plane));
                }
                Ok(copy)
            }
        }
    }

    pub fn checksum(&self) -> CutlineResult<u64> {
        let pool = FramePool::new(1);
        self.download(&pool).map(|buffer| buffer.checksum())
    }
}

impl DeviceSurface for SyntheticSurface {
    fn backend(&self) -> HardwareBackend {
        self.backend
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn surface_of(frame: &Frame) -> CutlineResult<&SyntheticSurface> {
    frame
        .surface()
        .and_then(GpuSurface::downcast::<SyntheticSurface>)
        .ok_or_else(|| CutlineError::unsupported("frame is not a synthetic device surface"))
}

fn record(log: &Option<LifecycleLog>, event: &str) {
    if let Some(log) = log {
        log.record(event);
    }
}

/// Decoder for [`super::SyntheticSource`] packets.
///
/// Holds `latency` frames back before producing output, like a codec with
/// reorder delay, and refuses input once `capacity` packets are queued.
pub struct SyntheticDecoder {
    name: String,
    width: u32,
    height: u32,
    color: crate::frame::ColorMetadata,
    backend: HardwareBackend,
    pool: FramePool,
    queue: VecDeque<(u64, Option<i64>)>,
    latency: usize,
    capacity: usize,
    flushing: bool,
    released: bool,
    log: Option<LifecycleLog>,
}

impl SyntheticDecoder {
    pub fn new(info: &StreamInfo, backend: HardwareBackend, pool: &FramePool) -> Self {
        let name = if backend.is_hardware() {
            format!("synthetic_{backend}")
        } else {
            "synthetic".to_string()
        };
        Self {
            name,
            width: info.width,
            height: info.height,
            color: info.color,
            backend,
            pool: pool.clone(),
            queue: VecDeque::new(),
            latency: 2,
            capacity: 4,
            flushing: false,
            released: false,
            log: None,
        }
    }

    pub fn with_latency(mut self, latency: usize) -> Self {
        self.latency = latency;
        self.capacity = latency + 2;
        self
    }

    pub fn with_log(mut self, log: LifecycleLog) -> Self {
        self.log = Some(log);
        self
    }

    fn produce(&self, index: u64, pts: Option<i64>) -> CutlineResult<Frame> {
        if self.backend.is_hardware() {
            let surface = GpuSurface::new(SyntheticSurface {
                backend: self.backend,
                width: self.width,
                height: self.height,
                content: SurfaceContent::Pattern(index),
            });
            Ok(Frame::gpu(surface, self.width, self.height, pts, self.color))
        } else {
            let buffer =
                render_pattern(index, self.width, self.height, PixelFormat::Yuv420p, &self.pool)?;
            Ok(Frame::cpu(buffer, pts, self.color))
        }
    }
}

impl CodecLifecycle for SyntheticDecoder {
    fn is_hardware(&self) -> bool {
        self.backend.is_hardware()
    }

    fn stop(&mut self) {
        record(&self.log, "decoder.stop");
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.queue.clear();
        record(&self.log, "decoder.release");
    }
}

impl FrameDecoder for SyntheticDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_packet(&mut self, packet: Option<&Packet>) -> CutlineResult<CodecStatus<()>> {
        if self.flushing {
            return Ok(CodecStatus::EndOfStream);
        }
        let Some(packet) = packet else {
            self.flushing = true;
            return Ok(CodecStatus::Ready(()));
        };
        if self.queue.len() >= self.capacity {
            return Ok(CodecStatus::Again);
        }
        let bytes: [u8; 8] = packet
            .data
            .as_slice()
            .try_into()
            .map_err(|_| CutlineError::decode("corrupt synthetic packet"))?;
        self.queue.push_back((u64::from_le_bytes(bytes), packet.pts));
        Ok(CodecStatus::Ready(()))
    }

    fn receive_frame(&mut self) -> CutlineResult<CodecStatus<Frame>> {
        if self.queue.len() > self.latency || (self.flushing && !self.queue.is_empty()) {
            if let Some((index, pts)) = self.queue.pop_front() {
                return self.produce(index, pts).map(CodecStatus::Ready);
            }
        }
        if self.flushing {
            return Ok(CodecStatus::EndOfStream);
        }
        Ok(CodecStatus::Again)
    }

    fn flush(&mut self) {
        self.queue.clear();
        self.flushing = false;
    }

    fn download(&mut self, frame: &Frame, pool: &FramePool) -> CutlineResult<Frame> {
        let buffer = surface_of(frame)?.download(pool)?;
        Ok(Frame::cpu(buffer, frame.pts, frame.color))
    }
}

impl Drop for SyntheticDecoder {
    fn drop(&mut self) {
        self.release();
    }
}

/// Scripted behaviour of a [`SyntheticEncoder`].
#[derive(Debug, Clone)]
pub struct EncoderScript {
    /// Frames the session holds before refusing input.
    pub queue_capacity: usize,
    /// Whether `queue_capacity` is reported to the caller.
    pub report_capacity: bool,
    /// Frames held back before packets come out.
    pub latency: usize,
    /// Refuse every n-th send attempt with "try again".
    pub again_every: Option<u64>,
    /// Never report end of stream after a flush, like a wedged device.
    pub stall_after_eos: bool,
    /// Reject the end-of-stream signal, like a session that lost its device.
    pub fail_eos: bool,
}

impl Default for EncoderScript {
    fn default() -> Self {
        Self {
            queue_capacity: 8,
            report_capacity: true,
            latency: 2,
            again_every: None,
            stall_after_eos: false,
            fail_eos: false,
        }
    }
}

/// Encoder whose packets carry the checksum of each input frame.
pub struct SyntheticEncoder {
    name: String,
    settings: EncoderSettings,
    backend: HardwareBackend,
    script: EncoderScript,
    queue: VecDeque<Packet>,
    attempts: u64,
    eos: bool,
    released: bool,
    log: Option<LifecycleLog>,
}

impl SyntheticEncoder {
    pub fn new(settings: &EncoderSettings, backend: HardwareBackend, script: EncoderScript) -> Self {
        let name = if backend.is_hardware() {
            format!("synthetic_{}_{backend}", settings.codec)
        } else {
            format!("synthetic_{}", settings.codec)
        };
        Self {
            name,
            settings: settings.clone(),
            backend,
            script,
            queue: VecDeque::new(),
            attempts: 0,
            eos: false,
            released: false,
            log: None,
        }
    }

    pub fn with_log(mut self, log: LifecycleLog) -> Self {
        self.log = Some(log);
        self
    }

    fn content_checksum(&self, frame: &Frame) -> CutlineResult<u64> {
        if frame.width != self.settings.width || frame.height != self.settings.height {
            return Err(CutlineError::encode(format!(
                "frame is {}x{}, session expects {}x{}",
                frame.width, frame.height, self.settings.width, self.settings.height
            )));
        }
        match frame.residency() {
            Residency::Gpu(owner) if self.backend.is_hardware() && owner == self.backend => {
                surface_of(frame)?.checksum()
            }
            Residency::Cpu if !self.backend.is_hardware() => {
                if frame.format != self.settings.input_format {
                    return Err(CutlineError::encode(format!(
                        "frame is {}, session expects {}",
                        frame.format, self.settings.input_format
                    )));
                }
                frame.checksum()
            }
            other => Err(CutlineError::encode(format!(
                "{} session cannot take a {other:?} frame",
                self.name
            ))),
        }
    }
}

impl CodecLifecycle for SyntheticEncoder {
    fn is_hardware(&self) -> bool {
        self.backend.is_hardware()
    }

    fn stop(&mut self) {
        record(&self.log, "encoder.stop");
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.queue.clear();
        record(&self.log, "encoder.release");
    }
}

impl FrameEncoder for SyntheticEncoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn send_frame(&mut self, frame: Option<&Frame>) -> CutlineResult<CodecStatus<()>> {
        if self.eos {
            return Ok(CodecStatus::EndOfStream);
        }
        let Some(frame) = frame else {
            if self.script.fail_eos {
                return Err(CutlineError::encode("synthetic device lost during flush"));
            }
            self.eos = true;
            return Ok(CodecStatus::Ready(()));
        };

        self.attempts += 1;
        if let Some(n) = self.script.again_every {
            if n > 0 && self.attempts % n == 0 {
                return Ok(CodecStatus::Again);
            }
        }
        if self.queue.len() >= self.script.queue_capacity {
            return Ok(CodecStatus::Again);
        }

        let checksum = self.content_checksum(frame)?;
        let pts = frame
            .pts
            .ok_or_else(|| CutlineError::encode("frame has no presentation time"))?;
        let gop = i64::from(self.settings.gop_size.max(1));
        self.queue.push_back(Packet {
            data: checksum.to_le_bytes().to_vec(),
            pts: Some(pts),
            dts: Some(pts),
            duration: 1,
            keyframe: pts % gop == 0,
            time_base: self.settings.time_base,
        });
        Ok(CodecStatus::Ready(()))
    }

    fn receive_packet(&mut self) -> CutlineResult<CodecStatus<Packet>> {
        if self.eos && self.script.stall_after_eos {
            return Ok(CodecStatus::Again);
        }
        if self.queue.len() > self.script.latency || (self.eos && !self.queue.is_empty()) {
            if let Some(packet) = self.queue.pop_front() {
                return Ok(CodecStatus::Ready(packet));
            }
        }
        if self.eos {
            return Ok(CodecStatus::EndOfStream);
        }
        Ok(CodecStatus::Again)
    }

    fn upload(&mut self, frame: &Frame) -> CutlineResult<Frame> {
        if !self.backend.is_hardware() {
            return Err(CutlineError::unsupported("upload on a software session"));
        }
        let FramePayload::Cpu(buffer) = frame.payload() else {
            return Err(CutlineError::unsupported("frame is already device-resident"));
        };
        if frame.format != PixelFormat::Nv12 {
            return Err(CutlineError::encode(format!(
                "uploads expect nv12, got {}",
                frame.format
            )));
        }
        let surface = GpuSurface::new(SyntheticSurface {
            backend: self.backend,
            width: frame.width,
            height: frame.height,
            content: SurfaceContent::Uploaded(buffer.clone()),
        });
        Ok(Frame::gpu(surface, frame.width, frame.height, frame.pts, frame.color))
    }

    fn queue_capacity(&self) -> Option<u32> {
        self.script
            .report_capacity
            .then(|| u32::try_from(self.script.queue_capacity).unwrap_or(u32::MAX))
    }

    fn stream_parameters(&self) -> StreamParameters {
        StreamParameters {
            codec: self.settings.codec,
            width: self.settings.width,
            height: self.settings.height,
            frame_rate: self.settings.frame_rate,
            time_base: self.settings.time_base,
            bitrate: None,
            color: self.settings.color,
            extradata: b"synthetic".to_vec(),
        }
    }
}

impl Drop for SyntheticEncoder {
    fn drop(&mut self) {
        self.release();
    }
}
