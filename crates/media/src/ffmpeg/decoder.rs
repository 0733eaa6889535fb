//! libavcodec decoding sessions.

use std::ffi::{c_int, c_void};
use std::ptr;

use ffmpeg_sys_next as ffi;

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::ffmpeg::sys::to_cstring;
use cutline_hwaccel::ffmpeg::FfmpegDevice;
use cutline_hwaccel::{decode_strategy, DecodeStrategy, HardwareBackend, HardwareContext, Residency};

use super::context::{codec_status, CodecContext, PacketBuffer};
use super::frames::{copy_to_pool, transfer_from_device, FfmpegSurface, OwnedFrame};
use super::mapping::{to_av_pixel_format, to_av_rational};
use super::scale::Scaler;
use crate::codec::{CodecLifecycle, CodecStatus, FallbackReason, FrameDecoder, Packet, StreamInfo};
use crate::frame::Frame;
use crate::pool::FramePool;
use crate::rational::Rational;

/// Picks the device format from libavcodec's offer, or the first software
/// format when the device format is not offered.
unsafe extern "C" fn pick_device_format(
    ctx: *mut ffi::AVCodecContext,
    offered: *const ffi::AVPixelFormat,
) -> ffi::AVPixelFormat {
    let wanted = (*ctx).opaque as isize as c_int;
    let mut cursor = offered;
    while *cursor != ffi::AVPixelFormat::AV_PIX_FMT_NONE {
        if *cursor as c_int == wanted {
            return *cursor;
        }
        cursor = cursor.add(1);
    }
    tracing::warn!("Device surface format not offered; decoding to system memory");
    *offered
}

fn find_decoder(info: &StreamInfo) -> CutlineResult<*const ffi::AVCodec> {
    let name = to_cstring(&info.codec_name)?;
    // SAFETY: name is NUL-terminated; descriptors are static.
    let codec = unsafe {
        let descriptor = ffi::avcodec_descriptor_get_by_name(name.as_ptr());
        if descriptor.is_null() {
            ptr::null()
        } else {
            ffi::avcodec_find_decoder((*descriptor).id)
        }
    };
    if codec.is_null() {
        return Err(CutlineError::unsupported(format!(
            "no decoder for {}",
            info.codec_name
        )));
    }
    Ok(codec)
}

/// A software or device-backed decoder.
pub struct FfmpegDecoder {
    ctx: CodecContext,
    backend: HardwareBackend,
    packet: PacketBuffer,
    scratch: OwnedFrame,
    scaler: Scaler,
    pool: FramePool,
    time_base: Rational,
    stopped: bool,
}

impl FfmpegDecoder {
    fn configure(
        codec: *const ffi::AVCodec,
        info: &StreamInfo,
        threads: u32,
        pool: &FramePool,
    ) -> CutlineResult<Self> {
        let mut ctx = CodecContext::alloc(codec)?;
        // SAFETY: freshly allocated, not yet opened.
        unsafe {
            let raw = &mut *ctx.as_ptr();
            raw.width = info.width as c_int;
            raw.height = info.height as c_int;
            raw.pkt_timebase = to_av_rational(info.time_base);
            raw.thread_count = threads as c_int;
        }
        ctx.set_extradata(&info.extradata)?;
        Ok(Self {
            ctx,
            backend: HardwareBackend::None,
            packet: PacketBuffer::alloc()?,
            scratch: OwnedFrame::alloc()?,
            scaler: Scaler::default(),
            pool: pool.clone(),
            time_base: info.time_base,
            stopped: false,
        })
    }

    pub fn open_software(info: &StreamInfo, pool: &FramePool, threads: u32) -> CutlineResult<Self> {
        let codec = find_decoder(info)?;
        let mut decoder = Self::configure(codec, info, threads, pool)?;
        decoder
            .ctx
            .open(codec)
            .map_err(|reason| CutlineError::decode(reason.to_string()))?;
        tracing::debug!(decoder = decoder.ctx.name(), "Software decoder opened");
        Ok(decoder)
    }

    pub fn open_hardware(
        info: &StreamInfo,
        context: &HardwareContext,
        pool: &FramePool,
        threads: u32,
    ) -> Result<Self, FallbackReason> {
        let backend = context.backend();
        let unsupported = || FallbackReason::UnsupportedCodec {
            backend,
            codec: info.codec_name.clone(),
            role: "decode",
        };
        let family = info.codec.ok_or_else(unsupported)?;
        let open_failed = |name: &str, message: String| FallbackReason::OpenFailed {
            name: name.to_string(),
            message,
        };

        let codec = match decode_strategy(family, backend) {
            DecodeStrategy::Dedicated(name) => {
                let c_name = to_cstring(name).map_err(|e| open_failed(name, e.to_string()))?;
                // SAFETY: c_name is NUL-terminated.
                let codec = unsafe { ffi::avcodec_find_decoder_by_name(c_name.as_ptr()) };
                if codec.is_null() {
                    return Err(open_failed(name, "not compiled into libavcodec".into()));
                }
                codec
            }
            DecodeStrategy::AttachContext => {
                find_decoder(info).map_err(|e| open_failed(&info.codec_name, e.to_string()))?
            }
            DecodeStrategy::Unsupported => return Err(unsupported()),
        };

        let device = context.downcast::<FfmpegDevice>().ok_or_else(|| {
            open_failed(&info.codec_name, "device was not opened by libavutil".into())
        })?;
        let device_format = backend
            .device_format()
            .map(to_av_pixel_format)
            .ok_or_else(unsupported)?;

        let mut decoder = Self::configure(codec, info, threads, pool)
            .map_err(|e| open_failed(&info.codec_name, e.to_string()))?;
        decoder.backend = backend;
        let device_ref = device
            .new_ref()
            .map_err(|e| open_failed(decoder.ctx.name(), e.to_string()))?;
        // SAFETY: the context is not open yet; it takes ownership of the
        // device reference and frees it with itself.
        unsafe {
            let raw = &mut *decoder.ctx.as_ptr();
            raw.hw_device_ctx = device_ref;
            raw.opaque = device_format as c_int as isize as *mut c_void;
            raw.get_format = Some(pick_device_format);
        }
        decoder.ctx.open(codec)?;
        tracing::debug!(decoder = decoder.ctx.name(), %backend, "Hardware decoder opened");
        Ok(decoder)
    }

    /// CPU copy of a system-memory frame in a pooled buffer.
    fn to_cpu(&mut self, native: &OwnedFrame, pts: Option<i64>) -> CutlineResult<Frame> {
        let buffer = match native.format().filter(|f| f.device_backend().is_none()) {
            Some(format) => copy_to_pool(native, format, &self.pool)?,
            None => self
                .scaler
                .scale_frame(native, cutline_hwaccel::PixelFormat::Yuv420p, &self.pool)?,
        };
        Ok(Frame::cpu(buffer, pts, native.color()))
    }
}

impl CodecLifecycle for FfmpegDecoder {
    fn is_hardware(&self) -> bool {
        self.backend.is_hardware()
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.ctx.close();
            self.stopped = true;
        }
    }

    fn release(&mut self) {
        self.scratch.unref();
        self.ctx.free();
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn name(&self) -> &str {
        self.ctx.name()
    }

    fn send_packet(&mut self, packet: Option<&Packet>) -> CutlineResult<CodecStatus<()>> {
        if !self.ctx.is_open() || self.stopped {
            return Err(CutlineError::decode("decoder already released"));
        }
        let raw = match packet {
            Some(packet) => {
                self.packet.fill(packet, self.time_base)?;
                self.packet.as_ptr() as *const ffi::AVPacket
            }
            None => ptr::null(),
        };
        // SAFETY: the context is open; raw is null or a filled packet.
        let ret = unsafe { ffi::avcodec_send_packet(self.ctx.as_ptr(), raw) };
        self.packet.unref();
        codec_status(ret, "avcodec_send_packet").map_err(|e| e.into_decode())
    }

    fn receive_frame(&mut self) -> CutlineResult<CodecStatus<Frame>> {
        if !self.ctx.is_open() || self.stopped {
            return Ok(CodecStatus::EndOfStream);
        }
        // SAFETY: the context is open and scratch is a valid frame.
        let ret = unsafe { ffi::avcodec_receive_frame(self.ctx.as_ptr(), self.scratch.as_mut_ptr()) };
        match codec_status(ret, "avcodec_receive_frame").map_err(|e| e.into_decode())? {
            CodecStatus::Again => return Ok(CodecStatus::Again),
            CodecStatus::EndOfStream => return Ok(CodecStatus::EndOfStream),
            CodecStatus::Ready(()) => {}
        }

        let pts = self.scratch.best_pts();
        let frame = match self.scratch.residency(self.backend) {
            Residency::Gpu(backend) => {
                let owned = self.scratch.try_clone();
                self.scratch.unref();
                FfmpegSurface::new(backend, owned?).into_frame(pts)
            }
            Residency::Cpu => {
                let native = self.scratch.try_clone();
                self.scratch.unref();
                self.to_cpu(&native?, pts)?
            }
        };
        Ok(CodecStatus::Ready(frame))
    }

    fn flush(&mut self) {
        if self.ctx.is_open() && !self.stopped {
            // SAFETY: the context is open.
            unsafe { ffi::avcodec_flush_buffers(self.ctx.as_ptr()) };
        }
    }

    fn download(&mut self, frame: &Frame, pool: &FramePool) -> CutlineResult<Frame> {
        if !frame.is_resident() {
            return Ok(frame.clone());
        }
        let surface = frame
            .surface()
            .and_then(|s| s.downcast::<FfmpegSurface>())
            .ok_or_else(|| CutlineError::hardware("frame was not decoded by libavcodec"))?;
        let native = transfer_from_device(surface.frame())?;
        let buffer = match native.format() {
            Some(format) => copy_to_pool(&native, format, pool)?,
            None => self
                .scaler
                .scale_frame(&native, cutline_hwaccel::PixelFormat::Nv12, pool)?,
        };
        Ok(Frame::cpu(buffer, frame.pts, frame.color))
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        self.release();
    }
}
