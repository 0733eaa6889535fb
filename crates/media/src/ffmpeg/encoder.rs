//! libavcodec encoding sessions.

use std::ffi::c_int;
use std::ptr;

use ffmpeg_sys_next as ffi;

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::ffmpeg::sys::{check_ffmpeg, to_cstring};
use cutline_hwaccel::ffmpeg::{FfmpegDevice, HW_FRAME_POOL_SIZE};
use cutline_hwaccel::{encoder_name, HardwareBackend, HardwareContext, PixelFormat};

use super::context::{codec_status, CodecContext, PacketBuffer};
use super::frames::{borrow_buffer, FfmpegSurface, OwnedFrame};
use super::mapping::{
    av_color_range, av_color_space, av_color_transfer, from_av_rational, to_av_codec_id,
    to_av_pixel_format, to_av_rational,
};
use crate::codec::{
    CodecLifecycle, CodecStatus, EncoderSettings, FallbackReason, FrameEncoder, Packet,
    RateControl, StreamParameters,
};
use crate::frame::{Frame, FramePayload};

fn find_encoder(name: &str) -> CutlineResult<*const ffi::AVCodec> {
    let c_name = to_cstring(name)?;
    // SAFETY: c_name is NUL-terminated.
    let codec = unsafe { ffi::avcodec_find_encoder_by_name(c_name.as_ptr()) };
    if codec.is_null() {
        return Err(CutlineError::unsupported(format!(
            "encoder {name} is not compiled into libavcodec"
        )));
    }
    Ok(codec)
}

/// A software or device-backed encoder.
pub struct FfmpegEncoder {
    ctx: CodecContext,
    backend: HardwareBackend,
    frames_ctx: *mut ffi::AVBufferRef,
    packet: PacketBuffer,
    settings: EncoderSettings,
    extradata: Vec<u8>,
    stopped: bool,
}

// SAFETY: the frames context reference is owned by this session only.
unsafe impl Send for FfmpegEncoder {}

impl FfmpegEncoder {
    fn configure(
        codec: *const ffi::AVCodec,
        settings: &EncoderSettings,
        pixel_format: PixelFormat,
    ) -> CutlineResult<Self> {
        let mut ctx = CodecContext::alloc(codec)?;
        // SAFETY: freshly allocated, not yet opened.
        unsafe {
            let raw = &mut *ctx.as_ptr();
            raw.width = settings.width as c_int;
            raw.height = settings.height as c_int;
            raw.time_base = to_av_rational(settings.time_base);
            raw.framerate = to_av_rational(settings.frame_rate);
            raw.pix_fmt = to_av_pixel_format(pixel_format);
            raw.gop_size = settings.gop_size as c_int;
            raw.thread_count = settings.threads as c_int;
            raw.color_range = av_color_range(&settings.color);
            raw.colorspace = av_color_space(&settings.color);
            raw.color_trc = av_color_transfer(&settings.color);
            if let Some(b_frames) = settings.max_b_frames {
                raw.max_b_frames = b_frames as c_int;
            }
            if let RateControl::BitrateKbps(kbps) = settings.rate {
                raw.bit_rate = i64::from(kbps) * 1000;
            }
            if settings.global_header {
                raw.flags |= ffi::AV_CODEC_FLAG_GLOBAL_HEADER as c_int;
            }
        }
        for (key, value) in &settings.options {
            if let Err(e) = ctx.set_option(key, value) {
                tracing::debug!(encoder = ctx.name(), key, value, error = %e, "Encoder option ignored");
            }
        }
        Ok(Self {
            ctx,
            backend: HardwareBackend::None,
            frames_ctx: ptr::null_mut(),
            packet: PacketBuffer::alloc()?,
            settings: settings.clone(),
            extradata: Vec::new(),
            stopped: false,
        })
    }

    pub fn open_software(settings: &EncoderSettings) -> CutlineResult<Self> {
        let name = settings.codec.software_encoder_name();
        let codec = find_encoder(name).or_else(|_| {
            // SAFETY: lookup by id has no preconditions.
            let codec = unsafe { ffi::avcodec_find_encoder(to_av_codec_id(settings.codec)) };
            if codec.is_null() {
                Err(CutlineError::unsupported(format!(
                    "no software encoder for {}",
                    settings.codec
                )))
            } else {
                Ok(codec)
            }
        })?;
        let mut encoder = Self::configure(codec, settings, settings.input_format)?;
        encoder
            .ctx
            .open(codec)
            .map_err(|reason| CutlineError::encode(reason.to_string()))?;
        encoder.extradata = encoder.ctx.extradata();
        tracing::debug!(encoder = encoder.ctx.name(), "Software encoder opened");
        Ok(encoder)
    }

    pub fn open_hardware(
        settings: &EncoderSettings,
        context: &HardwareContext,
    ) -> Result<Self, FallbackReason> {
        let backend = context.backend();
        let name = encoder_name(settings.codec, backend).ok_or_else(|| {
            FallbackReason::UnsupportedCodec {
                backend,
                codec: settings.codec.name().to_string(),
                role: "encode",
            }
        })?;
        let open_failed = |message: String| FallbackReason::OpenFailed {
            name: name.to_string(),
            message,
        };
        let codec = find_encoder(name).map_err(|e| open_failed(e.to_string()))?;
        let device = context
            .downcast::<FfmpegDevice>()
            .ok_or_else(|| open_failed("device was not opened by libavutil".into()))?;
        let device_format = backend
            .device_format()
            .ok_or_else(|| open_failed(format!("{backend} has no device format")))?;

        let mut encoder = Self::configure(codec, settings, device_format)
            .map_err(|e| open_failed(e.to_string()))?;
        encoder.backend = backend;
        encoder.frames_ctx = frames_context(device, settings, device_format)?;

        // SAFETY: the context is not open; it owns the new reference.
        unsafe {
            let frames_ref = ffi::av_buffer_ref(encoder.frames_ctx);
            if frames_ref.is_null() {
                return Err(FallbackReason::FramePool("av_buffer_ref failed".into()));
            }
            (*encoder.ctx.as_ptr()).hw_frames_ctx = frames_ref;
        }
        encoder.ctx.open(codec)?;
        encoder.extradata = encoder.ctx.extradata();
        tracing::debug!(encoder = name, %backend, "Hardware encoder opened");
        Ok(encoder)
    }
}

/// The libav frame handed to `avcodec_send_frame` for `frame`.
fn native_input(frame: &Frame) -> CutlineResult<OwnedFrame> {
    match frame.payload() {
        FramePayload::Gpu(surface) => {
            let surface = surface.downcast::<FfmpegSurface>().ok_or_else(|| {
                CutlineError::hardware("device frame was not produced by libavcodec")
            })?;
            let mut native = surface.frame().try_clone()?;
            native.set_pts(frame.pts);
            Ok(native)
        }
        FramePayload::Cpu(buffer) => borrow_buffer(buffer, frame.pts, &frame.color),
    }
}

/// Allocate and initialize the device frame pool encoders draw from.
fn frames_context(
    device: &FfmpegDevice,
    settings: &EncoderSettings,
    device_format: PixelFormat,
) -> Result<*mut ffi::AVBufferRef, FallbackReason> {
    // SAFETY: the device reference is valid; the frames context fields are
    // written before av_hwframe_ctx_init and the reference is unreffed on
    // failure.
    unsafe {
        let mut frames = ffi::av_hwframe_ctx_alloc(device.as_ptr());
        if frames.is_null() {
            return Err(FallbackReason::FramePool("av_hwframe_ctx_alloc failed".into()));
        }
        let fc = &mut *((*frames).data as *mut ffi::AVHWFramesContext);
        fc.format = to_av_pixel_format(device_format);
        fc.sw_format = to_av_pixel_format(settings.input_format);
        fc.width = settings.width as c_int;
        fc.height = settings.height as c_int;
        fc.initial_pool_size = HW_FRAME_POOL_SIZE;
        let ret = ffi::av_hwframe_ctx_init(frames);
        if let Err(e) = check_ffmpeg(ret, "av_hwframe_ctx_init") {
            ffi::av_buffer_unref(&mut frames);
            return Err(FallbackReason::FramePool(e.to_string()));
        }
        Ok(frames)
    }
}

impl CodecLifecycle for FfmpegEncoder {
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
        self.ctx.free();
        if !self.frames_ctx.is_null() {
            // SAFETY: our own reference, unreffed once (the call nulls it).
            unsafe { ffi::av_buffer_unref(&mut self.frames_ctx) };
        }
    }
}

impl FrameEncoder for FfmpegEncoder {
    fn name(&self) -> &str {
        self.ctx.name()
    }

    fn send_frame(&mut self, frame: Option<&Frame>) -> CutlineResult<CodecStatus<()>> {
        if !self.ctx.is_open() || self.stopped {
            return Err(CutlineError::encode("encoder already released"));
        }
        let native = frame.map(native_input).transpose()?;
        let raw = native.as_ref().map_or(ptr::null(), OwnedFrame::as_ptr);
        // SAFETY: the context is open; raw is null or a valid frame that
        // outlives the call.
        let ret = unsafe { ffi::avcodec_send_frame(self.ctx.as_ptr(), raw) };
        codec_status(ret, "avcodec_send_frame").map_err(|e| e.into_encode())
    }

    fn receive_packet(&mut self) -> CutlineResult<CodecStatus<Packet>> {
        if !self.ctx.is_open() || self.stopped {
            return Ok(CodecStatus::EndOfStream);
        }
        // SAFETY: the context is open and the packet buffer is valid.
        let ret = unsafe { ffi::avcodec_receive_packet(self.ctx.as_ptr(), self.packet.as_ptr()) };
        match codec_status(ret, "avcodec_receive_packet").map_err(|e| e.into_encode())? {
            CodecStatus::Ready(()) => {
                // SAFETY: the context is open.
                let time_base = from_av_rational(unsafe { (*self.ctx.as_ptr()).time_base });
                Ok(CodecStatus::Ready(self.packet.take(time_base)))
            }
            CodecStatus::Again => Ok(CodecStatus::Again),
            CodecStatus::EndOfStream => Ok(CodecStatus::EndOfStream),
        }
    }

    fn upload(&mut self, frame: &Frame) -> CutlineResult<Frame> {
        if self.frames_ctx.is_null() {
            return Err(CutlineError::unsupported("upload on a software encoder"));
        }
        let buffer = frame
            .cpu_buffer()
            .filter(|b| b.format() == self.settings.input_format)
            .ok_or_else(|| {
                CutlineError::encode(format!(
                    "upload needs a {} CPU frame, got {}",
                    self.settings.input_format, frame.format
                ))
            })?;
        let source = borrow_buffer(buffer, frame.pts, &frame.color)?;
        let mut device = OwnedFrame::alloc()?;
        // SAFETY: frames_ctx is initialized; both frames are valid.
        unsafe {
            let ret = ffi::av_hwframe_get_buffer(self.frames_ctx, device.as_mut_ptr(), 0);
            check_ffmpeg(ret, "av_hwframe_get_buffer").map_err(|e| e.into_hardware())?;
            let ret = ffi::av_hwframe_transfer_data(device.as_mut_ptr(), source.as_ptr(), 0);
            check_ffmpeg(ret, "av_hwframe_transfer_data").map_err(|e| e.into_hardware())?;
        }
        device.set_pts(frame.pts);
        device.set_color(&frame.color);
        Ok(FfmpegSurface::new(self.backend, device).into_frame(frame.pts))
    }

    fn queue_capacity(&self) -> Option<u32> {
        if self.backend != HardwareBackend::Cuda || !self.ctx.is_open() {
            return None;
        }
        let key = to_cstring("surfaces").ok()?;
        let mut surfaces: i64 = 0;
        // SAFETY: priv_data belongs to an open nvenc context.
        let ret = unsafe {
            ffi::av_opt_get_int(
                (*self.ctx.as_ptr()).priv_data,
                key.as_ptr(),
                0,
                &mut surfaces,
            )
        };
        (ret >= 0 && surfaces > 0).then_some(surfaces as u32)
    }

    fn stream_parameters(&self) -> StreamParameters {
        StreamParameters {
            codec: self.settings.codec,
            width: self.settings.width,
            height: self.settings.height,
            frame_rate: self.settings.frame_rate,
            time_base: self.settings.time_base,
            bitrate: match self.settings.rate {
                RateControl::BitrateKbps(kbps) => Some(u64::from(kbps) * 1000),
                RateControl::Quality(_) => None,
            },
            color: self.settings.color,
            extradata: self.extradata.clone(),
        }
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        self.release();
    }
}
