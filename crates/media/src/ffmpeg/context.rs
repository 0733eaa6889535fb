//! Shared `AVCodecContext` plumbing for decoders and encoders.

use std::ffi::{c_int, CStr};
use std::ptr;

use ffmpeg_sys_next as ffi;

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::ffmpeg::sys::{
    averror_again, averror_eof, check_ffmpeg, to_cstring, FfmpegErrorDetail,
};

use crate::codec::{CodecStatus, FallbackReason, Packet};
use crate::rational::Rational;

use super::mapping::{timestamp, to_av_rational};

/// An `AVCodecContext` freed on release.
pub struct CodecContext {
    ptr: *mut ffi::AVCodecContext,
    name: String,
}

// SAFETY: a codec context is driven by one session at a time.
unsafe impl Send for CodecContext {}

impl CodecContext {
    pub fn alloc(codec: *const ffi::AVCodec) -> CutlineResult<Self> {
        // SAFETY: codec is a registered codec.
        let ptr = unsafe { ffi::avcodec_alloc_context3(codec) };
        if ptr.is_null() {
            return Err(std::io::Error::from(std::io::ErrorKind::OutOfMemory).into());
        }
        // SAFETY: codec is valid and its name is static.
        let name = unsafe { CStr::from_ptr((*codec).name) }
            .to_string_lossy()
            .into_owned();
        Ok(Self { ptr, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_ptr(&self) -> *mut ffi::AVCodecContext {
        self.ptr
    }

    pub fn is_open(&self) -> bool {
        !self.ptr.is_null()
    }

    pub fn set_extradata(&mut self, data: &[u8]) -> CutlineResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let padded = data.len() + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
        // SAFETY: av_mallocz returns zeroed memory of `padded` bytes; the
        // codec context frees extradata with av_free.
        unsafe {
            let buf = ffi::av_mallocz(padded) as *mut u8;
            if buf.is_null() {
                return Err(std::io::Error::from(std::io::ErrorKind::OutOfMemory).into());
            }
            ptr::copy_nonoverlapping(data.as_ptr(), buf, data.len());
            (*self.ptr).extradata = buf;
            (*self.ptr).extradata_size = data.len() as c_int;
        }
        Ok(())
    }

    /// Copy the codec configuration record produced by the encoder.
    pub fn extradata(&self) -> Vec<u8> {
        // SAFETY: extradata is valid for extradata_size bytes when set.
        unsafe {
            let ctx = &*self.ptr;
            if ctx.extradata.is_null() || ctx.extradata_size <= 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts(ctx.extradata, ctx.extradata_size as usize).to_vec()
            }
        }
    }

    /// Set a private option, searching child objects too.
    pub fn set_option(&mut self, key: &str, value: &str) -> CutlineResult<()> {
        let (k, v) = (to_cstring(key)?, to_cstring(value)?);
        // SAFETY: priv_data is the codec's option object; strings outlive
        // the call.
        let ret = unsafe {
            ffi::av_opt_set(
                (*self.ptr).priv_data,
                k.as_ptr(),
                v.as_ptr(),
                ffi::AV_OPT_SEARCH_CHILDREN as c_int,
            )
        };
        check_ffmpeg(ret, &format!("av_opt_set({key}={value})")).map_err(|e| e.into_encode())
    }

    pub fn open(&mut self, codec: *const ffi::AVCodec) -> Result<(), FallbackReason> {
        // SAFETY: the context was allocated for `codec`.
        let ret = unsafe { ffi::avcodec_open2(self.ptr, codec, ptr::null_mut()) };
        check_ffmpeg(ret, "avcodec_open2").map_err(|e| FallbackReason::OpenFailed {
            name: self.name.clone(),
            message: e.to_string(),
        })
    }

    /// Stop the session. Buffers stay allocated until `free`.
    pub fn close(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        // SAFETY: ptr is a valid context; closing twice is harmless.
        unsafe { ffi::avcodec_close(self.ptr) };
    }

    pub fn free(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        // SAFETY: ptr came from avcodec_alloc_context3; the call nulls it.
        unsafe { ffi::avcodec_free_context(&mut self.ptr) };
    }
}

impl Drop for CodecContext {
    fn drop(&mut self) {
        self.free();
    }
}

/// Map the return of a send/receive call.
pub fn codec_status(ret: c_int, context: &str) -> Result<CodecStatus<()>, FfmpegErrorDetail> {
    if ret == averror_again() {
        return Ok(CodecStatus::Again);
    }
    if ret == averror_eof() {
        return Ok(CodecStatus::EndOfStream);
    }
    check_ffmpeg(ret, context)?;
    Ok(CodecStatus::Ready(()))
}

/// An `AVPacket` reused across calls.
pub struct PacketBuffer {
    ptr: *mut ffi::AVPacket,
}

// SAFETY: owned by one session.
unsafe impl Send for PacketBuffer {}

impl PacketBuffer {
    pub fn alloc() -> CutlineResult<Self> {
        // SAFETY: no preconditions.
        let ptr = unsafe { ffi::av_packet_alloc() };
        if ptr.is_null() {
            return Err(CutlineError::container("failed to allocate AVPacket"));
        }
        Ok(Self { ptr })
    }

    pub fn as_ptr(&self) -> *mut ffi::AVPacket {
        self.ptr
    }

    /// Load `packet` into the buffer, expressed in `time_base`.
    pub fn fill(&mut self, packet: &Packet, time_base: Rational) -> CutlineResult<()> {
        let mut packet = packet.clone();
        packet.rescale(time_base);
        // SAFETY: ptr is a valid packet; av_new_packet allocates `size`
        // bytes plus padding.
        unsafe {
            ffi::av_packet_unref(self.ptr);
            let ret = ffi::av_new_packet(self.ptr, packet.data.len() as c_int);
            check_ffmpeg(ret, "av_new_packet").map_err(|e| e.into_container())?;
            ptr::copy_nonoverlapping(packet.data.as_ptr(), (*self.ptr).data, packet.data.len());
            let raw = &mut *self.ptr;
            raw.pts = packet.pts.unwrap_or(ffi::AV_NOPTS_VALUE);
            raw.dts = packet.dts.unwrap_or(ffi::AV_NOPTS_VALUE);
            raw.duration = packet.duration;
            raw.time_base = to_av_rational(time_base);
            if packet.keyframe {
                raw.flags |= ffi::AV_PKT_FLAG_KEY as c_int;
            }
        }
        Ok(())
    }

    /// Copy the buffer out and unref it.
    pub fn take(&mut self, time_base: Rational) -> Packet {
        // SAFETY: ptr holds a packet produced by libav.
        unsafe {
            let raw = &*self.ptr;
            let data = if raw.data.is_null() || raw.size <= 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts(raw.data, raw.size as usize).to_vec()
            };
            let packet = Packet {
                data,
                pts: timestamp(raw.pts),
                dts: timestamp(raw.dts),
                duration: raw.duration,
                keyframe: raw.flags & ffi::AV_PKT_FLAG_KEY as c_int != 0,
                time_base,
            };
            ffi::av_packet_unref(self.ptr);
            packet
        }
    }

    pub fn unref(&mut self) {
        // SAFETY: ptr is a valid packet.
        unsafe { ffi::av_packet_unref(self.ptr) };
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        // SAFETY: freed once; av_packet_free nulls the pointer.
        unsafe { ffi::av_packet_free(&mut self.ptr) };
    }
}
