//! Single-stream container muxing.

use std::ffi::c_int;
use std::path::{Path, PathBuf};
use std::ptr;

use ffmpeg_sys_next as ffi;

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::ffmpeg::sys::{check_ffmpeg, to_cstring};

use super::context::PacketBuffer;
use super::mapping::{
    av_color_range, av_color_space, av_color_transfer, from_av_rational, to_av_codec_id,
    to_av_rational,
};
use crate::codec::{Packet, PacketSink, StreamParameters};
use crate::rational::Rational;

/// Whether the muxer libavformat picks for `path` wants out-of-band codec
/// configuration.
pub fn wants_global_header(path: &Path) -> bool {
    let Ok(name) = to_cstring(&path.to_string_lossy()) else {
        return false;
    };
    // SAFETY: av_guess_format returns a static descriptor or null.
    unsafe {
        let format = ffi::av_guess_format(ptr::null(), name.as_ptr(), ptr::null());
        !format.is_null() && (*format).flags & ffi::AVFMT_GLOBALHEADER as c_int != 0
    }
}

/// Writes one video stream into a container file.
pub struct FfmpegMuxer {
    path: PathBuf,
    fmt_ctx: *mut ffi::AVFormatContext,
    stream: *mut ffi::AVStream,
    packet: PacketBuffer,
    time_base: Rational,
    header_written: bool,
    io_open: bool,
}

// SAFETY: owned by one encoder session.
unsafe impl Send for FfmpegMuxer {}

impl FfmpegMuxer {
    pub fn create(path: &Path) -> CutlineResult<Self> {
        let c_path = to_cstring(&path.to_string_lossy())?;
        let mut fmt_ctx: *mut ffi::AVFormatContext = ptr::null_mut();
        // SAFETY: fmt_ctx is an out-pointer; the format is guessed from the
        // file name.
        let ret = unsafe {
            ffi::avformat_alloc_output_context2(
                &mut fmt_ctx,
                ptr::null(),
                ptr::null(),
                c_path.as_ptr(),
            )
        };
        check_ffmpeg(ret, "avformat_alloc_output_context2").map_err(|e| e.into_container())?;
        if fmt_ctx.is_null() {
            return Err(CutlineError::container(format!(
                "no container format for {}",
                path.display()
            )));
        }
        let muxer = Self {
            path: path.to_path_buf(),
            fmt_ctx,
            stream: ptr::null_mut(),
            packet: PacketBuffer::alloc()?,
            time_base: Rational::default(),
            header_written: false,
            io_open: false,
        };
        Ok(muxer)
    }

    fn needs_file(&self) -> bool {
        // SAFETY: oformat is set by avformat_alloc_output_context2.
        unsafe { (*(*self.fmt_ctx).oformat).flags & ffi::AVFMT_NOFILE as c_int == 0 }
    }
}

impl PacketSink for FfmpegMuxer {
    fn begin(&mut self, params: &StreamParameters) -> CutlineResult<()> {
        if self.header_written {
            return Err(CutlineError::container("header already written"));
        }
        // SAFETY: fmt_ctx is valid; the new stream belongs to it.
        unsafe {
            self.stream = ffi::avformat_new_stream(self.fmt_ctx, ptr::null());
            if self.stream.is_null() {
                return Err(CutlineError::container("avformat_new_stream failed"));
            }
            let stream = &mut *self.stream;
            stream.time_base = to_av_rational(params.time_base);
            stream.avg_frame_rate = to_av_rational(params.frame_rate);

            let par = &mut *stream.codecpar;
            par.codec_type = ffi::AVMediaType::AVMEDIA_TYPE_VIDEO;
            par.codec_id = to_av_codec_id(params.codec);
            par.width = params.width as c_int;
            par.height = params.height as c_int;
            par.bit_rate = params.bitrate.unwrap_or(0) as i64;
            par.color_range = av_color_range(&params.color);
            par.color_space = av_color_space(&params.color);
            par.color_trc = av_color_transfer(&params.color);
            if !params.extradata.is_empty() {
                let padded =
                    params.extradata.len() + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
                let buf = ffi::av_mallocz(padded) as *mut u8;
                if buf.is_null() {
                    return Err(std::io::Error::from(std::io::ErrorKind::OutOfMemory).into());
                }
                ptr::copy_nonoverlapping(params.extradata.as_ptr(), buf, params.extradata.len());
                par.extradata = buf;
                par.extradata_size = params.extradata.len() as c_int;
            }
        }

        if self.needs_file() {
            let c_path = to_cstring(&self.path.to_string_lossy())?;
            // SAFETY: pb is an out-pointer owned by fmt_ctx.
            let ret = unsafe {
                ffi::avio_open(
                    &mut (*self.fmt_ctx).pb,
                    c_path.as_ptr(),
                    ffi::AVIO_FLAG_WRITE as c_int,
                )
            };
            check_ffmpeg(ret, "avio_open").map_err(|e| e.into_container())?;
            self.io_open = true;
        }

        // SAFETY: the stream is configured and the output is open.
        let ret = unsafe { ffi::avformat_write_header(self.fmt_ctx, ptr::null_mut()) };
        check_ffmpeg(ret, "avformat_write_header").map_err(|e| e.into_container())?;
        self.header_written = true;
        // The muxer may have replaced the requested time base.
        self.time_base = from_av_rational(unsafe { (*self.stream).time_base });
        tracing::debug!(
            path = %self.path.display(),
            time_base = %self.time_base,
            "Container header written"
        );
        Ok(())
    }

    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn write_packet(&mut self, packet: Packet) -> CutlineResult<()> {
        if !self.header_written {
            return Err(CutlineError::container("packet written before header"));
        }
        self.packet.fill(&packet, self.time_base)?;
        // SAFETY: the packet is filled and the header has been written;
        // av_interleaved_write_frame takes the packet's reference.
        let ret = unsafe {
            (*self.packet.as_ptr()).stream_index = (*self.stream).index;
            ffi::av_interleaved_write_frame(self.fmt_ctx, self.packet.as_ptr())
        };
        check_ffmpeg(ret, "av_interleaved_write_frame").map_err(|e| e.into_container())
    }

    fn write_trailer(&mut self) -> CutlineResult<()> {
        if !self.header_written {
            return Err(CutlineError::container("trailer written before header"));
        }
        // SAFETY: the header was written.
        let ret = unsafe { ffi::av_write_trailer(self.fmt_ctx) };
        check_ffmpeg(ret, "av_write_trailer").map_err(|e| e.into_container())
    }

    fn close(&mut self) -> CutlineResult<()> {
        if self.io_open {
            // SAFETY: pb was opened by avio_open; avio_closep nulls it.
            let ret = unsafe { ffi::avio_closep(&mut (*self.fmt_ctx).pb) };
            self.io_open = false;
            check_ffmpeg(ret, "avio_closep").map_err(|e| e.into_container())?;
        }
        Ok(())
    }
}

impl Drop for FfmpegMuxer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(path = %self.path.display(), error = %e, "Closing output failed");
        }
        // SAFETY: fmt_ctx came from avformat_alloc_output_context2.
        unsafe { ffi::avformat_free_context(self.fmt_ctx) };
    }
}
