//! Container demuxing for the selected video stream.

use std::path::Path;
use std::ptr;

use ffmpeg_sys_next as ffi;

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::ffmpeg::sys::{averror_eof, check_ffmpeg, to_cstring};

use super::mapping::{
    codec_id_name, color_from_av, from_av_codec_id, from_av_rational, from_raw_pixel_format,
    timestamp,
};
use crate::codec::{Packet, PacketSource, StreamInfo};
use crate::rational::{frame_to_pts, pts_to_frame, Rational};

/// Reads packets of the best video stream of one container.
pub struct FfmpegDemuxer {
    fmt_ctx: *mut ffi::AVFormatContext,
    packet: *mut ffi::AVPacket,
    stream_index: i32,
    info: StreamInfo,
    eos: bool,
    /// Packet read ahead by a seek to learn where it landed.
    lookahead: Option<Packet>,
}

// SAFETY: the demuxer is owned by one decoder session and never shared.
unsafe impl Send for FfmpegDemuxer {}

impl FfmpegDemuxer {
    pub fn open(path: &Path) -> CutlineResult<Self> {
        if !path.exists() {
            return Err(CutlineError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let c_path = to_cstring(&path.to_string_lossy())?;

        let mut fmt_ctx: *mut ffi::AVFormatContext = ptr::null_mut();
        // SAFETY: fmt_ctx is an out-pointer, c_path is NUL-terminated.
        let ret = unsafe {
            ffi::avformat_open_input(&mut fmt_ctx, c_path.as_ptr(), ptr::null(), ptr::null_mut())
        };
        check_ffmpeg(ret, "avformat_open_input").map_err(|e| e.into_container())?;

        // From here on Drop owns the context.
        let mut demuxer = Self {
            fmt_ctx,
            // SAFETY: av_packet_alloc has no preconditions.
            packet: unsafe { ffi::av_packet_alloc() },
            stream_index: -1,
            info: empty_info(),
            eos: false,
            lookahead: None,
        };
        if demuxer.packet.is_null() {
            return Err(CutlineError::container("failed to allocate AVPacket"));
        }

        // SAFETY: fmt_ctx is open.
        let ret = unsafe { ffi::avformat_find_stream_info(demuxer.fmt_ctx, ptr::null_mut()) };
        check_ffmpeg(ret, "avformat_find_stream_info").map_err(|e| e.into_container())?;

        // SAFETY: fmt_ctx is open and probed.
        let stream_index = unsafe {
            ffi::av_find_best_stream(
                demuxer.fmt_ctx,
                ffi::AVMediaType::AVMEDIA_TYPE_VIDEO,
                -1,
                -1,
                ptr::null_mut(),
                0,
            )
        };
        if stream_index < 0 {
            return Err(CutlineError::container(format!(
                "{} has no video stream",
                path.display()
            )));
        }
        demuxer.stream_index = stream_index;
        demuxer.info = demuxer.read_stream_info();

        tracing::debug!(
            path = %path.display(),
            stream_index,
            codec = %demuxer.info.codec_name,
            width = demuxer.info.width,
            height = demuxer.info.height,
            frame_rate = %demuxer.info.frame_rate,
            "Container opened"
        );
        Ok(demuxer)
    }

    fn stream(&self) -> *mut ffi::AVStream {
        // SAFETY: stream_index was returned by av_find_best_stream.
        unsafe { *(*self.fmt_ctx).streams.add(self.stream_index as usize) }
    }

    fn read_stream_info(&self) -> StreamInfo {
        // SAFETY: the stream and its parameters live as long as fmt_ctx.
        unsafe {
            let stream = &*self.stream();
            let par = &*stream.codecpar;

            let avg = from_av_rational(stream.avg_frame_rate);
            let frame_rate = if avg.is_valid() {
                avg
            } else {
                from_av_rational(stream.r_frame_rate)
            };

            let extradata = if par.extradata.is_null() || par.extradata_size <= 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts(par.extradata, par.extradata_size as usize).to_vec()
            };

            StreamInfo {
                codec: from_av_codec_id(par.codec_id),
                codec_name: codec_id_name(par.codec_id),
                width: par.width.max(0) as u32,
                height: par.height.max(0) as u32,
                format: from_raw_pixel_format(par.format),
                frame_rate,
                time_base: from_av_rational(stream.time_base),
                start_pts: timestamp(stream.start_time),
                frame_count: (stream.nb_frames > 0).then_some(stream.nb_frames as u64),
                duration: timestamp(stream.duration).filter(|d| *d > 0),
                container_duration_us: timestamp((*self.fmt_ctx).duration).filter(|d| *d > 0),
                color: color_from_av(par.color_range, par.color_space, par.color_trc),
                extradata,
            }
        }
    }
}

fn empty_info() -> StreamInfo {
    StreamInfo {
        codec: None,
        codec_name: String::new(),
        width: 0,
        height: 0,
        format: None,
        frame_rate: Rational::default(),
        time_base: Rational::default(),
        start_pts: None,
        frame_count: None,
        duration: None,
        container_duration_us: None,
        color: Default::default(),
        extradata: Vec::new(),
    }
}

impl PacketSource for FfmpegDemuxer {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_packet(&mut self) -> CutlineResult<Option<Packet>> {
        if let Some(packet) = self.lookahead.take() {
            return Ok(Some(packet));
        }
        if self.eos {
            return Ok(None);
        }
        loop {
            // SAFETY: fmt_ctx and packet are valid for the demuxer's life.
            let ret = unsafe { ffi::av_read_frame(self.fmt_ctx, self.packet) };
            if ret == averror_eof() {
                self.eos = true;
                return Ok(None);
            }
            check_ffmpeg(ret, "av_read_frame").map_err(|e| e.into_container())?;

            // SAFETY: av_read_frame filled the packet.
            let pkt = unsafe { &*self.packet };
            if pkt.stream_index != self.stream_index {
                unsafe { ffi::av_packet_unref(self.packet) };
                continue;
            }
            let data = if pkt.size > 0 && !pkt.data.is_null() {
                // SAFETY: data is valid for size bytes.
                unsafe { std::slice::from_raw_parts(pkt.data, pkt.size as usize) }.to_vec()
            } else {
                Vec::new()
            };
            let packet = Packet {
                data,
                pts: timestamp(pkt.pts),
                dts: timestamp(pkt.dts),
                duration: pkt.duration,
                keyframe: pkt.flags & ffi::AV_PKT_FLAG_KEY as i32 != 0,
                time_base: self.info.time_base,
            };
            unsafe { ffi::av_packet_unref(self.packet) };
            if packet.data.is_empty() {
                continue;
            }
            return Ok(Some(packet));
        }
    }

    fn seek_keyframe(&mut self, frame_index: u64) -> CutlineResult<Option<u64>> {
        let target = frame_to_pts(frame_index, self.info.frame_rate, self.info.time_base)
            + self.info.start_pts.unwrap_or(0);
        // SAFETY: fmt_ctx is open; the timestamp is in stream time base.
        let ret = unsafe {
            ffi::av_seek_frame(
                self.fmt_ctx,
                self.stream_index,
                target,
                ffi::AVSEEK_FLAG_BACKWARD as i32,
            )
        };
        check_ffmpeg(ret, "av_seek_frame").map_err(|e| e.into_container())?;
        // SAFETY: fmt_ctx is open.
        unsafe { ffi::avformat_flush(self.fmt_ctx) };
        self.eos = false;
        self.lookahead = None;

        let first = self.read_packet()?;
        let landed = first.as_ref().and_then(|packet| {
            packet.pts.or(packet.dts).map(|ts| {
                pts_to_frame(
                    ts - self.info.start_pts.unwrap_or(0),
                    self.info.time_base,
                    self.info.frame_rate,
                )
            })
        });
        self.lookahead = first;
        tracing::trace!(frame_index, target, ?landed, "Container seek");
        Ok(landed)
    }
}

impl Drop for FfmpegDemuxer {
    fn drop(&mut self) {
        // SAFETY: both pointers are owned and freed once; the free
        // functions accept null.
        unsafe {
            ffi::av_packet_free(&mut self.packet);
            if !self.fmt_ctx.is_null() {
                ffi::avformat_close_input(&mut self.fmt_ctx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_are_reported_as_not_found() {
        let err = FfmpegDemuxer::open(Path::new("/definitely/not/here.mp4"))
            .err()
            .unwrap();
        assert!(matches!(err, CutlineError::FileNotFound { .. }));
    }
}
