//! Conversions between Cutline types and libav enums.

use std::ffi::{c_int, CStr};

use ffmpeg_sys_next as ffi;
use ffi::{AVColorRange, AVColorSpace, AVColorTransferCharacteristic, AVPixelFormat};

use cutline_hwaccel::{PixelFormat, VideoCodec};

use crate::frame::{ColorMetadata, ColorRange, ColorSpace, ColorTransfer};
use crate::rational::Rational;

const PIXEL_FORMATS: [(PixelFormat, AVPixelFormat); 9] = [
    (PixelFormat::Yuv420p, AVPixelFormat::AV_PIX_FMT_YUV420P),
    (PixelFormat::Nv12, AVPixelFormat::AV_PIX_FMT_NV12),
    (PixelFormat::P010le, AVPixelFormat::AV_PIX_FMT_P010LE),
    (PixelFormat::Rgba, AVPixelFormat::AV_PIX_FMT_RGBA),
    (PixelFormat::Bgra, AVPixelFormat::AV_PIX_FMT_BGRA),
    (PixelFormat::Rgb24, AVPixelFormat::AV_PIX_FMT_RGB24),
    (PixelFormat::Cuda, AVPixelFormat::AV_PIX_FMT_CUDA),
    (PixelFormat::Vaapi, AVPixelFormat::AV_PIX_FMT_VAAPI),
    (PixelFormat::VideoToolbox, AVPixelFormat::AV_PIX_FMT_VIDEOTOOLBOX),
];

pub fn to_av_pixel_format(format: PixelFormat) -> AVPixelFormat {
    PIXEL_FORMATS
        .iter()
        .find(|(f, _)| *f == format)
        .map(|(_, av)| *av)
        .unwrap_or(AVPixelFormat::AV_PIX_FMT_NONE)
}

/// Map the raw `format` field of an `AVFrame`/`AVCodecParameters`.
pub fn from_raw_pixel_format(raw: c_int) -> Option<PixelFormat> {
    PIXEL_FORMATS
        .iter()
        .find(|(_, av)| *av as c_int == raw)
        .map(|(f, _)| *f)
}

pub fn to_av_codec_id(codec: VideoCodec) -> ffi::AVCodecID {
    match codec {
        VideoCodec::H264 => ffi::AVCodecID::AV_CODEC_ID_H264,
        VideoCodec::Hevc => ffi::AVCodecID::AV_CODEC_ID_HEVC,
        VideoCodec::Av1 => ffi::AVCodecID::AV_CODEC_ID_AV1,
    }
}

pub fn from_av_codec_id(id: ffi::AVCodecID) -> Option<VideoCodec> {
    match id {
        ffi::AVCodecID::AV_CODEC_ID_H264 => Some(VideoCodec::H264),
        ffi::AVCodecID::AV_CODEC_ID_HEVC => Some(VideoCodec::Hevc),
        ffi::AVCodecID::AV_CODEC_ID_AV1 => Some(VideoCodec::Av1),
        _ => None,
    }
}

pub fn codec_id_name(id: ffi::AVCodecID) -> String {
    // SAFETY: avcodec_get_name returns a static string for any id.
    unsafe { CStr::from_ptr(ffi::avcodec_get_name(id)) }
        .to_string_lossy()
        .into_owned()
}

pub fn to_av_rational(r: Rational) -> ffi::AVRational {
    ffi::AVRational {
        num: r.num,
        den: r.den,
    }
}

pub fn from_av_rational(r: ffi::AVRational) -> Rational {
    Rational::new(r.num, r.den)
}

pub fn color_from_av(
    range: AVColorRange,
    space: AVColorSpace,
    transfer: AVColorTransferCharacteristic,
) -> ColorMetadata {
    ColorMetadata {
        range: match range {
            AVColorRange::AVCOL_RANGE_MPEG => ColorRange::Limited,
            AVColorRange::AVCOL_RANGE_JPEG => ColorRange::Full,
            _ => ColorRange::Unspecified,
        },
        space: match space {
            AVColorSpace::AVCOL_SPC_BT709 => ColorSpace::Bt709,
            AVColorSpace::AVCOL_SPC_BT470BG | AVColorSpace::AVCOL_SPC_SMPTE170M => {
                ColorSpace::Bt601
            }
            AVColorSpace::AVCOL_SPC_BT2020_NCL | AVColorSpace::AVCOL_SPC_BT2020_CL => {
                ColorSpace::Bt2020
            }
            _ => ColorSpace::Unspecified,
        },
        transfer: match transfer {
            AVColorTransferCharacteristic::AVCOL_TRC_BT709 => ColorTransfer::Bt709,
            AVColorTransferCharacteristic::AVCOL_TRC_IEC61966_2_1 => ColorTransfer::Srgb,
            AVColorTransferCharacteristic::AVCOL_TRC_SMPTE2084 => ColorTransfer::Pq,
            AVColorTransferCharacteristic::AVCOL_TRC_ARIB_STD_B67 => ColorTransfer::Hlg,
            _ => ColorTransfer::Unspecified,
        },
    }
}

pub fn av_color_range(color: &ColorMetadata) -> AVColorRange {
    match color.range {
        ColorRange::Limited => AVColorRange::AVCOL_RANGE_MPEG,
        ColorRange::Full => AVColorRange::AVCOL_RANGE_JPEG,
        ColorRange::Unspecified => AVColorRange::AVCOL_RANGE_UNSPECIFIED,
    }
}

pub fn av_color_space(color: &ColorMetadata) -> AVColorSpace {
    match color.space {
        ColorSpace::Bt601 => AVColorSpace::AVCOL_SPC_SMPTE170M,
        ColorSpace::Bt709 => AVColorSpace::AVCOL_SPC_BT709,
        ColorSpace::Bt2020 => AVColorSpace::AVCOL_SPC_BT2020_NCL,
        ColorSpace::Unspecified => AVColorSpace::AVCOL_SPC_UNSPECIFIED,
    }
}

pub fn av_color_transfer(color: &ColorMetadata) -> AVColorTransferCharacteristic {
    match color.transfer {
        ColorTransfer::Bt709 => AVColorTransferCharacteristic::AVCOL_TRC_BT709,
        ColorTransfer::Srgb => AVColorTransferCharacteristic::AVCOL_TRC_IEC61966_2_1,
        ColorTransfer::Pq => AVColorTransferCharacteristic::AVCOL_TRC_SMPTE2084,
        ColorTransfer::Hlg => AVColorTransferCharacteristic::AVCOL_TRC_ARIB_STD_B67,
        ColorTransfer::Unspecified => AVColorTransferCharacteristic::AVCOL_TRC_UNSPECIFIED,
    }
}

/// `None` for `AV_NOPTS_VALUE`.
pub fn timestamp(value: i64) -> Option<i64> {
    (value != ffi::AV_NOPTS_VALUE).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_formats_map_both_ways() {
        for (format, av) in PIXEL_FORMATS {
            assert_eq!(to_av_pixel_format(format), av);
            assert_eq!(from_raw_pixel_format(av as c_int), Some(format));
        }
        assert_eq!(from_raw_pixel_format(-1), None);
    }

    #[test]
    fn missing_timestamps_are_none() {
        assert_eq!(timestamp(ffi::AV_NOPTS_VALUE), None);
        assert_eq!(timestamp(12), Some(12));
    }
}
