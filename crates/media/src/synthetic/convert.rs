use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::PixelFormat;

use crate::codec::FrameConverter;
use crate::frame::Frame;
use crate::pool::{FramePool, PooledBuffer};

/// Nearest-neighbour CPU converter.
///
/// Handles rescaling within a family and the lossless layout changes
/// (YUV 4:2:0 planar and semi-planar, RGBA and BGRA and RGB24). Colour
/// model conversion is left to the native scaler.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyConverter;

fn is_yuv420(format: PixelFormat) -> bool {
    matches!(format, PixelFormat::Yuv420p | PixelFormat::Nv12)
}

fn is_packed_rgb(format: PixelFormat) -> bool {
    matches!(format, PixelFormat::Rgba | PixelFormat::Bgra | PixelFormat::Rgb24)
}

fn yuv_get(buffer: &PooledBuffer, component: usize, x: usize, y: usize) -> u8 {
    match (buffer.format(), component) {
        (_, 0) => buffer.row(0, y)[x],
        (PixelFormat::Nv12, c) => buffer.row(1, y)[2 * x + c - 1],
        (_, c) => buffer.row(c, y)[x],
    }
}

fn yuv_set(buffer: &mut PooledBuffer, component: usize, x: usize, y: usize, value: u8) {
    match (buffer.format(), component) {
        (_, 0) => buffer.row_mut(0, y)[x] = value,
        (PixelFormat::Nv12, c) => buffer.row_mut(1, y)[2 * x + c - 1] = value,
        (_, c) => buffer.row_mut(c, y)[x] = value,
    }
}

fn rgba_get(buffer: &PooledBuffer, x: usize, y: usize) -> [u8; 4] {
    let row = buffer.row(0, y);
    match buffer.format() {
        PixelFormat::Bgra => [row[4 * x + 2], row[4 * x + 1], row[4 * x], row[4 * x + 3]],
        PixelFormat::Rgb24 => [row[3 * x], row[3 * x + 1], row[3 * x + 2], 255],
        _ => [row[4 * x], row[4 * x + 1], row[4 * x + 2], row[4 * x + 3]],
    }
}

fn rgba_set(buffer: &mut PooledBuffer, x: usize, y: usize, [r, g, b, a]: [u8; 4]) {
    let format = buffer.format();
    let row = buffer.row_mut(0, y);
    match format {
        PixelFormat::Bgra => row[4 * x..4 * x + 4].copy_from_slice(&[b, g, r, a]),
        PixelFormat::Rgb24 => row[3 * x..3 * x + 3].copy_from_slice(&[r, g, b]),
        _ => row[4 * x..4 * x + 4].copy_from_slice(&[r, g, b, a]),
    }
}

fn nearest(dst: usize, dst_len: usize, src_len: usize) -> usize {
    (dst * src_len / dst_len.max(1)).min(src_len.saturating_sub(1))
}

impl FrameConverter for CopyConverter {
    fn convert(
        &mut self,
        frame: &Frame,
        width: u32,
        height: u32,
        format: PixelFormat,
        pool: &FramePool,
    ) -> CutlineResult<Frame> {
        let source = frame
            .cpu_buffer()
            .ok_or_else(|| CutlineError::unsupported("cannot convert a device-resident frame"))?;
        let mut target = pool.acquire(width, height, format)?;
        let (sw, sh) = (source.width() as usize, source.height() as usize);
        let (dw, dh) = (width as usize, height as usize);

        if is_yuv420(source.format()) && is_yuv420(format) {
            for y in 0..dh {
                let sy = nearest(y, dh, sh);
                for x in 0..dw {
                    let v = yuv_get(source, 0, nearest(x, dw, sw), sy);
                    yuv_set(&mut target, 0, x, y, v);
                }
            }
            let (scw, sch) = (sw.div_ceil(2), sh.div_ceil(2));
            let (dcw, dch) = (dw.div_ceil(2), dh.div_ceil(2));
            for component in 1..3 {
                for y in 0..dch {
                    let sy = nearest(y, dch, sch);
                    for x in 0..dcw {
                        let v = yuv_get(source, component, nearest(x, dcw, scw), sy);
                        yuv_set(&mut target, component, x, y, v);
                    }
                }
            }
        } else if is_packed_rgb(source.format()) && is_packed_rgb(format) {
            for y in 0..dh {
                let sy = nearest(y, dh, sh);
                for x in 0..dw {
                    let px = rgba_get(source, nearest(x, dw, sw), sy);
                    rgba_set(&mut target, x, y, px);
                }
            }
        } else {
            return Err(CutlineError::unsupported(format!(
                "no CPU conversion from {} to {format}",
                source.format()
            )));
        }

        Ok(Frame::cpu(target, frame.pts, frame.color))
    }
}
