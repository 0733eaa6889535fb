//! libswscale conversion into pooled buffers.

use std::ffi::c_int;
use std::ptr;

use ffmpeg_sys_next as ffi;

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::PixelFormat;

use super::frames::OwnedFrame;
use super::mapping::to_av_pixel_format;
use crate::codec::FrameConverter;
use crate::frame::{ColorMetadata, ColorRange, ColorSpace, Frame};
use crate::pool::{FramePool, PooledBuffer};

/// A cached `SwsContext`, rebuilt only when geometry or formats change.
pub struct Scaler {
    ctx: *mut ffi::SwsContext,
}

// SAFETY: the context is only used through &mut self.
unsafe impl Send for Scaler {}

impl Default for Scaler {
    fn default() -> Self {
        Self {
            ctx: ptr::null_mut(),
        }
    }
}

fn colorspace_table(color: &ColorMetadata) -> c_int {
    match color.space {
        ColorSpace::Bt709 => ffi::SWS_CS_ITU709 as c_int,
        ColorSpace::Bt2020 => ffi::SWS_CS_BT2020 as c_int,
        ColorSpace::Bt601 | ColorSpace::Unspecified => ffi::SWS_CS_DEFAULT as c_int,
    }
}

impl Scaler {
    /// Scale raw planes into `dst`.
    ///
    /// # Safety
    ///
    /// `planes` and `strides` must describe a readable `width`x`height`
    /// image in `format`.
    #[allow(clippy::too_many_arguments)]
    unsafe fn scale_raw(
        &mut self,
        planes: &[*const u8; 4],
        strides: &[c_int; 4],
        width: u32,
        height: u32,
        format: ffi::AVPixelFormat,
        color: &ColorMetadata,
        dst: &mut PooledBuffer,
    ) -> CutlineResult<()> {
        let dst_format = to_av_pixel_format(dst.format());
        self.ctx = ffi::sws_getCachedContext(
            self.ctx,
            width as c_int,
            height as c_int,
            format,
            dst.width() as c_int,
            dst.height() as c_int,
            dst_format,
            ffi::SWS_BILINEAR as c_int,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null(),
        );
        if self.ctx.is_null() {
            return Err(CutlineError::unsupported(format!(
                "no conversion from {format:?} to {}",
                dst.format()
            )));
        }

        let table = ffi::sws_getCoefficients(colorspace_table(color));
        let full = c_int::from(color.range == ColorRange::Full);
        ffi::sws_setColorspaceDetails(self.ctx, table, full, table, full, 0, 1 << 16, 1 << 16);

        let mut dst_planes = [ptr::null_mut::<u8>(); 4];
        let mut dst_strides = [0 as c_int; 4];
        for plane in 0..dst.plane_count() {
            dst_strides[plane] = dst.stride(plane) as c_int;
            dst_planes[plane] = dst.plane_ptr(plane);
        }
        let rows = ffi::sws_scale(
            self.ctx,
            planes.as_ptr(),
            strides.as_ptr(),
            0,
            height as c_int,
            dst_planes.as_ptr(),
            dst_strides.as_ptr(),
        );
        if rows <= 0 {
            return Err(CutlineError::render(format!(
                "sws_scale produced no output ({rows})"
            )));
        }
        Ok(())
    }

    /// Convert a CPU `AVFrame` of any layout libswscale reads.
    pub fn scale_frame(
        &mut self,
        frame: &OwnedFrame,
        format: PixelFormat,
        pool: &FramePool,
    ) -> CutlineResult<PooledBuffer> {
        let mut dst = pool.acquire(frame.width(), frame.height(), format)?;
        let raw = frame.as_ptr();
        let mut planes = [ptr::null::<u8>(); 4];
        let mut strides = [0 as c_int; 4];
        // SAFETY: the frame is a valid decoded CPU frame; its format value
        // came from libav and is a valid AVPixelFormat discriminant.
        unsafe {
            for plane in 0..4 {
                planes[plane] = (*raw).data[plane];
                strides[plane] = (*raw).linesize[plane];
            }
            let source = std::mem::transmute::<c_int, ffi::AVPixelFormat>(frame.raw_format());
            self.scale_raw(
                &planes,
                &strides,
                frame.width(),
                frame.height(),
                source,
                &frame.color(),
                &mut dst,
            )?;
        }
        Ok(dst)
    }

    /// Convert a pooled buffer into another size or layout.
    pub fn scale_buffer(
        &mut self,
        src: &PooledBuffer,
        color: &ColorMetadata,
        dst: &mut PooledBuffer,
    ) -> CutlineResult<()> {
        let mut planes = [ptr::null::<u8>(); 4];
        let mut strides = [0 as c_int; 4];
        for plane in 0..src.plane_count() {
            planes[plane] = src.plane(plane).as_ptr();
            strides[plane] = src.stride(plane) as c_int;
        }
        // SAFETY: the planes describe `src`, which is borrowed for the call.
        unsafe {
            self.scale_raw(
                &planes,
                &strides,
                src.width(),
                src.height(),
                to_av_pixel_format(src.format()),
                color,
                dst,
            )
        }
    }
}

impl Drop for Scaler {
    fn drop(&mut self) {
        // SAFETY: ctx is null or owned by us; sws_freeContext accepts null.
        unsafe { ffi::sws_freeContext(self.ctx) };
    }
}

/// [`FrameConverter`] backed by libswscale.
#[derive(Default)]
pub struct SwsConverter {
    scaler: Scaler,
}

impl FrameConverter for SwsConverter {
    fn convert(
        &mut self,
        frame: &Frame,
        width: u32,
        height: u32,
        format: PixelFormat,
        pool: &FramePool,
    ) -> CutlineResult<Frame> {
        let src = frame.cpu_buffer().ok_or_else(|| {
            CutlineError::unsupported("software conversion of a device-resident frame")
        })?;
        if src.width() == width && src.height() == height && src.format() == format {
            return Ok(frame.clone());
        }
        let mut dst = pool.acquire(width, height, format)?;
        self.scaler.scale_buffer(src, &frame.color, &mut dst)?;
        Ok(Frame::cpu(dst, frame.pts, frame.color))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Rgba;

    #[test]
    fn identical_geometry_is_passed_through() {
        let pool = FramePool::new(4);
        let frame = Frame::filled(&pool, 64, 32, PixelFormat::Nv12, Rgba::BLACK).unwrap();
        let out = SwsConverter::default()
            .convert(&frame, 64, 32, PixelFormat::Nv12, &pool)
            .unwrap();
        assert_eq!(out.checksum().unwrap(), frame.checksum().unwrap());
    }

    #[test]
    fn nv12_converts_to_planar() {
        let pool = FramePool::new(4);
        let frame = Frame::filled(&pool, 64, 32, PixelFormat::Nv12, Rgba::BLACK).unwrap();
        let out = SwsConverter::default()
            .convert(&frame, 32, 16, PixelFormat::Yuv420p, &pool)
            .unwrap();
        assert_eq!((out.width, out.height), (32, 16));
        let luma = out.cpu_buffer().unwrap().row(0, 0);
        assert!(luma.iter().all(|&y| y == 16));
    }
}
