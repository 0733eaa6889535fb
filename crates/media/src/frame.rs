//! Decoded video frames.
//!
//! A [`Frame`] is either CPU-resident (a pooled, 64-byte aligned buffer) or
//! GPU-resident (a shared [`GpuSurface`] handle). Residency is fixed when the
//! frame is built and is never re-derived from the format tag.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::{HardwareBackend, PixelFormat, Residency};

use crate::pool::{FramePool, PooledBuffer};

/// Plane alignment used for every CPU buffer.
pub const PLANE_ALIGN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorRange {
    #[default]
    Unspecified,
    Limited,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    #[default]
    Unspecified,
    Bt601,
    Bt709,
    Bt2020,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorTransfer {
    #[default]
    Unspecified,
    Bt709,
    Srgb,
    Pq,
    Hlg,
}

/// Colour signalling carried through every conversion and upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ColorMetadata {
    pub range: ColorRange,
    pub space: ColorSpace,
    pub transfer: ColorTransfer,
}

impl ColorMetadata {
    pub const BT709_LIMITED: Self = Self {
        range: ColorRange::Limited,
        space: ColorSpace::Bt709,
        transfer: ColorTransfer::Bt709,
    };
}

/// Geometry of one plane inside a CPU buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneSpec {
    /// Bytes of visible data per row.
    pub row_bytes: usize,
    pub rows: usize,
    /// Row pitch, a multiple of [`PLANE_ALIGN`].
    pub stride: usize,
    /// Byte offset from the start of the buffer.
    pub offset: usize,
}

impl PlaneSpec {
    pub fn len(&self) -> usize {
        self.stride * self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }
}

fn align_up(value: usize) -> usize {
    value.div_ceil(PLANE_ALIGN) * PLANE_ALIGN
}

/// Plane layout for a CPU format, or `None` for device formats.
pub fn plane_specs(format: PixelFormat, width: u32, height: u32) -> Option<Vec<PlaneSpec>> {
    let w = width as usize;
    let h = height as usize;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);
    let dims: Vec<(usize, usize)> = match format {
        PixelFormat::Yuv420p => vec![(w, h), (cw, ch), (cw, ch)],
        PixelFormat::Nv12 => vec![(w, h), (cw * 2, ch)],
        PixelFormat::P010le => vec![(w * 2, h), (cw * 4, ch)],
        PixelFormat::Rgba | PixelFormat::Bgra => vec![(w * 4, h)],
        PixelFormat::Rgb24 => vec![(w * 3, h)],
        PixelFormat::Cuda | PixelFormat::Vaapi | PixelFormat::VideoToolbox => return None,
    };

    let mut offset = 0;
    let planes = dims
        .into_iter()
        .map(|(row_bytes, rows)| {
            let stride = align_up(row_bytes.max(1));
            let plane = PlaneSpec {
                row_bytes,
                rows,
                stride,
                offset,
            };
            offset += plane.len();
            plane
        })
        .collect();
    Some(planes)
}

/// Total bytes needed for a CPU frame, excluding alignment slack.
pub fn buffer_size(format: PixelFormat, width: u32, height: u32) -> Option<usize> {
    plane_specs(format, width, height).map(|planes| planes.iter().map(PlaneSpec::len).sum())
}

/// An 8-bit straight-alpha colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const BLACK: Self = Self::new(0, 0, 0, 255);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// BT.709 limited-range YCbCr.
    pub fn to_ycbcr(self) -> (u8, u8, u8) {
        let r = f64::from(self.r) / 255.0;
        let g = f64::from(self.g) / 255.0;
        let b = f64::from(self.b) / 255.0;
        let y = 0.2126 * r + 0.7152 * g + 0.0722 * b;
        let cb = (b - y) / 1.8556;
        let cr = (r - y) / 1.5748;
        let to_u8 = |v: f64| v.round().clamp(0.0, 255.0) as u8;
        (
            to_u8(16.0 + 219.0 * y),
            to_u8(128.0 + 224.0 * cb),
            to_u8(128.0 + 224.0 * cr),
        )
    }
}

/// A native device surface owned by a codec session.
pub trait DeviceSurface: Send + Sync + fmt::Debug {
    fn backend(&self) -> HardwareBackend;

    /// Concrete surface for the session that created it.
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a device surface. Cloning never copies pixels, and the
/// surface stays alive while any holder remains.
#[derive(Clone)]
pub struct GpuSurface {
    inner: Arc<dyn DeviceSurface>,
}

impl GpuSurface {
    pub fn new(surface: impl DeviceSurface + 'static) -> Self {
        Self {
            inner: Arc::new(surface),
        }
    }

    pub fn backend(&self) -> HardwareBackend {
        self.inner.backend()
    }

    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }

    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn same_surface(&self, other: &GpuSurface) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for GpuSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GpuSurface").field(&self.inner).finish()
    }
}

/// Pixel storage of a frame.
#[derive(Debug, Clone)]
pub enum FramePayload {
    Cpu(Arc<PooledBuffer>),
    Gpu(GpuSurface),
}

/// One video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// CPU layout, or the device format tag for GPU frames.
    pub format: PixelFormat,
    /// Presentation time in the producing session's time base.
    pub pts: Option<i64>,
    pub color: ColorMetadata,
    residency: Residency,
    payload: FramePayload,
}

impl Frame {
    /// Wrap a filled pool buffer.
    pub fn cpu(buffer: PooledBuffer, pts: Option<i64>, color: ColorMetadata) -> Self {
        Self {
            width: buffer.width(),
            height: buffer.height(),
            format: buffer.format(),
            pts,
            color,
            residency: Residency::Cpu,
            payload: FramePayload::Cpu(Arc::new(buffer)),
        }
    }

    /// Wrap a device surface. The residency comes from the surface backend.
    pub fn gpu(
        surface: GpuSurface,
        width: u32,
        height: u32,
        pts: Option<i64>,
        color: ColorMetadata,
    ) -> Self {
        let backend = surface.backend();
        Self {
            width,
            height,
            format: backend.device_format().unwrap_or(PixelFormat::Nv12),
            pts,
            color,
            residency: Residency::Gpu(backend),
            payload: FramePayload::Gpu(surface),
        }
    }

    /// A frame filled with a solid colour.
    pub fn filled(
        pool: &FramePool,
        width: u32,
        height: u32,
        format: PixelFormat,
        color: Rgba,
    ) -> CutlineResult<Self> {
        let mut buffer = pool.acquire(width, height, format)?;
        buffer.fill(color)?;
        Ok(Self::cpu(buffer, None, ColorMetadata::BT709_LIMITED))
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn is_resident(&self) -> bool {
        self.residency.is_gpu()
    }

    pub fn payload(&self) -> &FramePayload {
        &self.payload
    }

    pub fn cpu_buffer(&self) -> Option<&PooledBuffer> {
        match &self.payload {
            FramePayload::Cpu(buffer) => Some(buffer),
            FramePayload::Gpu(_) => None,
        }
    }

    /// Mutable pixels, when this frame is the only holder.
    pub fn cpu_buffer_mut(&mut self) -> Option<&mut PooledBuffer> {
        match &mut self.payload {
            FramePayload::Cpu(buffer) => Arc::get_mut(buffer),
            FramePayload::Gpu(_) => None,
        }
    }

    pub fn surface(&self) -> Option<&GpuSurface> {
        match &self.payload {
            FramePayload::Gpu(surface) => Some(surface),
            FramePayload::Cpu(_) => None,
        }
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Content hash of the visible CPU pixels.
    pub fn checksum(&self) -> CutlineResult<u64> {
        self.cpu_buffer()
            .map(PooledBuffer::checksum)
            .ok_or_else(|| CutlineError::unsupported("checksum of a device-resident frame"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strides_are_aligned_and_planes_do_not_overlap() {
        let planes = plane_specs(PixelFormat::Yuv420p, 1921, 1081).unwrap();
        assert_eq!(planes.len(), 3);
        assert_eq!(planes[0].row_bytes, 1921);
        assert_eq!(planes[1].row_bytes, 961);
        assert_eq!(planes[1].rows, 541);
        for pair in planes.windows(2) {
            assert_eq!(pair[0].offset + pair[0].len(), pair[1].offset);
        }
        assert!(planes.iter().all(|p| p.stride % PLANE_ALIGN == 0));
        assert!(plane_specs(PixelFormat::Cuda, 16, 16).is_none());
    }

    #[test]
    fn nv12_chroma_is_interleaved() {
        let planes = plane_specs(PixelFormat::Nv12, 64, 32).unwrap();
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[1].row_bytes, 64);
        assert_eq!(planes[1].rows, 16);
    }

    #[test]
    fn black_is_limited_range_black() {
        assert_eq!(Rgba::BLACK.to_ycbcr(), (16, 128, 128));
        assert_eq!(Rgba::new(255, 255, 255, 255).to_ycbcr(), (235, 128, 128));
    }

    #[test]
    fn cpu_frames_are_tagged_cpu() {
        let pool = FramePool::new(2);
        let frame = Frame::filled(&pool, 8, 8, PixelFormat::Nv12, Rgba::BLACK).unwrap();
        assert_eq!(frame.residency(), Residency::Cpu);
        assert!(frame.surface().is_none());
        assert!(frame.checksum().is_ok());
    }
}
