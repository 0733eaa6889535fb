//! Owned `AVFrame`s and the copies between them and pooled buffers.

use std::any::Any;
use std::ffi::c_int;

use ffmpeg_sys_next as ffi;

use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::ffmpeg::sys::check_ffmpeg;
use cutline_hwaccel::{classify_residency, HardwareBackend, PixelFormat, Residency};

use super::mapping::{
    av_color_range, av_color_space, av_color_transfer, color_from_av, from_raw_pixel_format,
    timestamp, to_av_pixel_format,
};
use crate::frame::{ColorMetadata, DeviceSurface, Frame, GpuSurface};
use crate::pool::{FramePool, PooledBuffer};

fn out_of_memory() -> CutlineError {
    std::io::Error::from(std::io::ErrorKind::OutOfMemory).into()
}

/// An `AVFrame` freed on drop.
pub struct OwnedFrame {
    ptr: *mut ffi::AVFrame,
}

// SAFETY: an AVFrame is plain data plus refcounted buffers; it is only
// touched through &mut self or after being cloned.
unsafe impl Send for OwnedFrame {}
unsafe impl Sync for OwnedFrame {}

impl OwnedFrame {
    pub fn alloc() -> CutlineResult<Self> {
        // SAFETY: av_frame_alloc has no preconditions.
        let ptr = unsafe { ffi::av_frame_alloc() };
        if ptr.is_null() {
            return Err(out_of_memory());
        }
        Ok(Self { ptr })
    }

    /// New reference to the same buffers.
    pub fn try_clone(&self) -> CutlineResult<Self> {
        // SAFETY: self.ptr is a valid frame.
        let ptr = unsafe { ffi::av_frame_clone(self.ptr) };
        if ptr.is_null() {
            return Err(out_of_memory());
        }
        Ok(Self { ptr })
    }

    pub fn as_ptr(&self) -> *const ffi::AVFrame {
        self.ptr
    }

    pub fn as_mut_ptr(&mut self) -> *mut ffi::AVFrame {
        self.ptr
    }

    pub fn unref(&mut self) {
        // SAFETY: self.ptr is a valid frame.
        unsafe { ffi::av_frame_unref(self.ptr) };
    }

    pub fn width(&self) -> u32 {
        // SAFETY: self.ptr is a valid frame.
        unsafe { (*self.ptr).width.max(0) as u32 }
    }

    pub fn height(&self) -> u32 {
        // SAFETY: self.ptr is a valid frame.
        unsafe { (*self.ptr).height.max(0) as u32 }
    }

    pub fn raw_format(&self) -> c_int {
        // SAFETY: self.ptr is a valid frame.
        unsafe { (*self.ptr).format }
    }

    pub fn format(&self) -> Option<PixelFormat> {
        from_raw_pixel_format(self.raw_format())
    }

    pub fn has_device_context(&self) -> bool {
        // SAFETY: self.ptr is a valid frame.
        unsafe { !(*self.ptr).hw_frames_ctx.is_null() }
    }

    /// Best presentation timestamp the decoder could determine.
    pub fn best_pts(&self) -> Option<i64> {
        // SAFETY: self.ptr is a valid frame.
        let (best, pts) = unsafe { ((*self.ptr).best_effort_timestamp, (*self.ptr).pts) };
        timestamp(best).or_else(|| timestamp(pts))
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        // SAFETY: self.ptr is a valid frame.
        unsafe { (*self.ptr).pts = pts.unwrap_or(ffi::AV_NOPTS_VALUE) };
    }

    pub fn color(&self) -> ColorMetadata {
        // SAFETY: self.ptr is a valid frame.
        unsafe {
            color_from_av(
                (*self.ptr).color_range,
                (*self.ptr).colorspace,
                (*self.ptr).color_trc,
            )
        }
    }

    pub fn set_color(&mut self, color: &ColorMetadata) {
        // SAFETY: self.ptr is a valid frame.
        unsafe {
            (*self.ptr).color_range = av_color_range(color);
            (*self.ptr).colorspace = av_color_space(color);
            (*self.ptr).color_trc = av_color_transfer(color);
        }
    }

    /// Residency of the native frame for a session on `backend`.
    pub fn residency(&self, backend: HardwareBackend) -> Residency {
        classify_residency(self.format(), self.has_device_context(), backend)
    }
}

impl Drop for OwnedFrame {
    fn drop(&mut self) {
        // SAFETY: self.ptr came from av_frame_alloc/clone and is freed once.
        unsafe { ffi::av_frame_free(&mut self.ptr) };
    }
}

/// A decoded or uploaded frame living in device memory.
pub struct FfmpegSurface {
    backend: HardwareBackend,
    frame: OwnedFrame,
}

impl FfmpegSurface {
    pub fn new(backend: HardwareBackend, frame: OwnedFrame) -> Self {
        Self { backend, frame }
    }

    pub fn frame(&self) -> &OwnedFrame {
        &self.frame
    }

    /// Wrap as a pipeline frame.
    pub fn into_frame(self, pts: Option<i64>) -> Frame {
        let (width, height, color) = (self.frame.width(), self.frame.height(), self.frame.color());
        Frame::gpu(GpuSurface::new(self), width, height, pts, color)
    }
}

impl std::fmt::Debug for FfmpegSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FfmpegSurface")
            .field("backend", &self.backend)
            .field("width", &self.frame.width())
            .field("height", &self.frame.height())
            .finish()
    }
}

impl DeviceSurface for FfmpegSurface {
    fn backend(&self) -> HardwareBackend {
        self.backend
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Copy a CPU `AVFrame` in a supported layout into a pooled buffer.
pub fn copy_to_pool(
    frame: &OwnedFrame,
    format: PixelFormat,
    pool: &FramePool,
) -> CutlineResult<PooledBuffer> {
    let mut buffer = pool.acquire(frame.width(), frame.height(), format)?;
    let raw = frame.as_ptr();
    for plane in 0..buffer.plane_count() {
        let spec = buffer.planes()[plane];
        // SAFETY: the frame holds `rows` lines of `linesize` bytes in each
        // plane of this layout.
        let (data, linesize) = unsafe { ((*raw).data[plane], (*raw).linesize[plane]) };
        if data.is_null() || linesize <= 0 {
            return Err(CutlineError::decode(format!(
                "decoded {format} frame is missing plane {plane}"
            )));
        }
        let stride = linesize as usize;
        let len = stride * (spec.rows - 1) + spec.row_bytes;
        // SAFETY: see above; `len` ends at the last visible byte.
        let src = unsafe { std::slice::from_raw_parts(data, len) };
        buffer.copy_plane_from(plane, src, stride);
    }
    Ok(buffer)
}

/// A non-refcounted `AVFrame` that points into `buffer`.
///
/// libavcodec copies non-refcounted input, so the view only has to outlive
/// the call it is passed to.
pub fn borrow_buffer(
    buffer: &PooledBuffer,
    pts: Option<i64>,
    color: &ColorMetadata,
) -> CutlineResult<OwnedFrame> {
    let mut frame = OwnedFrame::alloc()?;
    let raw = frame.as_mut_ptr();
    // SAFETY: raw is a freshly allocated frame with no buffers attached; the
    // plane pointers stay valid while `buffer` is borrowed.
    unsafe {
        (*raw).width = buffer.width() as c_int;
        (*raw).height = buffer.height() as c_int;
        (*raw).format = to_av_pixel_format(buffer.format()) as c_int;
        for plane in 0..buffer.plane_count() {
            (*raw).data[plane] = buffer.plane(plane).as_ptr() as *mut u8;
            (*raw).linesize[plane] = buffer.stride(plane) as c_int;
        }
    }
    frame.set_pts(pts);
    frame.set_color(color);
    Ok(frame)
}

/// Move a device frame into system memory.
pub fn transfer_from_device(frame: &OwnedFrame) -> CutlineResult<OwnedFrame> {
    let mut cpu = OwnedFrame::alloc()?;
    // SAFETY: both frames are valid; av_hwframe_transfer_data allocates the
    // destination buffers in the device's transfer layout.
    let ret = unsafe { ffi::av_hwframe_transfer_data(cpu.as_mut_ptr(), frame.as_ptr(), 0) };
    check_ffmpeg(ret, "av_hwframe_transfer_data").map_err(|e| e.into_hardware())?;
    // SAFETY: both frames are valid.
    let ret = unsafe { ffi::av_frame_copy_props(cpu.as_mut_ptr(), frame.as_ptr()) };
    check_ffmpeg(ret, "av_frame_copy_props").map_err(|e| e.into_hardware())?;
    Ok(cpu)
}
