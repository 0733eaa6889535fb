//! Reusable CPU frame buffers.
//!
//! Buffers are cached per (width, height, format). A buffer goes back to its
//! pool when dropped; if the pool is gone it is simply freed. The soft limit
//! caps how many buffers a key keeps, not how many can exist: an exhausted
//! key keeps allocating and logs a warning.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use cutline_common::config::PoolConfig;
use cutline_common::error::{CutlineError, CutlineResult};
use cutline_hwaccel::PixelFormat;

use crate::frame::{plane_specs, PlaneSpec, Rgba, PLANE_ALIGN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    width: u32,
    height: u32,
    format: PixelFormat,
}

/// Over-allocated storage with an aligned start offset.
struct Storage {
    data: Vec<u8>,
    offset: usize,
}

impl Storage {
    fn allocate(len: usize) -> Self {
        let data = vec![0u8; len + PLANE_ALIGN];
        let misalign = data.as_ptr() as usize % PLANE_ALIGN;
        let offset = (PLANE_ALIGN - misalign) % PLANE_ALIGN;
        Self { data, offset }
    }
}

#[derive(Default)]
struct PoolState {
    free: HashMap<PoolKey, Vec<Storage>>,
    live: HashMap<PoolKey, usize>,
    allocated: usize,
    growth_events: usize,
}

struct PoolShared {
    soft_limit: usize,
    state: Mutex<PoolState>,
}

/// Point-in-time pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Buffers ever allocated.
    pub allocated: usize,
    /// Buffers sitting in free lists.
    pub free: usize,
    /// Buffers currently handed out.
    pub outstanding: usize,
    /// Allocations made past the soft limit.
    pub growth_events: usize,
}

/// Cloneable handle to a shared buffer cache.
#[derive(Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
}

impl FramePool {
    pub fn new(soft_limit: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                soft_limit: soft_limit.max(1),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.soft_limit)
    }

    pub fn soft_limit(&self) -> usize {
        self.shared.soft_limit
    }

    /// Hand out a buffer for a CPU format. Contents are unspecified.
    pub fn acquire(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> CutlineResult<PooledBuffer> {
        if width == 0 || height == 0 {
            return Err(CutlineError::config(format!(
                "cannot allocate a {width}x{height} frame"
            )));
        }
        let planes = plane_specs(format, width, height).ok_or_else(|| {
            CutlineError::unsupported(format!("{format} frames have no CPU layout"))
        })?;
        let len = planes.iter().map(PlaneSpec::len).sum();
        let key = PoolKey {
            width,
            height,
            format,
        };

        let storage = {
            let mut state = self.lock();
            let recycled = state.free.get_mut(&key).and_then(Vec::pop);
            let storage = match recycled {
                Some(storage) => storage,
                None => {
                    let live = state.live.get(&key).copied().unwrap_or(0);
                    if live >= self.shared.soft_limit {
                        state.growth_events += 1;
                        tracing::warn!(
                            width,
                            height,
                            %format,
                            live,
                            soft_limit = self.shared.soft_limit,
                            "Frame pool exhausted; growing past soft limit"
                        );
                    }
                    state.allocated += 1;
                    Storage::allocate(len)
                }
            };
            *state.live.entry(key).or_insert(0) += 1;
            storage
        };

        Ok(PooledBuffer {
            key,
            planes,
            storage: Some(storage),
            pool: Arc::downgrade(&self.shared),
        })
    }

    /// Warm a key with `count` free buffers.
    pub fn preallocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        count: usize,
    ) -> CutlineResult<()> {
        let buffers = (0..count)
            .map(|_| self.acquire(width, height, format))
            .collect::<CutlineResult<Vec<_>>>()?;
        drop(buffers);
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            allocated: state.allocated,
            free: state.free.values().map(Vec::len).sum(),
            outstanding: state.live.values().sum(),
            growth_events: state.growth_events,
        }
    }

    /// Drop every free buffer.
    pub fn trim(&self) {
        self.lock().free.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::from_config(&PoolConfig::default())
    }
}

impl fmt::Debug for FramePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramePool")
            .field("soft_limit", &self.shared.soft_limit)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A CPU frame buffer on loan from a [`FramePool`].
pub struct PooledBuffer {
    key: PoolKey,
    planes: Vec<PlaneSpec>,
    storage: Option<Storage>,
    pool: Weak<PoolShared>,
}

impl PooledBuffer {
    pub fn width(&self) -> u32 {
        self.key.width
    }

    pub fn height(&self) -> u32 {
        self.key.height
    }

    pub fn format(&self) -> PixelFormat {
        self.key.format
    }

    pub fn planes(&self) -> &[PlaneSpec] {
        &self.planes
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn stride(&self, plane: usize) -> usize {
        self.planes[plane].stride
    }

    fn bytes(&self) -> &[u8] {
        match &self.storage {
            Some(s) => &s.data[s.offset..],
            None => &[],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Some(s) => &mut s.data[s.offset..],
            None => &mut [],
        }
    }

    /// Whole plane including stride padding.
    pub fn plane(&self, plane: usize) -> &[u8] {
        let spec = self.planes[plane];
        &self.bytes()[spec.offset..spec.offset + spec.len()]
    }

    pub fn plane_mut(&mut self, plane: usize) -> &mut [u8] {
        let spec = self.planes[plane];
        &mut self.bytes_mut()[spec.offset..spec.offset + spec.len()]
    }

    /// Visible bytes of one row.
    pub fn row(&self, plane: usize, row: usize) -> &[u8] {
        let spec = self.planes[plane];
        let start = row * spec.stride;
        &self.plane(plane)[start..start + spec.row_bytes]
    }

    pub fn row_mut(&mut self, plane: usize, row: usize) -> &mut [u8] {
        let spec = self.planes[plane];
        let start = row * spec.stride;
        &mut self.plane_mut(plane)[start..start + spec.row_bytes]
    }

    /// Base pointer of a plane, for native copy routines.
    pub fn plane_ptr(&mut self, plane: usize) -> *mut u8 {
        self.plane_mut(plane).as_mut_ptr()
    }

    /// Copy visible rows from a strided source plane.
    pub fn copy_plane_from(&mut self, plane: usize, src: &[u8], src_stride: usize) {
        let spec = self.planes[plane];
        for row in 0..spec.rows {
            let from = &src[row * src_stride..row * src_stride + spec.row_bytes];
            self.row_mut(plane, row).copy_from_slice(from);
        }
    }

    /// Fill with a solid colour.
    pub fn fill(&mut self, color: Rgba) -> CutlineResult<()> {
        let (y, cb, cr) = color.to_ycbcr();
        match self.format() {
            PixelFormat::Yuv420p => {
                self.fill_plane(0, &[y]);
                self.fill_plane(1, &[cb]);
                self.fill_plane(2, &[cr]);
            }
            PixelFormat::Nv12 => {
                self.fill_plane(0, &[y]);
                self.fill_plane(1, &[cb, cr]);
            }
            PixelFormat::P010le => {
                let wide = |v: u8| (u16::from(v) << 8).to_le_bytes();
                let (yl, cbl, crl) = (wide(y), wide(cb), wide(cr));
                self.fill_plane(0, &yl);
                self.fill_plane(1, &[cbl[0], cbl[1], crl[0], crl[1]]);
            }
            PixelFormat::Rgba => self.fill_plane(0, &[color.r, color.g, color.b, color.a]),
            PixelFormat::Bgra => self.fill_plane(0, &[color.b, color.g, color.r, color.a]),
            PixelFormat::Rgb24 => self.fill_plane(0, &[color.r, color.g, color.b]),
            other => {
                return Err(CutlineError::unsupported(format!("cannot fill {other} frames")));
            }
        }
        Ok(())
    }

    fn fill_plane(&mut self, plane: usize, pattern: &[u8]) {
        let rows = self.planes[plane].rows;
        for row in 0..rows {
            for (dst, src) in self
                .row_mut(plane, row)
                .iter_mut()
                .zip(pattern.iter().cycle())
            {
                *dst = *src;
            }
        }
    }

    /// FNV-1a over the visible bytes of every plane.
    pub fn checksum(&self) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for plane in 0..self.planes.len() {
            for row in 0..self.planes[plane].rows {
                for byte in self.row(plane, row) {
                    hash ^= u64::from(*byte);
                    hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
                }
            }
        }
        hash
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("width", &self.key.width)
            .field("height", &self.key.height)
            .field("format", &self.key.format)
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(storage) = self.storage.take() else {
            return;
        };
        let Some(shared) = self.pool.upgrade() else {
            return;
        };
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(live) = state.live.get_mut(&self.key) {
            *live = live.saturating_sub(1);
        }
        let free = state.free.entry(self.key).or_default();
        if free.len() < shared.soft_limit {
            free.push(storage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn buffers_are_recycled_per_key() {
        let pool = FramePool::new(4);
        let first = pool.acquire(64, 32, PixelFormat::Nv12).unwrap();
        let addr = first.plane(0).as_ptr();
        drop(first);
        let second = pool.acquire(64, 32, PixelFormat::Nv12).unwrap();
        assert_eq!(second.plane(0).as_ptr(), addr);
        assert_eq!(pool.stats().allocated, 1);

        let other = pool.acquire(32, 32, PixelFormat::Nv12).unwrap();
        assert_eq!(pool.stats().allocated, 2);
        drop(other);
    }

    #[test]
    fn planes_are_aligned() {
        let pool = FramePool::new(2);
        let mut buffer = pool.acquire(33, 17, PixelFormat::Yuv420p).unwrap();
        for plane in 0..buffer.plane_count() {
            assert_eq!(buffer.plane_ptr(plane) as usize % PLANE_ALIGN, 0);
        }
    }

    #[test]
    fn exhaustion_grows_past_soft_limit() {
        let pool = FramePool::new(2);
        let held: Vec<_> = (0..3)
            .map(|_| pool.acquire(16, 16, PixelFormat::Rgba).unwrap())
            .collect();
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 3);
        assert_eq!(stats.growth_events, 1);
        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.free, 2);
    }

    #[test]
    fn buffers_outlive_their_pool() {
        let pool = FramePool::new(1);
        let buffer = pool.acquire(8, 8, PixelFormat::Rgb24).unwrap();
        drop(pool);
        assert_eq!(buffer.row(0, 0).len(), 24);
    }

    #[test]
    fn device_formats_and_empty_frames_are_rejected() {
        let pool = FramePool::default();
        assert!(pool.acquire(16, 16, PixelFormat::Vaapi).is_err());
        assert!(pool.acquire(0, 16, PixelFormat::Nv12).is_err());
    }

    #[test]
    fn checksum_ignores_stride_padding() {
        let pool = FramePool::new(2);
        let mut a = pool.acquire(10, 2, PixelFormat::Rgb24).unwrap();
        a.fill(Rgba::BLACK).unwrap();
        let before = a.checksum();
        let stride = a.stride(0);
        a.plane_mut(0)[stride - 1] = 0xff;
        assert_eq!(a.checksum(), before);
    }

    proptest! {
        #[test]
        fn accounting_balances(ops in proptest::collection::vec(0u8..3, 1..64)) {
            let pool = FramePool::new(3);
            let mut held = Vec::new();
            for op in ops {
                match op {
                    0 | 1 => held.push(pool.acquire(16, 8, PixelFormat::Nv12).unwrap()),
                    _ => { held.pop(); }
                }
                let stats = pool.stats();
                prop_assert_eq!(stats.outstanding, held.len());
                prop_assert!(stats.free <= pool.soft_limit());
                prop_assert!(stats.allocated >= stats.outstanding);
            }
        }
    }
}
