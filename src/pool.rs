// ============================================================================
// SURFACE POOL — recycle pixel buffers to avoid large-allocation churn
// ============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Weak;

use image::RgbaImage;

use crate::canvas::{Surface, SurfaceId};
use crate::settings::EngineSettings;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid surface dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
}

/// A pooled buffer is only reused for requests needing at least
/// `1 / MAX_SLACK` of its capacity.
const MAX_SLACK: usize = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub in_use: usize,
    pub available: usize,
    pub pooled_bytes: usize,
    pub in_use_bytes: usize,
}

/// A pool of RGBA buffers.
///
/// When a layer is deleted, merged or flattened its surface goes back into
/// the pool.  A later `acquire` of a similar size reuses the allocation.
/// Surfaces are moved in and out by value, so nothing can keep using a
/// surface after it has been released.
pub struct SurfacePool {
    free: Vec<(SurfaceId, Vec<u8>)>,
    free_ids: HashSet<SurfaceId>,
    /// Surfaces handed out by this pool and their buffer size.  Entries
    /// whose surface was dropped without a release are pruned on acquire.
    checked_out: HashMap<SurfaceId, (Weak<()>, usize)>,
    max_free: usize,
    soft_limit_bytes: usize,
    over_limit_warned: bool,
}

impl SurfacePool {
    pub fn new(max_free: usize) -> Self {
        Self {
            free: Vec::new(),
            free_ids: HashSet::new(),
            checked_out: HashMap::new(),
            max_free,
            soft_limit_bytes: usize::MAX,
            over_limit_warned: false,
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        let mut pool = Self::new(settings.pool_max_free);
        pool.soft_limit_bytes = settings.pool_soft_limit_mb.saturating_mul(1024 * 1024);
        pool
    }

    pub fn with_soft_limit(mut self, bytes: usize) -> Self {
        self.soft_limit_bytes = bytes;
        self
    }

    /// Hand out a `width`×`height` surface, reusing the closest-fitting free
    /// buffer when one is large enough.  Reused pixels are NOT cleared.
    pub fn acquire(&mut self, width: u32, height: u32) -> Result<Surface, PoolError> {
        let needed = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(4))
            .filter(|n| *n > 0)
            .ok_or(PoolError::InvalidDimensions { width, height })?;

        self.prune_dropped();
        let best = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, (_, buf))| buf.capacity() >= needed && buf.capacity() / MAX_SLACK <= needed)
            .min_by_key(|(_, (_, buf))| buf.capacity())
            .map(|(i, _)| i);

        let surface = match best {
            Some(i) => {
                let (id, mut buf) = self.free.swap_remove(i);
                self.free_ids.remove(&id);
                buf.resize(needed, 0);
                match RgbaImage::from_raw(width, height, buf) {
                    Some(image) => Surface::with_id(id, image),
                    None => Surface::new(width, height),
                }
            }
            None => Surface::new(width, height),
        };

        self.checked_out.insert(surface.id(), (surface.lease(), surface.memory_bytes()));
        self.check_soft_limit();
        Ok(surface)
    }

    /// Like `acquire`, but the returned surface is fully transparent.
    pub fn acquire_cleared(&mut self, width: u32, height: u32) -> Result<Surface, PoolError> {
        let mut surface = self.acquire(width, height)?;
        surface.clear();
        Ok(surface)
    }

    /// Return a surface to the pool.  Surfaces not issued by this pool are
    /// adopted.  Returns `false` if a buffer with the same id is already in
    /// the free list; the free list is left untouched in that case.
    pub fn release(&mut self, surface: Surface) -> bool {
        let id = surface.id();
        if self.free_ids.contains(&id) {
            log_warn!("SurfacePool: rejected double release of surface {}", id.raw());
            return false;
        }
        self.checked_out.remove(&id);
        if self.over_limit_warned && self.in_use_bytes() <= self.soft_limit_bytes {
            self.over_limit_warned = false;
        }
        if self.free.len() >= self.max_free {
            // Pool full: the buffer is dropped here.
            return true;
        }
        let (id, image) = surface.into_parts();
        self.free_ids.insert(id);
        self.free.push((id, image.into_raw()));
        true
    }

    /// Drop all pooled buffers (e.g. on project switch or shutdown).
    pub fn clear(&mut self) {
        self.free.clear();
        self.free_ids.clear();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            in_use: self.live_checked_out().count(),
            available: self.free.len(),
            pooled_bytes: self.free.iter().map(|(_, b)| b.capacity()).sum(),
            in_use_bytes: self.in_use_bytes(),
        }
    }

    fn live_checked_out(&self) -> impl Iterator<Item = usize> + '_ {
        self.checked_out
            .values()
            .filter(|(lease, _)| lease.strong_count() > 0)
            .map(|(_, bytes)| *bytes)
    }

    fn in_use_bytes(&self) -> usize {
        self.live_checked_out().sum()
    }

    /// Forget surfaces that were dropped instead of released.
    fn prune_dropped(&mut self) {
        let before = self.checked_out.len();
        self.checked_out.retain(|_, (lease, _)| lease.strong_count() > 0);
        let dropped = before - self.checked_out.len();
        if dropped > 0 {
            log_info!("SurfacePool: {} surfaces were dropped without release", dropped);
        }
    }

    fn check_soft_limit(&mut self) {
        let in_use = self.in_use_bytes();
        if in_use > self.soft_limit_bytes && !self.over_limit_warned {
            self.over_limit_warned = true;
            log_warn!(
                "SurfacePool: {} MiB of surfaces in use exceeds soft limit of {} MiB",
                in_use / (1024 * 1024),
                self.soft_limit_bytes / (1024 * 1024)
            );
        }
    }
}

impl Default for SurfacePool {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn release_then_acquire_reuses_buffer_without_clearing() {
        let mut pool = SurfacePool::new(4);
        let mut s = pool.acquire(8, 8).expect("valid size");
        s.fill(Rgba([1, 2, 3, 4]));
        let id = s.id();
        assert!(pool.release(s));

        let again = pool.acquire(8, 8).expect("valid size");
        assert_eq!(again.id(), id);
        assert_eq!(*again.image().get_pixel(0, 0), Rgba([1, 2, 3, 4]));

        let cleared = pool.acquire_cleared(8, 8).expect("valid size");
        assert_eq!(*cleared.image().get_pixel(7, 7), Rgba([0, 0, 0, 0]));
    }

    #[test]
    fn prefers_closest_fitting_buffer() {
        let mut pool = SurfacePool::new(4);
        let big = pool.acquire(64, 64).expect("valid size");
        let close = pool.acquire(20, 20).expect("valid size");
        let close_id = close.id();
        pool.release(big);
        pool.release(close);

        let s = pool.acquire(19, 19).expect("valid size");
        assert_eq!(s.id(), close_id);
        assert_eq!((s.width(), s.height()), (19, 19));
    }

    #[test]
    fn oversized_buffers_are_not_used_for_tiny_requests() {
        let mut pool = SurfacePool::new(4);
        let big = pool.acquire(64, 64).expect("valid size");
        let big_id = big.id();
        pool.release(big);
        let tiny = pool.acquire(2, 2).expect("valid size");
        assert_ne!(tiny.id(), big_id);
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn double_release_is_rejected() {
        let mut pool = SurfacePool::new(4);
        let s = pool.acquire(4, 4).expect("valid size");
        let id = s.id();
        assert!(pool.release(s));
        let forged = Surface::with_id(id, RgbaImage::new(4, 4));
        assert!(!pool.release(forged));
        assert_eq!(pool.stats().available, 1);

        // Two acquires must never hand out the same buffer.
        let a = pool.acquire(4, 4).expect("valid size");
        let b = pool.acquire(4, 4).expect("valid size");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn stats_track_in_use_and_available() {
        let mut pool = SurfacePool::new(1);
        let a = pool.acquire(4, 4).expect("valid size");
        let b = pool.acquire(4, 4).expect("valid size");
        assert_eq!(pool.stats().in_use, 2);
        assert_eq!(pool.stats().in_use_bytes, 128);
        pool.release(a);
        pool.release(b);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        // Capped at max_free.
        assert_eq!(stats.available, 1);
    }

    #[test]
    fn zero_size_is_invalid() {
        let mut pool = SurfacePool::new(1);
        assert_eq!(
            pool.acquire(0, 5).err(),
            Some(PoolError::InvalidDimensions { width: 0, height: 5 })
        );
    }

    #[test]
    fn exceeding_soft_limit_still_allocates() {
        let mut pool = SurfacePool::new(1).with_soft_limit(16);
        let a = pool.acquire(8, 8).expect("first");
        let b = pool.acquire(8, 8).expect("second");
        assert_eq!(pool.stats().in_use, 2);
        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn dropped_surfaces_stop_counting_as_in_use() {
        let mut pool = SurfacePool::new(2);
        let kept = pool.acquire(4, 4).expect("valid size");
        for _ in 0..10 {
            drop(pool.acquire(4, 4).expect("valid size"));
        }
        assert_eq!(pool.stats().in_use, 1);
        assert_eq!(pool.stats().in_use_bytes, 64);
        let small = pool.acquire(2, 2).expect("valid size");
        pool.release(small);
        assert_eq!(pool.checked_out.len(), 1);
        pool.release(kept);
        assert_eq!(pool.stats().in_use, 0);
    }
}
