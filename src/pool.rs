//! Shape-keyed buffer recycling.
//!
//! A `BufferPool` is owned by exactly one activity at a time (the capture
//! thread, or the pipeline engine inside a session). All methods take
//! `&mut self`, so sharing a pool between independent owners requires an
//! explicit hand-off; there is no internal locking.

use std::collections::HashMap;

use crate::frame::{BinaryMask, GrayBuffer, Shape};

/// Default number of cached buffers per shape.
pub const DEFAULT_POOL_CAPACITY: usize = 100;

/// Diagnostic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// `get` served from the cache.
    pub hits: u64,
    /// `get` had to allocate.
    pub misses: u64,
    /// `release` accepted the buffer.
    pub returned: u64,
    /// `release` dropped the buffer (shape mismatch or pool full).
    pub discarded: u64,
}

pub struct BufferPool {
    free: HashMap<Shape, Vec<Vec<u8>>>,
    capacity: usize,
    stats: PoolStats,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Pool caching at most `capacity` buffers per shape.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            free: HashMap::new(),
            capacity,
            stats: PoolStats::default(),
        }
    }

    /// Buffer of `shape.len()` bytes. Reused buffers keep stale contents.
    pub fn get(&mut self, shape: Shape) -> Vec<u8> {
        if let Some(buffer) = self.free.get_mut(&shape).and_then(|bucket| bucket.pop()) {
            self.stats.hits += 1;
            return buffer;
        }
        self.stats.misses += 1;
        vec![0; shape.len()]
    }

    /// Return `buffer` under `shape`. Returns `false` when it was discarded.
    pub fn release(&mut self, shape: Shape, buffer: Vec<u8>) -> bool {
        if buffer.len() != shape.len() {
            self.stats.discarded += 1;
            return false;
        }
        let bucket = self.free.entry(shape).or_default();
        if bucket.len() >= self.capacity {
            self.stats.discarded += 1;
            return false;
        }
        bucket.push(buffer);
        self.stats.returned += 1;
        true
    }

    pub fn gray(&mut self, width: u32, height: u32) -> GrayBuffer {
        let shape = Shape::single(width, height);
        let data = self.get(shape);
        GrayBuffer::from_vec(width, height, data)
            .unwrap_or_else(|_| GrayBuffer::new(width, height))
    }

    pub fn mask(&mut self, width: u32, height: u32) -> BinaryMask {
        let data = self.get(Shape::single(width, height));
        BinaryMask::from_raw(width, height, data)
    }

    pub fn release_gray(&mut self, gray: GrayBuffer) -> bool {
        let shape = gray.shape();
        self.release(shape, gray.into_vec())
    }

    pub fn release_mask(&mut self, mask: BinaryMask) -> bool {
        let shape = mask.shape();
        self.release(shape, mask.into_vec())
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Cached buffers for `shape`.
    pub fn available(&self, shape: Shape) -> usize {
        self.free.get(&shape).map_or(0, Vec::len)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_reuses_released_buffer() {
        let mut pool = BufferPool::new();
        let shape = Shape::single(8, 4);

        let buf = pool.get(shape);
        assert_eq!(buf.len(), 32);
        assert_eq!(pool.stats().misses, 1);

        assert!(pool.release(shape, buf));
        let again = pool.get(shape);
        assert_eq!(again.len(), 32);
        assert_eq!(pool.stats().hits, 1);
        assert_eq!(pool.available(shape), 0);
    }

    #[test]
    fn release_discards_mismatched_shape() {
        let mut pool = BufferPool::new();
        let shape = Shape::rgb(4, 4);
        assert!(!pool.release(shape, vec![0; 10]));
        assert_eq!(pool.available(shape), 0);
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn release_respects_capacity_ceiling() {
        let mut pool = BufferPool::with_capacity(2);
        let shape = Shape::single(2, 2);
        assert!(pool.release(shape, vec![0; 4]));
        assert!(pool.release(shape, vec![0; 4]));
        assert!(!pool.release(shape, vec![0; 4]));
        assert_eq!(pool.available(shape), 2);
    }

    #[test]
    fn shapes_are_kept_apart() {
        let mut pool = BufferPool::new();
        pool.release(Shape::single(4, 4), vec![0; 16]);
        let rgb = pool.get(Shape::rgb(4, 4));
        assert_eq!(rgb.len(), 48);
        assert_eq!(pool.stats().hits, 0);
        assert_eq!(pool.available(Shape::single(4, 4)), 1);
    }

    #[test]
    fn typed_helpers_round_trip_through_pool() {
        let mut pool = BufferPool::new();
        let gray = pool.gray(5, 3);
        assert_eq!(gray.as_slice().len(), 15);
        pool.release_gray(gray);

        // A mask of the same geometry reuses the gray buffer's storage.
        let mask = pool.mask(5, 3);
        assert_eq!(mask.as_slice().len(), 15);
        assert_eq!(pool.stats().hits, 1);
        pool.release_mask(mask);
        assert_eq!(pool.available(Shape::single(5, 3)), 1);
    }
}
