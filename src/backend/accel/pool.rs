//! Device buffer pooling
//!
//! Buffers are bucketed by power-of-two byte size. A released buffer goes
//! back to its bucket and is handed out again to the next request that rounds
//! to the same size.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Maximum number of buffers per size bucket
    pub max_buffers_per_bucket: usize,
    /// Maximum total buffers across all buckets
    pub max_total_buffers: usize,
    /// Buffers above this many bytes are never pooled
    pub max_pooled_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            max_buffers_per_bucket: 8,
            max_total_buffers: 64,
            max_pooled_size: 64 * 1024 * 1024,
        }
    }
}

struct Buckets<T> {
    free: HashMap<u32, VecDeque<T>>,
    total: usize,
}

/// Pool of reusable buffers keyed by `log2(size)`
///
/// Generic over the buffer type so the bucketing rules are testable without
/// a device.
pub struct BufferPool<T = wgpu::Buffer> {
    buckets: Mutex<Buckets<T>>,
    config: BufferPoolConfig,
}

/// Usage counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub total_pooled: usize,
    /// `(bucket_size, count)` per non-empty bucket
    pub buckets: Vec<(usize, usize)>,
}

impl<T> BufferPool<T> {
    #[must_use]
    pub fn new(config: BufferPoolConfig) -> Self {
        Self {
            buckets: Mutex::new(Buckets {
                free: HashMap::new(),
                total: 0,
            }),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buckets<T>> {
        self.buckets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Bucket index: `log2` of the next power of two
    const fn size_to_bucket(size: usize) -> u32 {
        if size <= 1 {
            return 0;
        }
        usize::BITS - (size - 1).leading_zeros()
    }

    const fn bucket_to_size(bucket: u32) -> usize {
        1usize << bucket
    }

    /// Bytes to allocate for a request of `min_size`, so that the buffer can
    /// serve any request in the same bucket
    #[must_use]
    pub const fn allocation_size(min_size: usize) -> usize {
        if min_size == 0 {
            return 0;
        }
        Self::bucket_to_size(Self::size_to_bucket(min_size))
    }

    /// A pooled buffer of at least `min_size` bytes, if one is free
    pub fn acquire(&self, min_size: usize) -> Option<T> {
        if min_size > self.config.max_pooled_size {
            return None;
        }
        let bucket = Self::size_to_bucket(min_size);
        let mut b = self.lock();
        let buffer = b.free.get_mut(&bucket)?.pop_front()?;
        b.total -= 1;
        Some(buffer)
    }

    /// Return a buffer of `size` requested bytes; `false` when the pool
    /// declines it (too large or full) and it should be dropped
    pub fn release(&self, buffer: T, size: usize) -> bool {
        if size > self.config.max_pooled_size {
            return false;
        }
        let bucket = Self::size_to_bucket(size);
        let mut b = self.lock();
        if b.total >= self.config.max_total_buffers {
            return false;
        }
        let queue = b.free.entry(bucket).or_default();
        if queue.len() >= self.config.max_buffers_per_bucket {
            return false;
        }
        queue.push_back(buffer);
        b.total += 1;
        true
    }

    /// Drop every pooled buffer
    pub fn clear(&self) {
        let mut b = self.lock();
        b.free.clear();
        b.total = 0;
    }

    pub fn stats(&self) -> BufferPoolStats {
        let b = self.lock();
        let mut buckets: Vec<(usize, usize)> = b
            .free
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(&bucket, q)| (Self::bucket_to_size(bucket), q.len()))
            .collect();
        buckets.sort_unstable();
        BufferPoolStats {
            total_pooled: b.total,
            buckets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Pool = BufferPool<u32>;

    #[test]
    fn sizes_round_to_power_of_two_buckets() {
        assert_eq!(Pool::size_to_bucket(1), 0);
        assert_eq!(Pool::size_to_bucket(4), 2);
        assert_eq!(Pool::size_to_bucket(1000), 10);
        assert_eq!(Pool::size_to_bucket(5000), 13);
        assert_eq!(Pool::allocation_size(3), 4);
        assert_eq!(Pool::allocation_size(1000), 1024);
        assert_eq!(Pool::allocation_size(0), 0);
    }

    #[test]
    fn released_buffers_are_reused_within_a_bucket() {
        let pool = Pool::new(BufferPoolConfig::default());
        assert!(pool.release(7, 600));
        assert_eq!(pool.acquire(1024), Some(7));
        assert_eq!(pool.acquire(1024), None);
    }

    #[test]
    fn limits_are_enforced() {
        let pool = Pool::new(BufferPoolConfig {
            max_buffers_per_bucket: 2,
            max_total_buffers: 3,
            max_pooled_size: 1024,
        });
        assert!(!pool.release(0, 2048));
        assert!(pool.acquire(2048).is_none());
        assert!(pool.release(1, 16));
        assert!(pool.release(2, 16));
        assert!(!pool.release(3, 16));
        assert!(pool.release(4, 64));
        assert!(!pool.release(5, 256));
        assert_eq!(
            pool.stats(),
            BufferPoolStats {
                total_pooled: 3,
                buckets: vec![(16, 2), (64, 1)],
            }
        );
        pool.clear();
        assert_eq!(pool.stats().total_pooled, 0);
    }
}
