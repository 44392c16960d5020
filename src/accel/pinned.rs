use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Small tier: 64 KiB buffers (metadata rows, small gradients).
const SMALL_BUF_CAPACITY: usize = 64 * 1024;
const SMALL_POOL_SIZE: usize = 64;

/// Large tier: 8 MiB buffers (dense gradient shadows).
const LARGE_BUF_CAPACITY: usize = 8 * 1024 * 1024;
const LARGE_POOL_SIZE: usize = 8;

/// A tiered lock-free recycler for pinned host shadow buffers.
///
/// Buffers are allocated lazily on first checkout and recycled into the
/// matching tier queue on drop. Requests beyond the large tier capacity are
/// served unpooled. Buffers that have grown past 4x their tier's capacity
/// are dropped instead of returned.
pub struct PinnedPool {
    small: ArrayQueue<Vec<u8>>,
    large: ArrayQueue<Vec<u8>>,
}

#[derive(Debug, Clone, Copy)]
enum PoolTier {
    Small,
    Large,
    Unpooled,
}

impl PinnedPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            small: ArrayQueue::new(SMALL_POOL_SIZE),
            large: ArrayQueue::new(LARGE_POOL_SIZE),
        })
    }

    /// Check out a buffer resized to `len` bytes (zeroed).
    pub fn checkout(self: &Arc<Self>, len: usize) -> PinnedBuf {
        let (queue, tier, capacity) = self.tier_for_size(len);
        let mut buf = match queue {
            Some(q) => q.pop().unwrap_or_else(|| Vec::with_capacity(capacity)),
            None => Vec::with_capacity(len),
        };
        buf.clear();
        buf.resize(len, 0);
        PinnedBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
            tier,
        }
    }

    fn tier_for_size(&self, len: usize) -> (Option<&ArrayQueue<Vec<u8>>>, PoolTier, usize) {
        if len <= SMALL_BUF_CAPACITY {
            (Some(&self.small), PoolTier::Small, SMALL_BUF_CAPACITY)
        } else if len <= LARGE_BUF_CAPACITY {
            (Some(&self.large), PoolTier::Large, LARGE_BUF_CAPACITY)
        } else {
            (None, PoolTier::Unpooled, len)
        }
    }

    fn return_buf(&self, buf: Vec<u8>, tier: PoolTier) {
        let (queue, max_cap) = match tier {
            PoolTier::Small => (Some(&self.small), SMALL_BUF_CAPACITY * 4),
            PoolTier::Large => (Some(&self.large), LARGE_BUF_CAPACITY * 4),
            PoolTier::Unpooled => (None, 0),
        };
        if let Some(q) = queue
            && buf.capacity() <= max_cap
        {
            let _ = q.push(buf);
        }
    }
}

/// A buffer checked out from a [`PinnedPool`]. Derefs to `[u8]` and returns
/// itself to the pool on drop.
pub struct PinnedBuf {
    buf: Option<Vec<u8>>,
    pool: Arc<PinnedPool>,
    tier: PoolTier,
}

impl Deref for PinnedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Invariant: `buf` is `Some` from construction until `Drop`.
        self.buf.as_ref().expect("PinnedBuf used after drop")
    }
}

impl DerefMut for PinnedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().expect("PinnedBuf used after drop")
    }
}

impl Drop for PinnedBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.return_buf(buf, self.tier);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_zeroed() {
        let pool = PinnedPool::new();
        let buf = pool.checkout(100);
        assert_eq!(buf.len(), 100);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_recycled_buffer_is_rezeroed() {
        let pool = PinnedPool::new();
        let mut buf = pool.checkout(16);
        buf[0] = 0xAA;
        drop(buf);
        let buf2 = pool.checkout(16);
        assert!(buf2.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_large_and_unpooled_sizes() {
        let pool = PinnedPool::new();
        let large = pool.checkout(1024 * 1024);
        assert_eq!(large.len(), 1024 * 1024);
        let unpooled = pool.checkout(16 * 1024 * 1024);
        assert_eq!(unpooled.len(), 16 * 1024 * 1024);
    }

    #[test]
    fn test_deref_mut() {
        let pool = PinnedPool::new();
        let mut buf = pool.checkout(4);
        buf[1] = 0xBB;
        assert_eq!(buf[1], 0xBB);
    }
}
