//! Reusable byte-buffer pool for the packet path.
//!
//! Every copy the bridge makes of a callback-scoped payload goes through a
//! [`BufferPool`], so an embedding application can swap in its own allocator
//! (instrumented, size-tiered, arena-based) without touching adapter code.

use bytes::BytesMut;
use parking_lot::Mutex;

/// Buffers at or below this size are drawn from the recycling free list.
pub const POOL_BUF_SIZE: usize = 2 * 1024;

/// Upper bound on the free list so release never grows it without bound.
const MAX_POOLED: usize = 256;

/// Replaceable buffer allocator used on the hot packet path.
///
/// `acquire` returns an empty buffer with capacity of at least `size`;
/// prior contents are unspecified. A buffer must be `release`d at most once
/// and only after no other reference to it remains. Allocation failure is
/// not modeled as a recoverable error.
pub trait BufferPool: Send + Sync {
    fn acquire(&self, size: usize) -> BytesMut;
    fn release(&self, buf: BytesMut);
}

/// Default pool: small requests are served from a concurrent free list,
/// large requests always allocate fresh. On release, anything with at least
/// [`POOL_BUF_SIZE`] capacity is accepted back.
#[derive(Default)]
pub struct RecyclingPool {
    free: Mutex<Vec<BytesMut>>,
}

impl RecyclingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers currently parked in the free list.
    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

impl BufferPool for RecyclingPool {
    fn acquire(&self, size: usize) -> BytesMut {
        if size <= POOL_BUF_SIZE {
            if let Some(mut buf) = self.free.lock().pop() {
                buf.clear();
                return buf;
            }
            BytesMut::with_capacity(POOL_BUF_SIZE)
        } else {
            BytesMut::with_capacity(size)
        }
    }

    fn release(&self, buf: BytesMut) {
        if buf.capacity() >= POOL_BUF_SIZE {
            let mut free = self.free.lock();
            if free.len() < MAX_POOLED {
                free.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_acquire_is_recycled() {
        let pool = RecyclingPool::new();
        let buf = pool.acquire(100);
        assert!(buf.capacity() >= POOL_BUF_SIZE);
        pool.release(buf);
        assert_eq!(pool.pooled(), 1);

        let again = pool.acquire(64);
        assert_eq!(pool.pooled(), 0);
        assert!(again.is_empty());
    }

    #[test]
    fn large_acquire_bypasses_free_list() {
        let pool = RecyclingPool::new();
        pool.release(pool.acquire(100));
        assert_eq!(pool.pooled(), 1);

        let big = pool.acquire(POOL_BUF_SIZE * 4);
        assert!(big.capacity() >= POOL_BUF_SIZE * 4);
        assert_eq!(pool.pooled(), 1, "large request must not drain the free list");

        // Large buffers are still accepted back.
        pool.release(big);
        assert_eq!(pool.pooled(), 2);
    }

    #[test]
    fn undersized_release_is_discarded() {
        let pool = RecyclingPool::new();
        pool.release(BytesMut::with_capacity(16));
        assert_eq!(pool.pooled(), 0);
    }
}
