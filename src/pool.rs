//! Bounded free-list of fixed-size scratch buffers, used by connection
//! handlers to stage bytes read off the wire before they are appended to a
//! stream's cache.

use std::sync::Arc;

use parking_lot::Mutex;

pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
pub const DEFAULT_POOL_CAPACITY: usize = 100;

/// A buffer checked out of a [`MemoryPool`]. Returns itself to the pool on
/// drop if there is room and it is a pool-sized buffer; otherwise it is
/// simply dropped.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Option<Arc<MemoryPool>>,
}

impl PooledBuffer {
    fn transient(buf: Vec<u8>) -> Self {
        Self { buf, pool: None }
    }

    fn pooled(buf: Vec<u8>, pool: Arc<MemoryPool>) -> Self {
        Self { buf, pool: Some(pool) }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;
    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let mut buf = std::mem::take(&mut self.buf);
            buf.clear();
            pool.release_raw(buf);
        }
    }
}

/// Process-wide singleton (see [`crate::server`] for how `main` constructs
/// one copy and shares it by `Arc`). A bounded free-list, pre-populated at
/// construction with `capacity` buffers of `buffer_size` so the very first
/// `acquire()` in production already hits the pool instead of falling back
/// to a transient allocation; `acquire`/`release` are O(1).
pub struct MemoryPool {
    buffer_size: usize,
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl MemoryPool {
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        let free = (0..capacity).map(|_| Vec::with_capacity(buffer_size)).collect();
        Self {
            buffer_size,
            capacity,
            free: Mutex::new(free),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_POOL_CAPACITY)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a pool buffer if one is free, otherwise a freshly allocated
    /// transient buffer that will not be returned to the pool on release.
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        if let Some(buf) = self.free.lock().pop() {
            return PooledBuffer::pooled(buf, self.clone());
        }
        PooledBuffer::transient(vec![0u8; 0])
    }

    fn release_raw(&self, buf: Vec<u8>) {
        if buf.capacity() < self.buffer_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pool_is_pre_populated_up_to_capacity() {
        let pool = Arc::new(MemoryPool::new(1024, 2));
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn real_acquire_use_drop_cycle_recycles_the_buffer() {
        // This is the exact cycle `MessageHandler::handle_binary` exercises:
        // acquire, write into it, let it drop at end of scope. It must come
        // back out of the pool, not silently fall back to a transient
        // allocation every time.
        let pool = Arc::new(MemoryPool::new(1024, 2));
        assert_eq!(pool.len(), 2);

        let mut buf = pool.acquire();
        assert_eq!(pool.len(), 1);
        buf.extend_from_slice(b"hello");
        drop(buf);

        assert_eq!(pool.len(), 2, "dropping an acquired pool buffer must return it to the free list");
    }

    #[test]
    fn acquire_beyond_capacity_is_transient_and_not_recycled() {
        let pool = Arc::new(MemoryPool::new(1024, 1));
        let _first = pool.acquire();
        assert_eq!(pool.len(), 0);

        let second = pool.acquire();
        drop(second);
        assert_eq!(pool.len(), 0, "a transient buffer acquired with an empty free list is not recycled");
    }

    #[test]
    fn release_recycles_up_to_capacity_and_drops_undersized_buffers() {
        let pool = Arc::new(MemoryPool::new(1024, 1));
        pool.free.lock().clear();
        pool.release_raw(Vec::with_capacity(1024));
        pool.release_raw(Vec::with_capacity(1024));
        assert_eq!(pool.len(), 1, "second release should be dropped, pool is at capacity");

        let pool = Arc::new(MemoryPool::new(1024, 1));
        pool.free.lock().clear();
        pool.release_raw(Vec::with_capacity(16));
        assert_eq!(pool.len(), 0, "undersized buffer should not be pooled");
    }

    #[test]
    fn acquired_pool_buffer_is_recycled_on_drop() {
        let pool = Arc::new(MemoryPool::new(1024, 1));
        assert_eq!(pool.len(), 1);
        let buf = pool.acquire();
        assert_eq!(pool.len(), 0);
        drop(buf);
        assert_eq!(pool.len(), 1);
    }
}
