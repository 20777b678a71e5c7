//! Per-stream state: the cache it owns plus the mutable bookkeeping fields
//! (`current_offset`, `status`, timestamps) that the manager and handler
//! mutate as the stream moves through its lifecycle.

use std::path::PathBuf;
use std::time::Instant;

use parking_lot::Mutex;

use crate::cache::MemoryMappedCache;

/// Where a stream sits in its upload lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Uploading,
    Ready,
    Error,
}

struct MutableState {
    current_offset: u64,
    total_size: u64,
    status: StreamStatus,
    last_accessed_at: Instant,
}

/// A named, append-only byte log plus its metadata. Owns its
/// [`MemoryMappedCache`] exclusively; a [`parking_lot::Mutex`] serializes
/// mutation of the offset/status/timestamp fields so readers never observe
/// a `current_offset` larger than the bytes actually written.
pub struct StreamContext {
    stream_id: String,
    cache_path: PathBuf,
    cache: MemoryMappedCache,
    created_at: Instant,
    state: Mutex<MutableState>,
}

impl StreamContext {
    pub fn new(stream_id: String, cache_path: PathBuf, cache: MemoryMappedCache) -> Self {
        let now = Instant::now();
        Self {
            stream_id,
            cache_path,
            cache,
            created_at: now,
            state: Mutex::new(MutableState {
                current_offset: 0,
                total_size: 0,
                status: StreamStatus::Uploading,
                last_accessed_at: now,
            }),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn cache_path(&self) -> &PathBuf {
        &self.cache_path
    }

    pub fn cache(&self) -> &MemoryMappedCache {
        &self.cache
    }

    pub fn current_offset(&self) -> u64 {
        self.state.lock().current_offset
    }

    pub fn total_size(&self) -> u64 {
        self.state.lock().total_size
    }

    pub fn status(&self) -> StreamStatus {
        self.state.lock().status
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_accessed_at(&self) -> Instant {
        self.state.lock().last_accessed_at
    }

    pub fn touch(&self) {
        self.state.lock().last_accessed_at = Instant::now();
    }

    /// Advances `current_offset` by `len` bytes and refreshes
    /// `last_accessed_at`. Caller is responsible for having already written
    /// the bytes to the cache.
    pub fn advance_offset(&self, len: u64) -> u64 {
        let mut state = self.state.lock();
        state.current_offset += len;
        state.last_accessed_at = Instant::now();
        state.current_offset
    }

    pub fn mark_error(&self) {
        let mut state = self.state.lock();
        state.status = StreamStatus::Error;
        state.last_accessed_at = Instant::now();
    }

    /// Transitions `UPLOADING -> READY` and records the final size.
    /// Idempotent: calling this again while already `READY` is a no-op.
    pub fn mark_ready(&self) {
        let mut state = self.state.lock();
        if state.status == StreamStatus::Ready {
            return;
        }
        state.total_size = state.current_offset;
        state.status = StreamStatus::Ready;
        state.last_accessed_at = Instant::now();
    }
}
