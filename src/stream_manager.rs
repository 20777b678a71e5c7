//! Registry of all active streams. Owns the lock-order contract described
//! in the design: the registry mutex is released before a per-stream mutex
//! is ever taken, and the per-stream mutex is released before the stream's
//! cache lock is taken. Never the other way around.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::Mutex;

use crate::cache::{MemoryMappedCache, MAX_CACHE_SIZE};
use crate::error::{Result, ServerError};
use crate::stream_context::{StreamContext, StreamStatus};

/// Registry of streams keyed by `stream_id`, each held behind an `Arc` so a
/// handler already holding a handle can keep using it even if a concurrent
/// `delete_stream` races it — the cache and file are released only when the
/// last handle is dropped.
pub struct StreamManager {
    cache_dir: PathBuf,
    streams: Mutex<HashMap<String, Arc<StreamContext>>>,
}

impl StreamManager {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn cache_path(&self, stream_id: &str) -> PathBuf {
        self.cache_dir.join(format!("{stream_id}.cache"))
    }

    /// Creates a new stream with `status = UPLOADING`. Fails with
    /// `AlreadyExists` if `stream_id` is already registered, or `IoError`
    /// if the backing cache file cannot be created.
    pub fn create_stream(&self, stream_id: &str) -> Result<Arc<StreamContext>> {
        {
            let streams = self.streams.lock();
            if streams.contains_key(stream_id) {
                return Err(ServerError::AlreadyExists(stream_id.to_string()));
            }
        }

        std::fs::create_dir_all(&self.cache_dir).map_err(|e| ServerError::io("create", e))?;
        let cache_path = self.cache_path(stream_id);
        let cache = MemoryMappedCache::create(cache_path.clone(), 0)?;
        let context = Arc::new(StreamContext::new(stream_id.to_string(), cache_path, cache));

        let mut streams = self.streams.lock();
        if streams.contains_key(stream_id) {
            // Lost a race with another create_stream for the same id between
            // our first check and now; the cache file we just created is
            // simply left for the winner to overwrite on their own create.
            return Err(ServerError::AlreadyExists(stream_id.to_string()));
        }
        streams.insert(stream_id.to_string(), context.clone());
        info!("stream {stream_id} created");
        Ok(context)
    }

    pub fn get_stream(&self, stream_id: &str) -> Result<Arc<StreamContext>> {
        self.streams
            .lock()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(stream_id.to_string()))
    }

    /// Removes `stream_id` from the registry. The underlying cache file is
    /// unlinked once the last outstanding `Arc<StreamContext>` handle is
    /// dropped.
    pub fn delete_stream(&self, stream_id: &str) -> Result<()> {
        let removed = self.streams.lock().remove(stream_id);
        match removed {
            Some(context) => {
                let path = context.cache_path().clone();
                context.cache().close()?;
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("failed to unlink cache file {}: {e}", path.display());
                    }
                }
                info!("stream {stream_id} deleted");
                Ok(())
            }
            None => Err(ServerError::NotFound(stream_id.to_string())),
        }
    }

    pub fn list_active_streams(&self) -> Vec<String> {
        self.streams.lock().keys().cloned().collect()
    }

    /// Appends `data` to the stream at its current high-water mark.
    pub fn write_chunk(&self, stream_id: &str, data: &[u8]) -> Result<u64> {
        let context = self.get_stream(stream_id)?;

        if context.status() != StreamStatus::Uploading {
            return Err(ServerError::InvalidState(format!(
                "stream {stream_id} is not uploading"
            )));
        }

        let offset = context.current_offset();
        let projected_end = offset + data.len() as u64;
        if projected_end > MAX_CACHE_SIZE {
            return Err(ServerError::InvalidArgument(format!(
                "append to stream {stream_id} would exceed the {MAX_CACHE_SIZE}-byte cache limit"
            )));
        }

        match context.cache().write(offset, data) {
            Ok(_) => Ok(context.advance_offset(data.len() as u64)),
            Err(e) => {
                context.mark_error();
                Err(e)
            }
        }
    }

    /// Reads `[offset, offset+length)`, truncated so it never reads past
    /// the stream's current high-water mark.
    pub fn read_chunk(&self, stream_id: &str, offset: u64, length: usize) -> Result<Vec<u8>> {
        let context = self.get_stream(stream_id)?;
        context.touch();
        let current_offset = context.current_offset();
        if offset >= current_offset {
            return Ok(Vec::new());
        }
        let clamped = length.min((current_offset - offset) as usize);
        context.cache().read(offset, clamped)
    }

    /// Transitions `UPLOADING -> READY`, finalizing the cache file to
    /// exactly `current_offset` bytes. Idempotent once already `READY`.
    pub fn finalize_stream(&self, stream_id: &str) -> Result<u64> {
        let context = self.get_stream(stream_id)?;
        if context.status() == StreamStatus::Ready {
            return Ok(context.total_size());
        }
        if context.status() == StreamStatus::Error {
            return Err(ServerError::InvalidState(format!(
                "stream {stream_id} is in an error state and cannot be finalized"
            )));
        }
        let final_size = context.current_offset();
        context.cache().finalize(final_size)?;
        context.mark_ready();
        info!("stream {stream_id} finalized at {final_size} bytes");
        Ok(final_size)
    }

    /// Sweeps the registry, deleting any stream whose `last_accessed_at` is
    /// older than `idle_threshold` and whose status is `READY` or `ERROR`.
    /// Never deletes an active upload.
    pub fn cleanup_old_streams(&self, idle_threshold: Duration) -> Vec<String> {
        let now = Instant::now();
        let candidates: Vec<String> = {
            let streams = self.streams.lock();
            streams
                .iter()
                .filter(|(_, ctx)| {
                    let idle_long_enough = now.saturating_duration_since(ctx.last_accessed_at())
                        >= idle_threshold;
                    let sweepable =
                        matches!(ctx.status(), StreamStatus::Ready | StreamStatus::Error);
                    idle_long_enough && sweepable
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut deleted = Vec::with_capacity(candidates.len());
        for id in candidates {
            if self.delete_stream(&id).is_ok() {
                deleted.push(id);
            }
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_twice_returns_already_exists_and_leaves_original_intact() {
        let dir = tempdir().unwrap();
        let manager = StreamManager::new(dir.path());
        manager.create_stream("s1").unwrap();
        manager.write_chunk("s1", b"abc").unwrap();

        let err = manager.create_stream("s1").unwrap_err();
        assert!(matches!(err, ServerError::AlreadyExists(_)));
        assert_eq!(manager.read_chunk("s1", 0, 3).unwrap(), b"abc");
    }

    #[test]
    fn write_then_read_then_finalize() {
        let dir = tempdir().unwrap();
        let manager = StreamManager::new(dir.path());
        manager.create_stream("s2").unwrap();
        manager.write_chunk("s2", &[0, 1, 2, 3, 4, 5, 6, 7]).unwrap();
        assert_eq!(manager.read_chunk("s2", 0, 8).unwrap(), vec![0, 1, 2, 3, 4, 5, 6, 7]);

        let size = manager.finalize_stream("s2").unwrap();
        assert_eq!(size, 8);
        // Idempotent.
        assert_eq!(manager.finalize_stream("s2").unwrap(), 8);

        let path = dir.path().join("s2.cache");
        assert_eq!(std::fs::metadata(path).unwrap().len(), 8);
    }

    #[test]
    fn read_never_sees_past_current_offset() {
        let dir = tempdir().unwrap();
        let manager = StreamManager::new(dir.path());
        manager.create_stream("s3").unwrap();
        manager.write_chunk("s3", b"hello").unwrap();
        assert_eq!(manager.read_chunk("s3", 0, 100).unwrap(), b"hello");
        assert_eq!(manager.read_chunk("s3", 5, 10).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn write_after_finalize_is_invalid_state() {
        let dir = tempdir().unwrap();
        let manager = StreamManager::new(dir.path());
        manager.create_stream("s4").unwrap();
        manager.finalize_stream("s4").unwrap();
        assert!(matches!(
            manager.write_chunk("s4", b"x"),
            Err(ServerError::InvalidState(_))
        ));
    }

    #[test]
    fn cleanup_never_deletes_active_upload() {
        let dir = tempdir().unwrap();
        let manager = StreamManager::new(dir.path());
        manager.create_stream("uploading").unwrap();
        manager.create_stream("ready").unwrap();
        manager.finalize_stream("ready").unwrap();

        let deleted = manager.cleanup_old_streams(Duration::from_secs(0));
        assert_eq!(deleted, vec!["ready".to_string()]);
        assert!(manager.get_stream("uploading").is_ok());
        assert!(manager.get_stream("ready").is_err());
    }

    #[test]
    fn cleanup_respects_idle_threshold() {
        let dir = tempdir().unwrap();
        let manager = StreamManager::new(dir.path());
        manager.create_stream("ready").unwrap();
        manager.finalize_stream("ready").unwrap();

        let deleted = manager.cleanup_old_streams(Duration::from_secs(3600));
        assert!(deleted.is_empty());
        assert!(manager.get_stream("ready").is_ok());
    }
}
