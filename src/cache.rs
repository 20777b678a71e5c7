//! Segmented memory-mapped cache file.
//!
//! A single on-disk file is projected into virtual memory in fixed-size
//! segments so that a logical file exceeding any one mapping window (for
//! example, >2 GiB on platforms where a single mapping is impractical)
//! still behaves like one contiguous byte-addressable buffer. Segments are
//! mapped lazily on first touch and dropped when a `resize` shrinks the
//! file below their extent.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;

use crate::error::{Result, ServerError};

/// Size of one mapping window.
pub const SEGMENT_SIZE: u64 = 1 << 30; // 1 GiB

/// Advisory per-stream cap; `StreamManager::write_chunk` enforces it.
pub const MAX_CACHE_SIZE: u64 = 8 * SEGMENT_SIZE; // 8 GiB

/// Upper bound on the number of operations accepted by `write_batch`/`read_batch`.
pub const BATCH_OPERATION_LIMIT: usize = 1000;

/// One write destined for `write_batch`.
#[derive(Clone, Debug)]
pub struct WriteOp {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// One read destined for `read_batch`.
#[derive(Clone, Copy, Debug)]
pub struct ReadOp {
    pub offset: u64,
    pub length: usize,
}

struct CacheInner {
    file: Option<File>,
    file_size: u64,
    segments: HashMap<u64, MmapMut>,
    is_open: bool,
}

/// A segmented memory-mapped projection of one backing file.
pub struct MemoryMappedCache {
    file_path: PathBuf,
    segment_size: u64,
    inner: RwLock<CacheInner>,
}

impl MemoryMappedCache {
    /// Creates the backing file. Fails if it already exists.
    pub fn create(path: impl Into<PathBuf>, initial_size: u64) -> Result<Self> {
        Self::create_with_segment_size(path, initial_size, SEGMENT_SIZE)
    }

    /// Same as [`Self::create`] but with a caller-chosen segment size, so
    /// tests can exercise segment-boundary-crossing logic without
    /// allocating gigabytes.
    pub fn create_with_segment_size(
        path: impl Into<PathBuf>,
        initial_size: u64,
        segment_size: u64,
    ) -> Result<Self> {
        assert!(segment_size > 0, "segment size must be non-zero");
        let file_path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&file_path)
            .map_err(|e| ServerError::io("create", e))?;
        file.set_len(initial_size)
            .map_err(|e| ServerError::io("resize", e))?;
        Ok(Self {
            file_path,
            segment_size,
            inner: RwLock::new(CacheInner {
                file: Some(file),
                file_size: initial_size,
                segments: HashMap::new(),
                is_open: true,
            }),
        })
    }

    /// Opens an existing backing file for read/write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_segment_size(path, SEGMENT_SIZE)
    }

    pub fn open_with_segment_size(path: impl Into<PathBuf>, segment_size: u64) -> Result<Self> {
        assert!(segment_size > 0, "segment size must be non-zero");
        let file_path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&file_path)
            .map_err(|e| ServerError::io("mmap", e))?;
        let file_size = file
            .metadata()
            .map_err(|e| ServerError::io("mmap", e))?
            .len();
        Ok(Self {
            file_path,
            segment_size,
            inner: RwLock::new(CacheInner {
                file: Some(file),
                file_size,
                segments: HashMap::new(),
                is_open: true,
            }),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn file_size(&self) -> u64 {
        self.inner.read().file_size
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().is_open
    }

    /// Flushes and unmaps all segments, then closes the underlying file
    /// handle. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.is_open {
            return Ok(());
        }
        for mmap in inner.segments.values() {
            mmap.flush().map_err(|e| ServerError::io("flush", e))?;
        }
        inner.segments.clear();
        inner.file = None;
        inner.is_open = false;
        Ok(())
    }

    /// Writes `data.len()` bytes starting at `offset`, growing the file
    /// first if the write would exceed the current length.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.write();
        Self::check_open(&inner)?;
        self.write_locked(&mut inner, offset, data)
    }

    /// Returns the bytes `[offset, offset+length)`, truncated to what is
    /// actually in the file.
    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }

        // Fast path: every needed segment is already mapped, so a shared
        // lock suffices.
        {
            let inner = self.inner.read();
            Self::check_open(&inner)?;
            if offset >= inner.file_size {
                return Ok(Vec::new());
            }
            let clamped = length.min((inner.file_size - offset) as usize);
            let spans = Self::plan_spans(self.segment_size, offset, clamped);
            if spans.iter().all(|(idx, _, _)| inner.segments.contains_key(idx)) {
                return Ok(Self::gather(&inner.segments, &spans, clamped));
            }
        }

        // Slow path: at least one segment needs mapping, which requires the
        // exclusive lock.
        let mut inner = self.inner.write();
        Self::check_open(&inner)?;
        self.read_locked(&mut inner, offset, length)
    }

    /// Executes up to [`BATCH_OPERATION_LIMIT`] writes under a single lock
    /// acquisition. Each op's success or failure is independent; a failing
    /// op does not roll back the ones before it.
    pub fn write_batch(&self, ops: &[WriteOp]) -> Result<Vec<Result<usize>>> {
        if ops.len() > BATCH_OPERATION_LIMIT {
            return Err(ServerError::InvalidArgument(format!(
                "write_batch accepts at most {BATCH_OPERATION_LIMIT} operations, got {}",
                ops.len()
            )));
        }
        let mut inner = self.inner.write();
        Self::check_open(&inner)?;
        Ok(ops
            .iter()
            .map(|op| self.write_locked(&mut inner, op.offset, &op.data))
            .collect())
    }

    /// Executes up to [`BATCH_OPERATION_LIMIT`] reads under a single lock
    /// acquisition.
    pub fn read_batch(&self, ops: &[ReadOp]) -> Result<Vec<Result<Vec<u8>>>> {
        if ops.len() > BATCH_OPERATION_LIMIT {
            return Err(ServerError::InvalidArgument(format!(
                "read_batch accepts at most {BATCH_OPERATION_LIMIT} operations, got {}",
                ops.len()
            )));
        }
        let mut inner = self.inner.write();
        Self::check_open(&inner)?;
        Ok(ops
            .iter()
            .map(|op| self.read_locked(&mut inner, op.offset, op.length))
            .collect())
    }

    /// Sets the file length. Segments whose mapped extent would now read
    /// past the new length are dropped and re-mapped lazily on next access.
    pub fn resize(&self, new_size: u64) -> Result<()> {
        let mut inner = self.inner.write();
        Self::check_open(&inner)?;
        self.set_len_locked(&mut inner, new_size)?;
        let shrank = new_size < inner.file_size;
        inner.file_size = new_size;
        if shrank {
            self.drop_oversized_segments(&mut inner);
        }
        Ok(())
    }

    /// Sets the file length to exactly `final_size`, flushes, and leaves
    /// the file open for reads.
    pub fn finalize(&self, final_size: u64) -> Result<()> {
        {
            let mut inner = self.inner.write();
            Self::check_open(&inner)?;
            self.set_len_locked(&mut inner, final_size)?;
            let shrank = final_size < inner.file_size;
            inner.file_size = final_size;
            if shrank {
                self.drop_oversized_segments(&mut inner);
            }
        }
        self.flush()
    }

    /// Forces dirty pages of every mapped segment to the OS. Best-effort
    /// durability; does not fsync the file descriptor itself.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.write();
        Self::check_open(&inner)?;
        for mmap in inner.segments.values() {
            mmap.flush().map_err(|e| ServerError::io("flush", e))?;
        }
        Ok(())
    }

    /// Advisory hint: eagerly maps the segments covering `[offset,
    /// offset+length)`. No semantic effect beyond warming the mapping
    /// cache.
    pub fn prefetch(&self, offset: u64, length: usize) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let mut inner = self.inner.write();
        Self::check_open(&inner)?;
        if offset >= inner.file_size {
            return Ok(());
        }
        let clamped = length.min((inner.file_size - offset) as usize);
        for (idx, _, _) in Self::plan_spans(self.segment_size, offset, clamped) {
            self.ensure_segment_locked(&mut inner, idx)?;
        }
        Ok(())
    }

    /// Advisory hint: drops any mapping fully covering `[offset,
    /// offset+length)` so it is unmapped until next touched. No semantic
    /// effect; the data remains on disk and is re-mapped lazily.
    pub fn evict(&self, offset: u64, length: usize) -> Result<()> {
        if length == 0 {
            return Ok(());
        }
        let mut inner = self.inner.write();
        Self::check_open(&inner)?;
        let end = offset.saturating_add(length as u64);
        let segment_size = self.segment_size;
        inner.segments.retain(|&idx, _| {
            let seg_start = idx * segment_size;
            let seg_end = seg_start + segment_size;
            !(seg_start >= offset && seg_end <= end)
        });
        Ok(())
    }

    fn check_open(inner: &CacheInner) -> Result<()> {
        if !inner.is_open {
            return Err(ServerError::InvalidState("cache is closed".into()));
        }
        Ok(())
    }

    fn set_len_locked(&self, inner: &mut CacheInner, new_size: u64) -> Result<()> {
        let file = inner
            .file
            .as_ref()
            .ok_or_else(|| ServerError::InvalidState("cache is closed".into()))?;
        file.set_len(new_size).map_err(|e| ServerError::io("resize", e))
    }

    fn write_locked(&self, inner: &mut CacheInner, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let required = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| ServerError::InvalidArgument("offset + length overflows u64".into()))?;
        if required > inner.file_size {
            self.set_len_locked(inner, required)?;
            inner.file_size = required;
        }
        let spans = Self::plan_spans(self.segment_size, offset, data.len());
        let mut pos = 0usize;
        for (segment_index, offset_in_segment, sublen) in spans {
            let mmap = self.ensure_segment_locked(inner, segment_index)?;
            mmap[offset_in_segment..offset_in_segment + sublen]
                .copy_from_slice(&data[pos..pos + sublen]);
            pos += sublen;
        }
        Ok(data.len())
    }

    fn read_locked(&self, inner: &mut CacheInner, offset: u64, length: usize) -> Result<Vec<u8>> {
        if length == 0 || offset >= inner.file_size {
            return Ok(Vec::new());
        }
        let clamped = length.min((inner.file_size - offset) as usize);
        let spans = Self::plan_spans(self.segment_size, offset, clamped);
        let mut out = Vec::with_capacity(clamped);
        for (segment_index, offset_in_segment, sublen) in spans {
            let mmap = self.ensure_segment_locked(inner, segment_index)?;
            out.extend_from_slice(&mmap[offset_in_segment..offset_in_segment + sublen]);
        }
        Ok(out)
    }

    fn gather(
        segments: &HashMap<u64, MmapMut>,
        spans: &[(u64, usize, usize)],
        total: usize,
    ) -> Vec<u8> {
        let mut out = Vec::with_capacity(total);
        for (idx, off_in_seg, sublen) in spans {
            let mmap = &segments[idx];
            out.extend_from_slice(&mmap[*off_in_seg..*off_in_seg + *sublen]);
        }
        out
    }

    /// Maps segment `segment_index` if it is not already mapped, and
    /// returns a mutable reference to it.
    fn ensure_segment_locked<'a>(
        &self,
        inner: &'a mut CacheInner,
        segment_index: u64,
    ) -> Result<&'a mut MmapMut> {
        if !inner.segments.contains_key(&segment_index) {
            let seg_start = segment_index * self.segment_size;
            if seg_start >= inner.file_size {
                return Err(ServerError::InvalidState(
                    "segment index beyond current file size".into(),
                ));
            }
            let seg_len = self.segment_size.min(inner.file_size - seg_start) as usize;
            let file = inner
                .file
                .as_ref()
                .ok_or_else(|| ServerError::InvalidState("cache is closed".into()))?;
            // Safety: the file is exclusively owned by this cache and is
            // never truncated below a mapped segment's extent without that
            // segment first being dropped from `inner.segments` (see
            // `drop_oversized_segments`), so the mapping stays within the
            // file's bounds for as long as it lives.
            let mmap = unsafe {
                MmapOptions::new()
                    .offset(seg_start)
                    .len(seg_len)
                    .map_mut(file)
                    .map_err(|e| ServerError::io("mmap", e))?
            };
            inner.segments.insert(segment_index, mmap);
        }
        Ok(inner.segments.get_mut(&segment_index).expect("just inserted"))
    }

    /// Drops any mapping whose covered range now extends past
    /// `inner.file_size` after a shrinking resize.
    fn drop_oversized_segments(&self, inner: &mut CacheInner) {
        let segment_size = self.segment_size;
        let file_size = inner.file_size;
        inner.segments.retain(|&idx, _| {
            let seg_start = idx * segment_size;
            seg_start + segment_size <= file_size
        });
    }

    /// Splits `[offset, offset+len)` into per-segment `(segment_index,
    /// offset_in_segment, sublen)` triples in order.
    fn plan_spans(segment_size: u64, offset: u64, len: usize) -> Vec<(u64, usize, usize)> {
        let mut spans = Vec::new();
        let mut pos = offset;
        let mut remaining = len;
        while remaining > 0 {
            let segment_index = pos / segment_size;
            let offset_in_segment = (pos % segment_size) as usize;
            let space_in_segment = (segment_size - (pos % segment_size)) as usize;
            let sublen = remaining.min(space_in_segment);
            spans.push((segment_index, offset_in_segment, sublen));
            pos += sublen as u64;
            remaining -= sublen;
        }
        spans
    }
}

impl Drop for MemoryMappedCache {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
