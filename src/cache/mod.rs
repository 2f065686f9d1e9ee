//! Defines the per-file slice cache that mediates between write-through
//! metadata and write-back content.
//!
//! Reads and writes go through per-file slice sets ([`slice`]); a
//! background [`flusher::Flusher`] sweeps dirty files to the content
//! store, and an eviction pass keeps resident bytes under the
//! configured budget, oldest activity first. Dirty bytes are never
//! evicted; when Buffering alone exceeds the budget new writes block
//! until the flusher drains them.

pub mod flusher;
pub mod slice;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

use crate::content::{ContentHandle, ContentStore};
use crate::error::{Error, Result};
use crate::metadata::FileId;
use slice::{Deltas, FileSlices, ReadSegment, SliceState};

struct FileCacheEntry {
    state: Mutex<FileSlices>,
    /// Woken when an upload resolves, releasing blocked writers and
    /// flush waiters.
    upload_done: Notify,
}

/// The cache. One instance per share binding.
pub struct SliceCache {
    files: DashMap<FileId, Arc<FileCacheEntry>>,
    store: Arc<dyn ContentStore>,
    budget: u64,
    /// Buffering + Uploading + Cached bytes across all files.
    total: AtomicU64,
    /// Buffering bytes only, for backpressure.
    dirty: AtomicU64,
    /// Woken whenever bytes are freed.
    space: Notify,
    /// Wakes the flusher ahead of its interval.
    kick: Notify,
}

impl SliceCache {
    pub fn new(store: Arc<dyn ContentStore>, byte_budget: u64) -> Self {
        Self {
            files: DashMap::new(),
            store,
            budget: byte_budget,
            total: AtomicU64::new(0),
            dirty: AtomicU64::new(0),
            space: Notify::new(),
            kick: Notify::new(),
        }
    }

    /// Registers an open of `file`, creating its slice set on first
    /// open. The open count defers content reclamation until the
    /// matching [`SliceCache::close`].
    pub async fn open(&self, file: FileId, content: ContentHandle) {
        let entry = {
            let guard = self.files.entry(file).or_insert_with(|| {
                Arc::new(FileCacheEntry {
                    state: Mutex::new(FileSlices::new(file, content)),
                    upload_done: Notify::new(),
                })
            });
            Arc::clone(guard.value())
        };
        let mut state = entry.state.lock().await;
        state.open_count += 1;
    }

    fn entry(&self, file: FileId) -> Result<Arc<FileCacheEntry>> {
        self.files.get(&file).map(|entry| entry.value().clone()).ok_or(Error::NotFound)
    }

    fn apply(&self, deltas: Deltas) {
        add_signed(&self.total, deltas.total);
        add_signed(&self.dirty, deltas.dirty);
        if deltas.total < 0 || deltas.dirty < 0 {
            self.space.notify_waiters();
        }
    }

    /// Buffered + cached bytes currently held.
    pub fn total_size(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    /// Dirty bytes awaiting flush.
    pub fn dirty_size(&self) -> u64 {
        self.dirty.load(Ordering::SeqCst)
    }

    pub fn byte_budget(&self) -> u64 {
        self.budget
    }

    /// Waits until the flusher is kicked; used by the flusher task.
    pub(crate) async fn kicked(&self) {
        self.kick.notified().await;
    }

    pub async fn write_at(&self, file: FileId, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let entry = self.entry(file)?;
        let len = data.len() as u64;

        // Backpressure: dirty bytes alone must stay under budget, a
        // single oversized write excepted.
        loop {
            self.evict_to_budget().await;
            let dirty = self.dirty.load(Ordering::SeqCst);
            if dirty == 0 || dirty + len <= self.budget {
                break;
            }
            self.kick.notify_waiters();
            let mut freed = Box::pin(self.space.notified());
            freed.as_mut().enable();
            let dirty = self.dirty.load(Ordering::SeqCst);
            if dirty == 0 || dirty + len <= self.budget {
                break;
            }
            trace!(file = file.0, dirty, "write waiting for flusher to drain");
            freed.await;
        }

        loop {
            let resolved = {
                let mut state = entry.state.lock().await;
                match state.write(offset, data) {
                    Ok(deltas) => {
                        self.apply(deltas);
                        break;
                    }
                    Err(slice::MustWait) => {
                        let mut waiter = Box::pin(entry.upload_done.notified());
                        waiter.as_mut().enable();
                        waiter
                    }
                }
            };
            // Overlapped an in-flight upload; wait for it to resolve.
            resolved.await;
        }
        self.evict_to_budget().await;
        Ok(())
    }

    /// Reads `[offset, offset + length)`. Holes inside the requested
    /// range come back as zeros once the store has been consulted, so
    /// the caller must clip `length` to the file size first.
    pub async fn read_at(&self, file: FileId, offset: u64, length: u64) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let entry = self.entry(file)?;
        let mut result = Vec::with_capacity(length as usize);
        {
            let mut state = entry.state.lock().await;
            let content = state.content;
            let plan = state.read_plan(offset, length);
            for segment in plan {
                match segment {
                    ReadSegment::Resident(bytes) => result.extend_from_slice(&bytes),
                    ReadSegment::Missing { offset: at, len } => {
                        let mut bytes = self.store.read(content, at, len as u32).await?;
                        // Short read: the tail is sparse or still
                        // buffered elsewhere; zeros are correct.
                        bytes.resize(len as usize, 0);
                        result.extend_from_slice(&bytes);
                        let deltas = state.insert_cached(at, bytes);
                        self.apply(deltas);
                    }
                }
            }
        }
        self.evict_to_budget().await;
        Ok(result)
    }

    /// Synchronously drives every Buffering range of `file` through
    /// Uploading to Cached.
    pub async fn flush_file(&self, file: FileId) -> Result<()> {
        let entry = match self.entry(file) {
            Ok(entry) => entry,
            Err(Error::NotFound) => return Ok(()),
            Err(other) => return Err(other),
        };
        loop {
            let (uploads, content) = {
                let mut state = entry.state.lock().await;
                if state.has_uploading() {
                    let mut waiter = Box::pin(entry.upload_done.notified());
                    waiter.as_mut().enable();
                    drop(state);
                    waiter.await;
                    continue;
                }
                if !state.has_dirty() {
                    return Ok(());
                }
                (state.begin_upload(), state.content)
            };

            let mut failure = None;
            for (at, bytes) in uploads {
                if let Err(error) = self.store.write(content, at, &bytes).await {
                    warn!(file = file.0, offset = at, %error, "content flush failed");
                    failure = Some(error);
                    break;
                }
            }

            {
                let mut state = entry.state.lock().await;
                let deltas = state.finish_upload(failure.is_none());
                self.apply(deltas);
            }
            entry.upload_done.notify_waiters();
            if let Some(error) = failure {
                return Err(error);
            }
        }
    }

    /// Drops all clean state for `file`. Refuses while dirty ranges
    /// exist; waits out in-flight uploads.
    pub async fn invalidate(&self, file: FileId) -> Result<()> {
        let entry = match self.entry(file) {
            Ok(entry) => entry,
            Err(Error::NotFound) => return Ok(()),
            Err(other) => return Err(other),
        };
        loop {
            let mut state = entry.state.lock().await;
            if state.has_dirty() {
                return Err(Error::InvalidArgument);
            }
            if state.has_uploading() {
                let mut waiter = Box::pin(entry.upload_done.notified());
                waiter.as_mut().enable();
                drop(state);
                waiter.await;
                continue;
            }
            let deltas = state.invalidate();
            self.apply(deltas);
            return Ok(());
        }
    }

    /// Trims cache state past `size`; waits for overlapping uploads.
    pub async fn truncate(&self, file: FileId, size: u64) -> Result<()> {
        let entry = self.entry(file)?;
        loop {
            let resolved = {
                let mut state = entry.state.lock().await;
                match state.truncate(size) {
                    Ok(deltas) => {
                        self.apply(deltas);
                        return Ok(());
                    }
                    Err(slice::MustWait) => {
                        let mut waiter = Box::pin(entry.upload_done.notified());
                        waiter.as_mut().enable();
                        waiter
                    }
                }
            };
            resolved.await;
        }
    }

    /// File size as the store's view extended by the cache high-water
    /// mark.
    pub async fn size_of(&self, file: FileId) -> Result<u64> {
        let entry = self.entry(file)?;
        let state = entry.state.lock().await;
        let stored = match self.store.stat(state.content).await {
            Ok(size) => size,
            Err(Error::NotFound) => 0,
            Err(other) => return Err(other),
        };
        Ok(stored.max(state.max_end()))
    }

    /// Decrements the open count, reporting how many opens remain.
    pub async fn close(&self, file: FileId) -> Result<u32> {
        let entry = self.entry(file)?;
        let mut state = entry.state.lock().await;
        state.open_count = state.open_count.saturating_sub(1);
        Ok(state.open_count)
    }

    pub async fn open_count(&self, file: FileId) -> u32 {
        match self.entry(file) {
            Ok(entry) => entry.state.lock().await.open_count,
            Err(_) => 0,
        }
    }

    /// Drops every trace of `file` after content reclamation. The
    /// caller guarantees no dirty bytes remain worth keeping.
    pub async fn forget(&self, file: FileId) {
        if let Some((_, entry)) = self.files.remove(&file) {
            let state = entry.state.lock().await;
            let held = state.held_bytes();
            let dirty = state.dirty_bytes();
            self.apply(Deltas { total: -(held as i64), dirty: -(dirty as i64) });
        }
    }

    /// Observability hook: states of every slice of `file`.
    pub async fn slice_states(&self, file: FileId) -> Vec<(u64, u64, SliceState)> {
        match self.entry(file) {
            Ok(entry) => {
                let state = entry.state.lock().await;
                state
                    .slices()
                    .iter()
                    .map(|slice| (slice.offset, slice.len, slice.state))
                    .collect()
            }
            Err(_) => Vec::new(),
        }
    }

    /// Files whose dirty bytes have been idle at least `idle`; with
    /// `ignore_idle` every dirty file qualifies (budget pressure).
    pub(crate) async fn dirty_files(&self, idle: Duration, ignore_idle: bool) -> Vec<FileId> {
        let entries: Vec<(FileId, Arc<FileCacheEntry>)> = self
            .files
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        let mut out = Vec::new();
        for (file, entry) in entries {
            let state = entry.state.lock().await;
            if state.has_dirty() && (ignore_idle || state.last_activity.elapsed() >= idle) {
                out.push(file);
            }
        }
        out
    }

    /// Flushes every dirty file; used on shutdown.
    pub async fn flush_all(&self) -> Result<()> {
        let files = self.dirty_files(Duration::ZERO, true).await;
        let results = join_all(files.into_iter().map(|file| self.flush_file(file))).await;
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    /// Evicts Cached ranges, oldest activity first, until resident
    /// bytes fit the budget again.
    pub async fn evict_to_budget(&self) {
        while self.total.load(Ordering::SeqCst) > self.budget {
            let entries: Vec<Arc<FileCacheEntry>> =
                self.files.iter().map(|entry| entry.value().clone()).collect();
            let mut oldest: Option<(std::time::Instant, Arc<FileCacheEntry>, u64)> = None;
            for entry in entries {
                let state = entry.state.lock().await;
                if let Some((at, offset)) = state.oldest_cached() {
                    if oldest.as_ref().map_or(true, |(best, _, _)| at < *best) {
                        let candidate = entry.clone();
                        oldest = Some((at, candidate, offset));
                    }
                }
            }
            let Some((_, entry, offset)) = oldest else {
                // Nothing evictable; only dirty bytes remain.
                break;
            };
            let mut state = entry.state.lock().await;
            let freed = state.evict_at(offset);
            if freed > 0 {
                debug!(file = state.file.0, offset, freed, "evicted cached range");
                self.apply(Deltas { total: -(freed as i64), dirty: 0 });
            }
        }
    }
}

fn add_signed(counter: &AtomicU64, delta: i64) {
    if delta >= 0 {
        counter.fetch_add(delta as u64, Ordering::SeqCst);
    } else {
        counter.fetch_sub(delta.unsigned_abs(), Ordering::SeqCst);
    }
}
