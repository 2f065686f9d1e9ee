//! Per-file slice bookkeeping for the content cache.
//!
//! A file's cached bytes are a sorted, non-overlapping sequence of
//! [`Slice`]s, each in one state of the machine:
//!
//! `Empty -> Buffering -> Uploading -> Cached -> Evicted`
//!
//! `Empty` is the absence of a slice. Evicted slices are retained
//! without their buffer so observers can tell evicted from
//! never-cached; any read or write through one re-populates from the
//! store. Invariants: ranges never overlap; Buffering is dirty;
//! Uploading must not be mutated; Cached matches the store
//! byte-for-byte.

use std::time::Instant;

use crate::content::ContentHandle;
use crate::metadata::FileId;

/// State of one byte range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SliceState {
    /// Dirty bytes not yet in the content store.
    Buffering,
    /// Mid-flush; frozen until the store write resolves.
    Uploading,
    /// Clean bytes identical to the store.
    Cached,
    /// Bytes dropped under budget pressure; reads must refill.
    Evicted,
}

/// One byte range and its buffer.
#[derive(Debug, Clone)]
pub struct Slice {
    pub offset: u64,
    pub state: SliceState,
    /// Empty once the slice is Evicted.
    pub buf: Vec<u8>,
    /// Length survives eviction for observability.
    pub len: u64,
    pub last_activity: Instant,
}

impl Slice {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    fn held_bytes(&self) -> u64 {
        match self.state {
            SliceState::Evicted => 0,
            _ => self.len,
        }
    }
}

/// Accounting deltas a mutation produced, applied to the cache-wide
/// atomics by the caller.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Deltas {
    pub total: i64,
    pub dirty: i64,
}

/// A write overlapped an Uploading range and must wait for the flush
/// to resolve before mutating.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MustWait;

/// Plan step produced by [`FileSlices::read_plan`].
#[derive(Debug, PartialEq, Eq)]
pub enum ReadSegment {
    /// Bytes served from a resident slice.
    Resident(Vec<u8>),
    /// A gap (or Evicted range) that must be filled from the store.
    Missing { offset: u64, len: u64 },
}

/// All slice state for one file.
pub struct FileSlices {
    pub file: FileId,
    pub content: ContentHandle,
    pub open_count: u32,
    pub last_activity: Instant,
    /// Sorted by offset; pairwise disjoint.
    slices: Vec<Slice>,
}

impl FileSlices {
    pub fn new(file: FileId, content: ContentHandle) -> Self {
        Self { file, content, open_count: 0, last_activity: Instant::now(), slices: Vec::new() }
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    pub fn held_bytes(&self) -> u64 {
        self.slices.iter().map(Slice::held_bytes).sum()
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.slices
            .iter()
            .filter(|slice| slice.state == SliceState::Buffering)
            .map(|slice| slice.len)
            .sum()
    }

    pub fn has_dirty(&self) -> bool {
        self.slices.iter().any(|slice| slice.state == SliceState::Buffering)
    }

    pub fn has_uploading(&self) -> bool {
        self.slices.iter().any(|slice| slice.state == SliceState::Uploading)
    }

    /// High-water mark across resident and evicted ranges.
    pub fn max_end(&self) -> u64 {
        self.slices.last().map(Slice::end).unwrap_or(0)
    }

    /// Applies a write, merging overlapping and adjacent Buffering and
    /// Cached slices into one Buffering slice. Overlapped Evicted
    /// slices are dropped (the write re-populates their bytes).
    /// Refuses with [`MustWait`] when the range overlaps an Uploading
    /// slice.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<Deltas, MustWait> {
        let end = offset + data.len() as u64;
        if data.is_empty() {
            return Ok(Deltas::default());
        }
        if self
            .slices
            .iter()
            .any(|slice| slice.state == SliceState::Uploading && slice.offset < end && offset < slice.end())
        {
            return Err(MustWait);
        }

        let mut absorbed: Vec<Slice> = Vec::new();
        let mut keep: Vec<Slice> = Vec::with_capacity(self.slices.len());
        for slice in self.slices.drain(..) {
            let overlaps = slice.offset < end && offset < slice.end();
            let touches = slice.end() == offset || slice.offset == end;
            let mergeable = matches!(slice.state, SliceState::Buffering | SliceState::Cached);
            if overlaps && slice.state == SliceState::Evicted {
                // Dropped: the written part becomes Buffering below and
                // the rest reverts to Empty.
                continue;
            }
            if (overlaps || touches) && mergeable {
                absorbed.push(slice);
            } else {
                keep.push(slice);
            }
        }

        let old_held: u64 = absorbed.iter().map(Slice::held_bytes).sum();
        let old_dirty: u64 = absorbed
            .iter()
            .filter(|slice| slice.state == SliceState::Buffering)
            .map(|slice| slice.len)
            .sum();

        let new_offset = absorbed.iter().map(|slice| slice.offset).min().unwrap_or(offset).min(offset);
        let new_end = absorbed.iter().map(Slice::end).max().unwrap_or(end).max(end);
        let mut buf = vec![0u8; (new_end - new_offset) as usize];
        for slice in &absorbed {
            let at = (slice.offset - new_offset) as usize;
            buf[at..at + slice.buf.len()].copy_from_slice(&slice.buf);
        }
        let at = (offset - new_offset) as usize;
        buf[at..at + data.len()].copy_from_slice(data);

        let merged = Slice {
            offset: new_offset,
            state: SliceState::Buffering,
            len: buf.len() as u64,
            buf,
            last_activity: Instant::now(),
        };
        let new_len = merged.len;
        keep.push(merged);
        keep.sort_by_key(|slice| slice.offset);
        self.slices = keep;
        self.last_activity = Instant::now();

        Ok(Deltas {
            total: new_len as i64 - old_held as i64,
            dirty: new_len as i64 - old_dirty as i64,
        })
    }

    /// Plans a read of `[offset, offset + len)`: resident segments are
    /// copied out, holes and Evicted ranges come back as `Missing` for
    /// the caller to fill from the store.
    pub fn read_plan(&mut self, offset: u64, len: u64) -> Vec<ReadSegment> {
        let end = offset + len;
        let mut plan = Vec::new();
        let mut pos = offset;
        let now = Instant::now();
        for slice in &mut self.slices {
            if slice.end() <= pos {
                continue;
            }
            if slice.offset >= end {
                break;
            }
            if slice.offset > pos {
                plan.push(ReadSegment::Missing { offset: pos, len: slice.offset.min(end) - pos });
                pos = slice.offset.min(end);
                if pos == end {
                    break;
                }
            }
            if slice.state == SliceState::Evicted {
                let until = slice.end().min(end);
                plan.push(ReadSegment::Missing { offset: pos, len: until - pos });
                pos = until;
                continue;
            }
            let from = (pos - slice.offset) as usize;
            let until = slice.end().min(end);
            let to = (until - slice.offset) as usize;
            plan.push(ReadSegment::Resident(slice.buf[from..to].to_vec()));
            slice.last_activity = now;
            pos = until;
        }
        if pos < end {
            plan.push(ReadSegment::Missing { offset: pos, len: end - pos });
        }
        self.last_activity = now;
        plan
    }

    /// Records bytes freshly fetched from the store as a Cached slice.
    /// The range must not overlap resident slices; overlapping Evicted
    /// remnants are dropped.
    pub fn insert_cached(&mut self, offset: u64, data: Vec<u8>) -> Deltas {
        if data.is_empty() {
            return Deltas::default();
        }
        let end = offset + data.len() as u64;
        self.slices.retain(|slice| {
            !(slice.state == SliceState::Evicted && slice.offset < end && offset < slice.end())
        });
        let len = data.len() as u64;
        self.slices.push(Slice {
            offset,
            state: SliceState::Cached,
            len,
            buf: data,
            last_activity: Instant::now(),
        });
        self.slices.sort_by_key(|slice| slice.offset);
        self.coalesce_clean();
        Deltas { total: len as i64, dirty: 0 }
    }

    /// Merges runs of adjacent Cached slices so the set stays small.
    fn coalesce_clean(&mut self) {
        let mut merged: Vec<Slice> = Vec::with_capacity(self.slices.len());
        for slice in self.slices.drain(..) {
            match merged.last_mut() {
                Some(last)
                    if last.state == SliceState::Cached
                        && slice.state == SliceState::Cached
                        && last.end() == slice.offset =>
                {
                    last.buf.extend_from_slice(&slice.buf);
                    last.len += slice.len;
                    last.last_activity = last.last_activity.max(slice.last_activity);
                }
                _ => merged.push(slice),
            }
        }
        self.slices = merged;
    }

    /// Freezes every Buffering slice as Uploading and hands back the
    /// ranges to write to the store.
    pub fn begin_upload(&mut self) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        for slice in &mut self.slices {
            if slice.state == SliceState::Buffering {
                slice.state = SliceState::Uploading;
                out.push((slice.offset, slice.buf.clone()));
            }
        }
        out
    }

    /// Resolves an upload: Uploading slices become Cached on success or
    /// revert to Buffering so the next sweep retries.
    pub fn finish_upload(&mut self, success: bool) -> Deltas {
        let mut dirty = 0i64;
        for slice in &mut self.slices {
            if slice.state == SliceState::Uploading {
                if success {
                    slice.state = SliceState::Cached;
                    dirty -= slice.len as i64;
                } else {
                    slice.state = SliceState::Buffering;
                }
                slice.last_activity = Instant::now();
            }
        }
        if success {
            self.coalesce_clean();
        }
        Deltas { total: 0, dirty }
    }

    /// Oldest Cached slice, if any: `(last_activity, offset)`.
    pub fn oldest_cached(&self) -> Option<(Instant, u64)> {
        self.slices
            .iter()
            .filter(|slice| slice.state == SliceState::Cached)
            .map(|slice| (slice.last_activity, slice.offset))
            .min()
    }

    /// Evicts the Cached slice at `offset`, returning the bytes freed.
    pub fn evict_at(&mut self, offset: u64) -> u64 {
        for slice in &mut self.slices {
            if slice.offset == offset && slice.state == SliceState::Cached {
                slice.state = SliceState::Evicted;
                slice.buf = Vec::new();
                return slice.len;
            }
        }
        0
    }

    /// Drops every slice wholly past `size` and trims the one spanning
    /// it. Requires no Uploading slices past the cut.
    pub fn truncate(&mut self, size: u64) -> Result<Deltas, MustWait> {
        if self
            .slices
            .iter()
            .any(|slice| slice.state == SliceState::Uploading && slice.end() > size)
        {
            return Err(MustWait);
        }
        let mut deltas = Deltas::default();
        self.slices.retain_mut(|slice| {
            if slice.offset >= size {
                deltas.total -= slice.held_bytes() as i64;
                if slice.state == SliceState::Buffering {
                    deltas.dirty -= slice.len as i64;
                }
                false
            } else if slice.end() > size {
                let cut = size - slice.offset;
                let dropped = slice.len - cut;
                deltas.total -= match slice.state {
                    SliceState::Evicted => 0,
                    _ => dropped as i64,
                };
                if slice.state == SliceState::Buffering {
                    deltas.dirty -= dropped as i64;
                }
                slice.len = cut;
                if slice.state != SliceState::Evicted {
                    slice.buf.truncate(cut as usize);
                }
                true
            } else {
                true
            }
        });
        self.last_activity = Instant::now();
        Ok(deltas)
    }

    /// Drops all clean state. The facade refuses dirty files and waits
    /// out uploads before calling this.
    pub fn invalidate(&mut self) -> Deltas {
        let mut total = 0i64;
        for slice in &mut self.slices {
            if slice.state == SliceState::Cached {
                total -= slice.len as i64;
                slice.state = SliceState::Evicted;
                slice.buf = Vec::new();
            }
        }
        Deltas { total, dirty: 0 }
    }
}
