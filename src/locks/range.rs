//! Byte-range lock types and the conflict predicates both protocols
//! share.

use crate::metadata::FileId;

/// A byte range on a file. A length of zero means "to end of file".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn to_eof(offset: u64) -> Self {
        Self { offset, length: 0 }
    }

    /// Exclusive end, `None` for to-end-of-file ranges.
    pub fn end(&self) -> Option<u64> {
        if self.length == 0 {
            None
        } else {
            Some(self.offset.saturating_add(self.length))
        }
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        let this_end = self.end();
        let other_end = other.end();
        let starts_before_other_ends = match other_end {
            None => true,
            Some(end) => self.offset < end,
        };
        let other_starts_before_this_ends = match this_end {
            None => true,
            Some(end) => other.offset < end,
        };
        starts_before_other_ends && other_starts_before_this_ends
    }
}

/// Shared or exclusive.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Which protocol installed a byte-range lock. Conflict rules never
/// consult this; recall routing and observability do.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LockOrigin {
    Nlm,
    Smb,
}

/// Protocol-neutral identity of a lock holder: the client plus its
/// per-client lock-owner handle. Conflicts require different owners.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockOwner {
    pub client: String,
    pub handle: u64,
}

impl LockOwner {
    pub fn new(client: impl Into<String>, handle: u64) -> Self {
        Self { client: client.into(), handle }
    }
}

/// Identifier of a granted lock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LockId(pub u64);

/// A granted byte-range lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub id: LockId,
    pub file: FileId,
    pub range: ByteRange,
    pub kind: LockKind,
    pub owner: LockOwner,
    pub origin: LockOrigin,
    /// Persistent locks survive restart and are subject to reclaim.
    pub persistent: bool,
}

/// Two locks conflict iff their ranges overlap, their owners differ
/// and at least one is exclusive.
pub fn locks_conflict(a: &LockRecord, b: &LockRecord) -> bool {
    a.range.overlaps(&b.range)
        && a.owner != b.owner
        && (a.kind == LockKind::Exclusive || b.kind == LockKind::Exclusive)
}
