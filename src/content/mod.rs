//! Defines the backend-neutral [`ContentStore`] contract for file bytes.
//!
//! The store is keyed by opaque handles and is append-tolerant but not
//! ordered: the cache layer serializes per-file writes so readers never
//! observe a torn mix of pre- and post-write bytes.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;

/// Opaque identifier handed to the content store for byte I/O.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHandle(pub u64);

/// Backend-neutral content contract.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Allocates a fresh handle with zero bytes behind it.
    async fn create(&self) -> Result<ContentHandle>;

    /// Reads up to `length` bytes at `offset`; short reads mean end of
    /// object.
    async fn read(&self, handle: ContentHandle, offset: u64, length: u32) -> Result<Vec<u8>>;

    /// Writes bytes at `offset`, zero-filling any gap. May buffer;
    /// durability is owed only once the call returns.
    async fn write(&self, handle: ContentHandle, offset: u64, data: &[u8]) -> Result<()>;

    /// Truncates or zero-extends the object to `size`.
    async fn truncate(&self, handle: ContentHandle, size: u64) -> Result<()>;

    /// Reports the object's current size.
    async fn stat(&self, handle: ContentHandle) -> Result<u64>;

    /// Removes the object.
    async fn delete(&self, handle: ContentHandle) -> Result<()>;

    /// Total bytes held across all objects, for share statistics.
    async fn total_bytes(&self) -> Result<u64>;
}
