//! In-memory [`ContentStore`] used by tests and the demo server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use super::{ContentHandle, ContentStore};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct MemoryContentStore {
    objects: RwLock<HashMap<ContentHandle, Vec<u8>>>,
    next_handle: AtomicU64,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self { objects: RwLock::new(HashMap::new()), next_handle: AtomicU64::new(1) }
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn create(&self) -> Result<ContentHandle> {
        let handle = ContentHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut objects = self.objects.write().map_err(|_| Error::Io)?;
        objects.insert(handle, Vec::new());
        Ok(handle)
    }

    async fn read(&self, handle: ContentHandle, offset: u64, length: u32) -> Result<Vec<u8>> {
        let objects = self.objects.read().map_err(|_| Error::Io)?;
        let bytes = objects.get(&handle).ok_or(Error::NotFound)?;
        let start = offset.min(bytes.len() as u64) as usize;
        let end = (offset.saturating_add(length as u64)).min(bytes.len() as u64) as usize;
        Ok(bytes[start..end].to_vec())
    }

    async fn write(&self, handle: ContentHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut objects = self.objects.write().map_err(|_| Error::Io)?;
        let bytes = objects.get_mut(&handle).ok_or(Error::NotFound)?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(Error::SizeLimitExceeded)? as usize;
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    async fn truncate(&self, handle: ContentHandle, size: u64) -> Result<()> {
        let mut objects = self.objects.write().map_err(|_| Error::Io)?;
        let bytes = objects.get_mut(&handle).ok_or(Error::NotFound)?;
        bytes.resize(size as usize, 0);
        Ok(())
    }

    async fn stat(&self, handle: ContentHandle) -> Result<u64> {
        let objects = self.objects.read().map_err(|_| Error::Io)?;
        let bytes = objects.get(&handle).ok_or(Error::NotFound)?;
        Ok(bytes.len() as u64)
    }

    async fn delete(&self, handle: ContentHandle) -> Result<()> {
        let mut objects = self.objects.write().map_err(|_| Error::Io)?;
        objects.remove(&handle).ok_or(Error::NotFound)?;
        Ok(())
    }

    async fn total_bytes(&self) -> Result<u64> {
        let objects = self.objects.read().map_err(|_| Error::Io)?;
        Ok(objects.values().map(|bytes| bytes.len() as u64).sum())
    }
}
