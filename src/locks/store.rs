//! Persistence contract for locks that survive server restart.

use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::metadata::FileId;

use super::range::{ByteRange, LockKind, LockOrigin, LockOwner};

/// The durable form of a persistent lock, loaded at startup to seed
/// the reclaim grace window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedLock {
    pub file: FileId,
    pub range: ByteRange,
    pub kind: LockKind,
    pub owner: LockOwner,
    pub origin: LockOrigin,
}

/// Backend-neutral persistent lock store. Failure of `load_all` at
/// startup is fatal for the server.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<PersistedLock>>;

    async fn save(&self, lock: &PersistedLock) -> Result<()>;

    async fn remove(&self, file: FileId, owner: &LockOwner) -> Result<()>;
}

/// In-memory lock store; tests seed it to exercise reclaim.
#[derive(Default)]
pub struct MemoryLockStore {
    locks: RwLock<Vec<PersistedLock>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(locks: Vec<PersistedLock>) -> Self {
        Self { locks: RwLock::new(locks) }
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn load_all(&self) -> Result<Vec<PersistedLock>> {
        let locks = self.locks.read().map_err(|_| Error::Io)?;
        Ok(locks.clone())
    }

    async fn save(&self, lock: &PersistedLock) -> Result<()> {
        let mut locks = self.locks.write().map_err(|_| Error::Io)?;
        locks.retain(|existing| {
            !(existing.file == lock.file && existing.owner == lock.owner
                && existing.range == lock.range)
        });
        locks.push(lock.clone());
        Ok(())
    }

    async fn remove(&self, file: FileId, owner: &LockOwner) -> Result<()> {
        let mut locks = self.locks.write().map_err(|_| Error::Io)?;
        locks.retain(|existing| !(existing.file == file && existing.owner == *owner));
        Ok(())
    }
}
