//! Defines the Filesystem Coordinator: the protocol-neutral facade
//! both adapters invoke for every operation.
//!
//! Each verb resolves the target share, authorizes the caller against
//! the share's permission policy, and orchestrates the metadata store,
//! the slice cache and the lock manager. Backend read failures are
//! retried with exponential backoff; writes surface immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::content::ContentStore;
use crate::error::{Error, Result};
use crate::identity::{effective_permission, AuthIdentity, IdentityStore};
use crate::locks::delegation::{DelegationId, LeaseOrigin, Scope};
use crate::locks::range::{ByteRange, LockId, LockKind, LockOrigin, LockOwner};
use crate::locks::{LockManager, LockRequest};
use crate::metadata::{
    validate_name, DirEntry, FileEntry, FileId, FileType, MetadataStore, ReadDirPage, SetAttr,
    SetTime, Unlinked,
};
use crate::session::{SessionManager, StateId};
use crate::share::{Share, ShareRegistry};

/// NFSv3-style access bits computed by [`FsCoordinator::access`].
pub const ACCESS_READ: u32 = 0x01;
pub const ACCESS_LOOKUP: u32 = 0x02;
pub const ACCESS_MODIFY: u32 = 0x04;
pub const ACCESS_EXTEND: u32 = 0x08;
pub const ACCESS_DELETE: u32 = 0x10;
pub const ACCESS_EXECUTE: u32 = 0x20;

/// Coalesce repeated mtime updates on one handle inside this window.
const TIME_COALESCE: Duration = Duration::from_secs(1);

/// Caller context every verb carries.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub identity: AuthIdentity,
    /// Protocol-neutral client identifier (lock holder tag).
    pub client: String,
    /// Aborts the verb at its next suspension point.
    pub deadline: Option<Instant>,
}

impl OpContext {
    pub fn new(identity: AuthIdentity, client: impl Into<String>) -> Self {
        Self { identity, client: client.into(), deadline: None }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Identifier of an open file handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

/// Result of [`FsCoordinator::open`].
#[derive(Debug, Clone)]
pub struct OpenResult {
    pub handle: HandleId,
    pub stateid: StateId,
    pub delegation: Option<DelegationId>,
}

/// One entry of a combined listing (readdirplus-style).
#[derive(Debug, Clone)]
pub struct DirEntryPlus {
    pub entry: DirEntry,
    pub attr: Option<FileEntry>,
}

/// Share usage totals.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ShareStat {
    pub bytes_used: u64,
    pub entries: u64,
}

struct OpenHandle {
    share: Arc<Share>,
    file: FileId,
    writes: bool,
    client: String,
    delegation: StdMutex<Option<DelegationId>>,
    /// Last metadata timestamp refresh for this handle.
    times: StdMutex<Instant>,
}

/// The coordinator. One instance per server.
pub struct FsCoordinator {
    registry: Arc<ShareRegistry>,
    identity: Arc<dyn IdentityStore>,
    locks: Arc<LockManager>,
    sessions: Arc<SessionManager>,
    handles: DashMap<HandleId, Arc<OpenHandle>>,
    next_handle: AtomicU64,
    retry: RetryConfig,
}

impl FsCoordinator {
    pub fn new(
        registry: Arc<ShareRegistry>,
        identity: Arc<dyn IdentityStore>,
        locks: Arc<LockManager>,
        sessions: Arc<SessionManager>,
        retry: RetryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            identity,
            locks,
            sessions,
            handles: DashMap::new(),
            next_handle: AtomicU64::new(1),
            retry,
        })
    }

    /// Resolves a path to its share and share-relative remainder.
    pub fn resolve_share(&self, path: &str) -> Result<(Arc<Share>, String)> {
        self.registry.resolve(path)
    }

    async fn authorize(&self, share: &Share, ctx: &OpContext, writes: bool) -> Result<()> {
        if writes && share.read_only {
            return Err(Error::ReadOnly);
        }
        let level = effective_permission(
            self.identity.as_ref(),
            &ctx.identity,
            &share.name,
            share.default_access,
            share.guest_allowed,
        )
        .await?;
        let allowed = if writes { level.allows_write() } else { level.allows_read() };
        if allowed {
            Ok(())
        } else {
            Err(Error::PermissionDenied)
        }
    }

    fn check_deadline(&self, ctx: &OpContext) -> Result<()> {
        match ctx.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::Timeout),
            _ => Ok(()),
        }
    }

    async fn retry_backoff(&self, attempt: u32) {
        tokio::time::sleep(self.retry.backoff(attempt)).await;
    }

    fn handle(&self, id: HandleId) -> Result<Arc<OpenHandle>> {
        self.handles.get(&id).map(|handle| handle.value().clone()).ok_or(Error::NotFound)
    }

    /// Resolves a name within a directory; no implicit creation.
    pub async fn lookup(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        parent: FileId,
        name: &str,
    ) -> Result<FileId> {
        self.authorize(share, ctx, false).await?;
        validate_name(name, &share.caps)?;
        let mut attempt = 0;
        loop {
            match share.metadata.lookup(parent, name).await {
                Err(error)
                    if error.is_retryable_read() && attempt + 1 < self.retry.read_attempts =>
                {
                    self.retry_backoff(attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub async fn getattr(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        id: FileId,
    ) -> Result<FileEntry> {
        self.authorize(share, ctx, false).await?;
        let mut attempt = 0;
        loop {
            match share.metadata.read_entry(id).await {
                Err(error)
                    if error.is_retryable_read() && attempt + 1 < self.retry.read_attempts =>
                {
                    self.retry_backoff(attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// NFSv3 ACCESS / SMB access check: the subset of `requested` the
    /// caller holds on this share.
    pub async fn access(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        requested: u32,
    ) -> Result<u32> {
        let level = effective_permission(
            self.identity.as_ref(),
            &ctx.identity,
            &share.name,
            share.default_access,
            share.guest_allowed,
        )
        .await?;
        let mut granted = 0;
        if level.allows_read() {
            granted |= ACCESS_READ | ACCESS_LOOKUP | ACCESS_EXECUTE;
        }
        if level.allows_write() && !share.read_only {
            granted |= ACCESS_MODIFY | ACCESS_EXTEND | ACCESS_DELETE;
        }
        Ok(requested & granted)
    }

    /// Atomic creation of a regular file; racing callers all but one
    /// observe `AlreadyExists`.
    pub async fn create_regular(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        parent: FileId,
        name: &str,
        mode: u32,
    ) -> Result<FileEntry> {
        self.authorize(share, ctx, true).await?;
        validate_name(name, &share.caps)?;
        let content = share.content.create().await?;
        match share
            .metadata
            .create(
                parent,
                name,
                FileType::Regular,
                mode,
                ctx.identity.uid,
                ctx.identity.gid,
                Some(content),
            )
            .await
        {
            Ok(entry) => Ok(entry),
            Err(error) => {
                // Lost the race (or the parent vanished); give the
                // orphaned content object back.
                let _ = share.content.delete(content).await;
                Err(error)
            }
        }
    }

    pub async fn mkdir(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        parent: FileId,
        name: &str,
        mode: u32,
    ) -> Result<FileEntry> {
        self.authorize(share, ctx, true).await?;
        validate_name(name, &share.caps)?;
        share.metadata.mkdir(parent, name, mode, ctx.identity.uid, ctx.identity.gid).await
    }

    pub async fn symlink(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        parent: FileId,
        name: &str,
        target: &str,
    ) -> Result<FileEntry> {
        self.authorize(share, ctx, true).await?;
        if !share.caps.symlinks {
            return Err(Error::Unsupported);
        }
        validate_name(name, &share.caps)?;
        share
            .metadata
            .symlink(parent, name, target, 0o777, ctx.identity.uid, ctx.identity.gid)
            .await
    }

    pub async fn readlink(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        id: FileId,
    ) -> Result<String> {
        self.authorize(share, ctx, false).await?;
        share.metadata.readlink(id).await
    }

    pub async fn link(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        parent: FileId,
        name: &str,
        target: FileId,
    ) -> Result<()> {
        self.authorize(share, ctx, true).await?;
        if !share.caps.hardlinks {
            return Err(Error::Unsupported);
        }
        validate_name(name, &share.caps)?;
        share.metadata.link(parent, name, target).await
    }

    /// Reclaims a now-unreferenced entry's content unless open handles
    /// still defer it to last close.
    async fn maybe_reclaim(&self, share: &Arc<Share>, unlinked: &Unlinked) {
        if unlinked.nlink_after != 0 || share.cache.open_count(unlinked.id).await != 0 {
            return;
        }
        if let Some(content) = unlinked.content {
            debug!(file = unlinked.id.0, "reclaiming content");
            share.cache.forget(unlinked.id).await;
            if let Err(error) = share.content.delete(content).await {
                warn!(file = unlinked.id.0, %error, "content reclamation failed");
            }
        }
    }

    /// Removes a name. When the link count reaches zero and no open
    /// handle remains, the content is reclaimed immediately; otherwise
    /// reclamation happens at last close.
    pub async fn unlink(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        parent: FileId,
        name: &str,
    ) -> Result<()> {
        self.authorize(share, ctx, true).await?;
        let unlinked = share.metadata.unlink(parent, name).await?;
        self.maybe_reclaim(share, &unlinked).await;
        Ok(())
    }

    pub async fn rmdir(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        parent: FileId,
        name: &str,
    ) -> Result<()> {
        self.authorize(share, ctx, true).await?;
        share.metadata.rmdir(parent, name).await
    }

    /// Atomic rename. Refuses to move a directory into its own
    /// descendant.
    pub async fn rename(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        src_parent: FileId,
        src_name: &str,
        dst_parent: FileId,
        dst_name: &str,
    ) -> Result<()> {
        self.authorize(share, ctx, true).await?;
        validate_name(dst_name, &share.caps)?;
        let moved = share.metadata.lookup(src_parent, src_name).await?;
        let moved_entry = share.metadata.read_entry(moved).await?;
        if moved_entry.is_dir() && src_parent != dst_parent {
            let mut cursor = Some(dst_parent);
            while let Some(dir) = cursor {
                if dir == moved {
                    return Err(Error::InvalidArgument);
                }
                cursor = share.metadata.parent_of(dir).await?;
            }
        }
        let displaced =
            share.metadata.rename(src_parent, src_name, dst_parent, dst_name).await?;
        if let Some(displaced) = displaced {
            self.maybe_reclaim(share, &displaced).await;
        }
        Ok(())
    }

    pub async fn set_attr(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        id: FileId,
        attr: SetAttr,
    ) -> Result<FileEntry> {
        self.authorize(share, ctx, true).await?;
        if let Some(size) = attr.size {
            self.apply_truncate(share, id, size).await?;
        }
        share.metadata.set_attr(id, attr).await
    }

    async fn apply_truncate(&self, share: &Arc<Share>, id: FileId, size: u64) -> Result<()> {
        let entry = share.metadata.read_entry(id).await?;
        if entry.is_dir() {
            return Err(Error::IsADirectory);
        }
        let Some(content) = entry.content else {
            return Err(Error::InvalidArgument);
        };
        if share.caps.max_file_size < size {
            return Err(Error::SizeLimitExceeded);
        }
        // Drop cache state past the cut first so no stale bytes
        // resurface, then cut the store.
        match share.cache.truncate(id, size).await {
            Ok(()) | Err(Error::NotFound) => {}
            Err(other) => return Err(other),
        }
        share.content.truncate(content, size).await
    }

    pub async fn readdir(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        dir: FileId,
        cookie: u64,
        verifier: u64,
        max_bytes: u32,
    ) -> Result<ReadDirPage> {
        self.authorize(share, ctx, false).await?;
        let mut attempt = 0;
        loop {
            match share.metadata.readdir(dir, cookie, verifier, max_bytes).await {
                Err(error)
                    if error.is_retryable_read() && attempt + 1 < self.retry.read_attempts =>
                {
                    self.retry_backoff(attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Combined listing with per-entry attributes for READDIRPLUS and
    /// SMB directory queries.
    pub async fn read_dir_plus(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        dir: FileId,
        cookie: u64,
        verifier: u64,
        max_bytes: u32,
    ) -> Result<(Vec<DirEntryPlus>, u64, bool)> {
        let page = self.readdir(share, ctx, dir, cookie, verifier, max_bytes).await?;
        let mut entries = Vec::with_capacity(page.entries.len());
        for entry in page.entries {
            let attr = share.metadata.read_entry(entry.id).await.ok();
            entries.push(DirEntryPlus { entry, attr });
        }
        Ok((entries, page.verifier, page.eof))
    }

    pub async fn get_xattr(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        id: FileId,
        name: &str,
    ) -> Result<Vec<u8>> {
        self.authorize(share, ctx, false).await?;
        share.metadata.get_xattr(id, name).await
    }

    pub async fn set_xattr(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        id: FileId,
        name: &str,
        value: Vec<u8>,
    ) -> Result<()> {
        self.authorize(share, ctx, true).await?;
        share.metadata.set_xattr(id, name, value).await
    }

    pub async fn remove_xattr(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        id: FileId,
        name: &str,
    ) -> Result<()> {
        self.authorize(share, ctx, true).await?;
        share.metadata.remove_xattr(id, name).await
    }

    pub async fn list_xattr(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        id: FileId,
    ) -> Result<Vec<String>> {
        self.authorize(share, ctx, false).await?;
        share.metadata.list_xattr(id).await
    }

    /// Opens a regular file: recalls conflicting foreign delegations,
    /// registers the open with the cache and lock manager, and
    /// optionally requests a delegation or lease for the caller.
    pub async fn open(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        id: FileId,
        writes: bool,
        want_delegation: Option<Scope>,
    ) -> Result<OpenResult> {
        self.authorize(share, ctx, writes).await?;
        self.check_deadline(ctx)?;
        let entry = share.metadata.read_entry(id).await?;
        if entry.is_dir() {
            return Err(Error::IsADirectory);
        }
        let Some(content) = entry.content else {
            return Err(Error::InvalidArgument);
        };

        self.locks.notify_open(id, &ctx.client, writes).await?;
        // The cache open count is what defers content reclamation to
        // last close.
        share.cache.open(id, content).await;

        let delegation = match want_delegation {
            Some(scope) => {
                let origin = match scope {
                    Scope::Lease(_) => LeaseOrigin::Smb,
                    _ => LeaseOrigin::Nfsv4,
                };
                match self.locks.request_delegation(id, &ctx.client, scope, origin).await {
                    Ok(delegation) => Some(delegation),
                    Err(Error::LockNotGranted) => None,
                    Err(other) => return Err(other),
                }
            }
            None => None,
        };

        let client_id = self.sessions.exchange_id(&ctx.client);
        let stateid = self.sessions.new_stateid(client_id);
        let handle = HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.handles.insert(
            handle,
            Arc::new(OpenHandle {
                share: share.clone(),
                file: id,
                writes,
                client: ctx.client.clone(),
                delegation: StdMutex::new(delegation),
                // Backdated so the first mutation refreshes the
                // timestamps; later ones coalesce.
                times: StdMutex::new(
                    Instant::now().checked_sub(TIME_COALESCE).unwrap_or_else(Instant::now),
                ),
            }),
        );
        debug!(file = id.0, handle = handle.0, writes, "file opened");
        Ok(OpenResult { handle, stateid, delegation })
    }

    /// Reads through the cache, clipped at end of file. The second
    /// element reports end-of-file so short reads are unambiguous.
    pub async fn read(
        &self,
        handle: HandleId,
        offset: u64,
        length: u64,
    ) -> Result<(Vec<u8>, bool)> {
        let open = self.handle(handle)?;
        let entry = open.share.metadata.read_entry(open.file).await?;
        if offset >= entry.size {
            return Ok((Vec::new(), true));
        }
        let clipped = length.min(entry.size - offset);
        let mut attempt = 0;
        let bytes = loop {
            match open.share.cache.read_at(open.file, offset, clipped).await {
                Err(error)
                    if error.is_retryable_read() && attempt + 1 < self.retry.read_attempts =>
                {
                    self.retry_backoff(attempt).await;
                    attempt += 1;
                }
                other => break other?,
            }
        };
        let eof = offset + clipped >= entry.size;
        Ok((bytes, eof))
    }

    /// Writes through the cache; the size is written through to the
    /// metadata store eagerly, the bytes lazily.
    pub async fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> Result<()> {
        let open = self.handle(handle)?;
        if !open.writes {
            return Err(Error::PermissionDenied);
        }
        let entry = open.share.metadata.read_entry(open.file).await?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(Error::InvalidArgument)?;
        if end > open.share.caps.max_file_size {
            return Err(Error::SizeLimitExceeded);
        }

        open.share.cache.write_at(open.file, offset, data).await?;

        let extended = end > entry.size;
        let refresh_times = {
            let mut times = open.times.lock().map_err(|_| Error::Io)?;
            if times.elapsed() >= TIME_COALESCE {
                *times = Instant::now();
                true
            } else {
                false
            }
        };
        if extended || refresh_times {
            let attr = SetAttr {
                size: if extended { Some(end) } else { None },
                mtime: SetTime::ServerCurrent,
                ..Default::default()
            };
            open.share.metadata.set_attr(open.file, attr).await?;
        }
        Ok(())
    }

    /// Synchronously flushes the range covered by earlier writes on
    /// this handle (the whole file's dirty set).
    pub async fn commit(&self, handle: HandleId, _offset: u64, _length: u64) -> Result<()> {
        let open = self.handle(handle)?;
        open.share.cache.flush_file(open.file).await
    }

    /// Truncate or extend through the cache; extension reads come back
    /// as zeros.
    pub async fn set_size(&self, handle: HandleId, size: u64) -> Result<()> {
        let open = self.handle(handle)?;
        if !open.writes {
            return Err(Error::PermissionDenied);
        }
        self.apply_truncate(&open.share, open.file, size).await?;
        let attr = SetAttr {
            size: Some(size),
            mtime: SetTime::ServerCurrent,
            ..Default::default()
        };
        open.share.metadata.set_attr(open.file, attr).await?;
        Ok(())
    }

    pub async fn size(&self, handle: HandleId) -> Result<u64> {
        let open = self.handle(handle)?;
        let entry = open.share.metadata.read_entry(open.file).await?;
        Ok(entry.size)
    }

    /// Closes a handle: flushes dirty bytes, returns a delegation
    /// granted on it, and reclaims content at last close of an
    /// unlinked file. Flush failures surface here, per the write-back
    /// contract.
    pub async fn close(&self, handle: HandleId) -> Result<()> {
        let (_, open) = self.handles.remove(&handle).ok_or(Error::NotFound)?;
        let entry = open.share.metadata.read_entry(open.file).await;
        let unlinked = entry.as_ref().map(|entry| entry.nlink == 0).unwrap_or(true);

        let flush_result = if unlinked {
            Ok(())
        } else {
            open.share.cache.flush_file(open.file).await
        };

        if let Some(delegation) = open
            .delegation
            .lock()
            .ok()
            .and_then(|mut delegation| delegation.take())
        {
            let _ = self.locks.return_delegation(delegation).await;
        }
        self.locks.notify_close(open.file, &open.client).await;

        let remaining = open.share.cache.close(open.file).await?;
        if remaining == 0 && unlinked {
            if let Ok(entry) = entry {
                let info =
                    Unlinked { id: open.file, nlink_after: 0, content: entry.content };
                self.maybe_reclaim(&open.share, &info).await;
            }
        }
        flush_result
    }

    /// Byte-range lock acquisition with the principal-derived owner.
    #[allow(clippy::too_many_arguments)]
    pub async fn acquire_lock(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        file: FileId,
        range: ByteRange,
        kind: LockKind,
        owner_handle: u64,
        origin: LockOrigin,
        reclaim: bool,
        blocking: bool,
        persistent: bool,
    ) -> Result<LockId> {
        self.authorize(share, ctx, false).await?;
        self.check_deadline(ctx)?;
        let request = LockRequest {
            file,
            range,
            kind,
            owner: LockOwner::new(ctx.client.clone(), owner_handle),
            origin,
            reclaim,
            blocking,
            persistent,
        };
        self.locks.acquire_lock(request, ctx.deadline).await
    }

    pub async fn release_lock(&self, lock: LockId) -> Result<()> {
        self.locks.release_lock(lock).await
    }

    pub async fn request_delegation(
        &self,
        share: &Arc<Share>,
        ctx: &OpContext,
        file: FileId,
        scope: Scope,
        origin: LeaseOrigin,
    ) -> Result<DelegationId> {
        self.authorize(share, ctx, false).await?;
        self.locks.request_delegation(file, &ctx.client, scope, origin).await
    }

    pub async fn return_delegation(&self, delegation: DelegationId) -> Result<()> {
        self.locks.return_delegation(delegation).await
    }

    /// NSM reboot notification for `client`.
    pub async fn client_rebooted(&self, client: &str) {
        self.locks.client_rebooted(client).await;
    }

    /// Share usage totals for FSSTAT-style queries.
    pub async fn share_stat(&self, share: &Arc<Share>, ctx: &OpContext) -> Result<ShareStat> {
        self.authorize(share, ctx, false).await?;
        let bytes_used = share.content.total_bytes().await?;
        let entries = share.metadata.entry_count().await?;
        Ok(ShareStat { bytes_used, entries })
    }

    /// Open handles currently registered; observability.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }
}
