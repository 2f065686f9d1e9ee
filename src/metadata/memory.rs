//! In-memory [`MetadataStore`] with explicit mutex discipline.
//!
//! A single `RwLock` guards the whole table; no await point is reached
//! while the guard is held. Directory enumeration uses snapshot read
//! semantics: the first page captures the listing and resumed cookies
//! serve from that snapshot, so an enumeration never yields an entry
//! twice and never skips one that existed for its whole duration.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use tracing::debug;

use super::{
    validate_name, DirEntry, FileEntry, FileId, FileType, MetadataCaps, MetadataStore,
    ReadDirPage, RootAttrs, SetAttr, SetTime, Timestamp, Unlinked, MAX_NAME_LEN,
};
use crate::content::ContentHandle;
use crate::error::{Error, Result};

/// Estimated wire cost of one directory entry, used to honor the
/// caller's byte ceiling.
const DIR_ENTRY_OVERHEAD: usize = 24;

/// How long a captured enumeration snapshot stays resumable.
const SNAPSHOT_TTL: Duration = Duration::from_secs(60);

const SNAPSHOT_CAPACITY: u64 = 1024;

struct DirContent {
    parent: FileId,
    /// Insertion-stable listing order.
    order: Vec<String>,
    byname: HashMap<String, FileId>,
    /// Bumped on every mutation; doubles as the enumeration verifier.
    mutation: u64,
}

impl DirContent {
    fn new(parent: FileId) -> Self {
        Self { parent, order: Vec::new(), byname: HashMap::new(), mutation: 0 }
    }

    fn insert(&mut self, name: &str, id: FileId) {
        self.order.push(name.to_owned());
        self.byname.insert(name.to_owned(), id);
        self.mutation += 1;
    }

    fn remove(&mut self, name: &str) -> Option<FileId> {
        let id = self.byname.remove(name)?;
        self.order.retain(|existing| existing != name);
        self.mutation += 1;
        Some(id)
    }
}

struct Inner {
    next_id: u64,
    entries: HashMap<FileId, FileEntry>,
    dirs: HashMap<FileId, DirContent>,
    root: Option<FileId>,
}

pub struct MemoryMetadataStore {
    inner: RwLock<Inner>,
    /// Snapshots keyed by (directory id, verifier).
    snapshots: Cache<(u64, u64), Arc<Vec<(String, FileId)>>>,
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_id: 1,
                entries: HashMap::new(),
                dirs: HashMap::new(),
                root: None,
            }),
            snapshots: Cache::builder()
                .max_capacity(SNAPSHOT_CAPACITY)
                .time_to_live(SNAPSHOT_TTL)
                .build(),
        }
    }

    /// Parent directory of a directory entry, `None` for the root.
    /// The coordinator walks this chain for rename cycle checks.
    pub fn parent_of_sync(&self, dir: FileId) -> Result<Option<FileId>> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        let content = inner.dirs.get(&dir).ok_or(Error::NotFound)?;
        if inner.root == Some(dir) {
            Ok(None)
        } else {
            Ok(Some(content.parent))
        }
    }
}

fn new_entry(
    id: FileId,
    file_type: FileType,
    mode: u32,
    uid: u32,
    gid: u32,
    content: Option<ContentHandle>,
    symlink_target: Option<String>,
) -> FileEntry {
    let now = Timestamp::now();
    FileEntry {
        id,
        file_type,
        mode,
        uid,
        gid,
        nlink: 1,
        size: 0,
        atime: now,
        mtime: now,
        ctime: now,
        content,
        symlink_target,
        xattrs: BTreeMap::new(),
    }
}

impl Inner {
    fn alloc_id(&mut self) -> FileId {
        let id = FileId(self.next_id);
        self.next_id += 1;
        id
    }

    fn dir_mut(&mut self, id: FileId) -> Result<&mut DirContent> {
        if !self.entries.contains_key(&id) {
            return Err(Error::NotFound);
        }
        self.dirs.get_mut(&id).ok_or(Error::NotADirectory)
    }

    fn dir(&self, id: FileId) -> Result<&DirContent> {
        if !self.entries.contains_key(&id) {
            return Err(Error::NotFound);
        }
        self.dirs.get(&id).ok_or(Error::NotADirectory)
    }

    fn insert_child(
        &mut self,
        parent: FileId,
        name: &str,
        entry: FileEntry,
        dir_content: Option<DirContent>,
    ) -> Result<FileEntry> {
        let dir = self.dir_mut(parent)?;
        if dir.byname.contains_key(name) {
            return Err(Error::AlreadyExists);
        }
        dir.insert(name, entry.id);
        if let Some(content) = dir_content {
            self.dirs.insert(entry.id, content);
        }
        self.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    fn capabilities(&self) -> MetadataCaps {
        MetadataCaps {
            max_name_len: MAX_NAME_LEN,
            max_file_size: u64::MAX,
            hardlinks: true,
            symlinks: true,
            time_granularity_ns: 1,
            case_sensitive: true,
        }
    }

    async fn ensure_root(&self, attrs: RootAttrs) -> Result<FileId> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        if let Some(root) = inner.root {
            return Ok(root);
        }
        let id = inner.alloc_id();
        let mut entry = new_entry(id, FileType::Directory, attrs.mode, attrs.uid, attrs.gid, None, None);
        entry.nlink = 2;
        inner.entries.insert(id, entry);
        inner.dirs.insert(id, DirContent::new(id));
        inner.root = Some(id);
        debug!(root = id.0, "created share root");
        Ok(id)
    }

    async fn lookup(&self, parent: FileId, name: &str) -> Result<FileId> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        let dir = inner.dir(parent)?;
        dir.byname.get(name).copied().ok_or(Error::NotFound)
    }

    async fn read_entry(&self, id: FileId) -> Result<FileEntry> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        inner.entries.get(&id).cloned().ok_or(Error::NotFound)
    }

    #[allow(clippy::too_many_arguments)]
    async fn create(
        &self,
        parent: FileId,
        name: &str,
        file_type: FileType,
        mode: u32,
        uid: u32,
        gid: u32,
        content: Option<ContentHandle>,
    ) -> Result<FileEntry> {
        validate_name(name, &self.capabilities())?;
        match file_type {
            FileType::Regular if content.is_none() => return Err(Error::InvalidArgument),
            FileType::Special | FileType::Regular => {}
            _ => return Err(Error::InvalidArgument),
        }
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        let id = inner.alloc_id();
        let entry = new_entry(id, file_type, mode, uid, gid, content, None);
        inner.insert_child(parent, name, entry, None)
    }

    async fn mkdir(
        &self,
        parent: FileId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<FileEntry> {
        validate_name(name, &self.capabilities())?;
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        let id = inner.alloc_id();
        let mut entry = new_entry(id, FileType::Directory, mode, uid, gid, None, None);
        entry.nlink = 2;
        inner.insert_child(parent, name, entry, Some(DirContent::new(parent)))
    }

    async fn link(&self, parent: FileId, name: &str, target: FileId) -> Result<()> {
        validate_name(name, &self.capabilities())?;
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        let target_entry = inner.entries.get(&target).ok_or(Error::NotFound)?;
        if target_entry.is_dir() {
            return Err(Error::IsADirectory);
        }
        let dir = inner.dir_mut(parent)?;
        if dir.byname.contains_key(name) {
            return Err(Error::AlreadyExists);
        }
        dir.insert(name, target);
        let entry = inner.entries.get_mut(&target).ok_or(Error::NotFound)?;
        entry.nlink += 1;
        entry.ctime = Timestamp::now();
        Ok(())
    }

    async fn unlink(&self, parent: FileId, name: &str) -> Result<Unlinked> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        let dir = inner.dir(parent)?;
        let id = dir.byname.get(name).copied().ok_or(Error::NotFound)?;
        if inner.entries.get(&id).is_some_and(|entry| entry.is_dir()) {
            return Err(Error::IsADirectory);
        }
        let dir = inner.dir_mut(parent)?;
        dir.remove(name);
        let entry = inner.entries.get_mut(&id).ok_or(Error::NotFound)?;
        entry.nlink = entry.nlink.saturating_sub(1);
        entry.ctime = Timestamp::now();
        let unlinked =
            Unlinked { id, nlink_after: entry.nlink, content: entry.content };
        // The entry record stays while the link count is zero so open
        // handles can still stat it; content reclamation happens at
        // last close.
        Ok(unlinked)
    }

    async fn rmdir(&self, parent: FileId, name: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        let dir = inner.dir(parent)?;
        let id = dir.byname.get(name).copied().ok_or(Error::NotFound)?;
        let victim = inner.dirs.get(&id).ok_or(Error::NotADirectory)?;
        if !victim.order.is_empty() {
            return Err(Error::NotEmpty);
        }
        let dir = inner.dir_mut(parent)?;
        dir.remove(name);
        inner.dirs.remove(&id);
        inner.entries.remove(&id);
        Ok(())
    }

    async fn rename(
        &self,
        src_parent: FileId,
        src_name: &str,
        dst_parent: FileId,
        dst_name: &str,
    ) -> Result<Option<Unlinked>> {
        validate_name(dst_name, &self.capabilities())?;
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;

        let moved = inner
            .dir(src_parent)?
            .byname
            .get(src_name)
            .copied()
            .ok_or(Error::NotFound)?;
        if src_parent == dst_parent && src_name == dst_name {
            return Ok(None);
        }
        let moved_is_dir = inner.entries.get(&moved).is_some_and(|entry| entry.is_dir());

        // Validate the destination before touching anything so the
        // operation stays all-or-nothing.
        let displaced = inner.dir(dst_parent)?.byname.get(dst_name).copied();
        if let Some(existing) = displaced {
            let existing_is_dir =
                inner.entries.get(&existing).is_some_and(|entry| entry.is_dir());
            match (moved_is_dir, existing_is_dir) {
                (true, true) => {
                    let content = inner.dirs.get(&existing).ok_or(Error::NotADirectory)?;
                    if !content.order.is_empty() {
                        return Err(Error::NotEmpty);
                    }
                }
                (true, false) => return Err(Error::NotADirectory),
                (false, true) => return Err(Error::IsADirectory),
                (false, false) => {}
            }
        }

        let mut displaced_info = None;
        if let Some(existing) = displaced {
            let dst = inner.dir_mut(dst_parent)?;
            dst.remove(dst_name);
            if inner.dirs.remove(&existing).is_some() {
                inner.entries.remove(&existing);
            } else if let Some(entry) = inner.entries.get_mut(&existing) {
                entry.nlink = entry.nlink.saturating_sub(1);
                entry.ctime = Timestamp::now();
                displaced_info = Some(Unlinked {
                    id: existing,
                    nlink_after: entry.nlink,
                    content: entry.content,
                });
            }
        }

        let src = inner.dir_mut(src_parent)?;
        src.remove(src_name);
        let dst = inner.dir_mut(dst_parent)?;
        dst.insert(dst_name, moved);
        if moved_is_dir {
            if let Some(content) = inner.dirs.get_mut(&moved) {
                content.parent = dst_parent;
            }
        }
        if let Some(entry) = inner.entries.get_mut(&moved) {
            entry.ctime = Timestamp::now();
        }
        Ok(displaced_info)
    }

    async fn set_attr(&self, id: FileId, attr: SetAttr) -> Result<FileEntry> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        let entry = inner.entries.get_mut(&id).ok_or(Error::NotFound)?;

        if let Some(size) = attr.size {
            match entry.file_type {
                FileType::Regular => entry.size = size,
                FileType::Directory => return Err(Error::IsADirectory),
                _ => return Err(Error::InvalidArgument),
            }
        }
        if let Some(mode) = attr.mode {
            entry.mode = mode & 0o7777;
        }
        if let Some(uid) = attr.uid {
            entry.uid = uid;
        }
        if let Some(gid) = attr.gid {
            entry.gid = gid;
        }
        match attr.atime {
            SetTime::DontChange => {}
            SetTime::ServerCurrent => entry.atime = Timestamp::now(),
            SetTime::ClientProvided(time) => entry.atime = time,
        }
        match attr.mtime {
            SetTime::DontChange => {}
            SetTime::ServerCurrent => entry.mtime = Timestamp::now(),
            SetTime::ClientProvided(time) => entry.mtime = time,
        }
        entry.ctime = Timestamp::now();
        Ok(entry.clone())
    }

    async fn readdir(
        &self,
        dir: FileId,
        cookie: u64,
        verifier: u64,
        max_bytes: u32,
    ) -> Result<ReadDirPage> {
        let (snapshot, verifier) = {
            let inner = self.inner.read().map_err(|_| Error::Io)?;
            let content = inner.dir(dir)?;
            if cookie == 0 {
                let listing: Arc<Vec<(String, FileId)>> = Arc::new(
                    content
                        .order
                        .iter()
                        .map(|name| (name.clone(), content.byname[name]))
                        .collect(),
                );
                self.snapshots.insert((dir.0, content.mutation), listing.clone());
                (listing, content.mutation)
            } else if let Some(listing) = self.snapshots.get(&(dir.0, verifier)) {
                (listing, verifier)
            } else {
                // Snapshot aged out or the verifier predates a
                // mutation: resume from live state. Weakly consistent,
                // as the contract permits.
                let listing: Arc<Vec<(String, FileId)>> = Arc::new(
                    content
                        .order
                        .iter()
                        .map(|name| (name.clone(), content.byname[name]))
                        .collect(),
                );
                (listing, content.mutation)
            }
        };

        let mut entries = Vec::new();
        let mut budget = max_bytes as usize;
        let start = cookie as usize;
        let mut eof = true;
        for (index, (name, id)) in snapshot.iter().enumerate().skip(start) {
            let cost = name.len() + DIR_ENTRY_OVERHEAD;
            if cost > budget && !entries.is_empty() {
                eof = false;
                break;
            }
            if cost > budget {
                return Err(Error::InvalidArgument);
            }
            budget -= cost;
            entries.push(DirEntry { cookie: index as u64 + 1, name: name.clone(), id: *id });
        }
        Ok(ReadDirPage { entries, verifier, eof })
    }

    async fn symlink(
        &self,
        parent: FileId,
        name: &str,
        target: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<FileEntry> {
        validate_name(name, &self.capabilities())?;
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        let id = inner.alloc_id();
        let entry =
            new_entry(id, FileType::Symlink, mode, uid, gid, None, Some(target.to_owned()));
        inner.insert_child(parent, name, entry, None)
    }

    async fn readlink(&self, id: FileId) -> Result<String> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        let entry = inner.entries.get(&id).ok_or(Error::NotFound)?;
        entry.symlink_target.clone().ok_or(Error::InvalidArgument)
    }

    async fn get_xattr(&self, id: FileId, name: &str) -> Result<Vec<u8>> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        let entry = inner.entries.get(&id).ok_or(Error::NotFound)?;
        entry.xattrs.get(name).cloned().ok_or(Error::NotFound)
    }

    async fn set_xattr(&self, id: FileId, name: &str, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        let entry = inner.entries.get_mut(&id).ok_or(Error::NotFound)?;
        entry.xattrs.insert(name.to_owned(), value);
        entry.ctime = Timestamp::now();
        Ok(())
    }

    async fn remove_xattr(&self, id: FileId, name: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        let entry = inner.entries.get_mut(&id).ok_or(Error::NotFound)?;
        entry.xattrs.remove(name).ok_or(Error::NotFound)?;
        entry.ctime = Timestamp::now();
        Ok(())
    }

    async fn list_xattr(&self, id: FileId) -> Result<Vec<String>> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        let entry = inner.entries.get(&id).ok_or(Error::NotFound)?;
        Ok(entry.xattrs.keys().cloned().collect())
    }

    async fn entry_count(&self) -> Result<u64> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        Ok(inner.entries.len() as u64)
    }

    async fn parent_of(&self, dir: FileId) -> Result<Option<FileId>> {
        self.parent_of_sync(dir)
    }
}
