//! Defines the file entry model and the backend-neutral [`MetadataStore`]
//! contract.
//!
//! Backends either serialize natively (SQL, embedded KV) or follow the
//! in-memory store's mutex discipline; see [`memory`].

pub mod memory;

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::content::ContentHandle;
use crate::error::Result;

/// Maximum length of names passed into [`MetadataStore`] methods.
pub const MAX_NAME_LEN: usize = 255;

/// Unique file identifier, stable for the entry's lifetime.
///
/// Never reused while the link count is positive or an open handle
/// exists.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u64);

/// File type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    /// Device nodes, sockets and fifos; carried for protocol fidelity,
    /// no content handle.
    Special,
}

/// Timestamp with nanosecond resolution where the backend supports it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Self { seconds: elapsed.as_secs() as i64, nanos: elapsed.subsec_nanos() },
            Err(_) => Self { seconds: 0, nanos: 0 },
        }
    }

    pub const fn zero() -> Self {
        Self { seconds: 0, nanos: 0 }
    }
}

/// The inode-like core record describing a file, directory or link.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub id: FileId,
    pub file_type: FileType,
    /// POSIX permission bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    /// Size in bytes; meaningful for regular files only, unspecified
    /// for directories.
    pub size: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
    /// Content handle; regular files only.
    pub content: Option<ContentHandle>,
    /// Symlink target; symlinks only.
    pub symlink_target: Option<String>,
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }
}

/// Strategy for updating timestamps in [`SetAttr`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SetTime {
    #[default]
    DontChange,
    ServerCurrent,
    ClientProvided(Timestamp),
}

/// Attribute mutations.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Size changes must be coordinated with the cache; the coordinator
    /// owns that ordering.
    pub size: Option<u64>,
    pub atime: SetTime,
    pub mtime: SetTime,
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Cookie that resumes enumeration immediately after this entry.
    pub cookie: u64,
    pub name: String,
    pub id: FileId,
}

/// Result of a [`MetadataStore::readdir`] page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDirPage {
    pub entries: Vec<DirEntry>,
    /// Opaque verifier binding resumed cookies to one enumeration.
    pub verifier: u64,
    pub eof: bool,
}

/// Outcome of an unlink, so the caller can schedule content
/// reclamation when the open count drains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unlinked {
    pub id: FileId,
    pub nlink_after: u32,
    pub content: Option<ContentHandle>,
}

/// Capabilities a metadata backend advertises.
///
/// Adapters and the coordinator must not attempt operations the store
/// does not advertise.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MetadataCaps {
    pub max_name_len: usize,
    pub max_file_size: u64,
    pub hardlinks: bool,
    pub symlinks: bool,
    /// Timestamp resolution in nanoseconds (1 = full nanosecond).
    pub time_granularity_ns: u32,
    pub case_sensitive: bool,
}

/// Attributes for a share's lazily-created root directory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RootAttrs {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Default for RootAttrs {
    fn default() -> Self {
        Self { mode: 0o755, uid: 0, gid: 0 }
    }
}

/// Backend-neutral metadata contract.
///
/// All operations run under a transactional discipline: either the
/// backend serializes natively or it guards a single state table the
/// way [`memory::MemoryMetadataStore`] does. `rename` in particular is
/// all-or-nothing; backends without native transactions must serialize
/// renames themselves.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Advertised capability set, inspected once at share bind.
    fn capabilities(&self) -> MetadataCaps;

    /// Returns the root directory, creating it on first bind.
    async fn ensure_root(&self, attrs: RootAttrs) -> Result<FileId>;

    /// Resolves a name within a directory.
    async fn lookup(&self, parent: FileId, name: &str) -> Result<FileId>;

    /// Loads a full entry record.
    async fn read_entry(&self, id: FileId) -> Result<FileEntry>;

    /// Creates a regular or special file. `content` carries the content
    /// handle for regular files; races produce `AlreadyExists` for all
    /// but one caller.
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
    ) -> Result<FileEntry>;

    /// Creates a directory.
    async fn mkdir(&self, parent: FileId, name: &str, mode: u32, uid: u32, gid: u32)
        -> Result<FileEntry>;

    /// Creates a hard link to `target` under `parent`. Fails with
    /// `IsADirectory` for directory targets.
    async fn link(&self, parent: FileId, name: &str, target: FileId) -> Result<()>;

    /// Removes a non-directory name, atomically decrementing the link
    /// count.
    async fn unlink(&self, parent: FileId, name: &str) -> Result<Unlinked>;

    /// Removes an empty directory.
    async fn rmdir(&self, parent: FileId, name: &str) -> Result<()>;

    /// Atomically moves `src_parent/src_name` to `dst_parent/dst_name`,
    /// overwriting a compatible existing destination. A destination
    /// directory must be empty. Reports the displaced entry, if any,
    /// so the caller can reclaim its content like an unlink.
    async fn rename(
        &self,
        src_parent: FileId,
        src_name: &str,
        dst_parent: FileId,
        dst_name: &str,
    ) -> Result<Option<Unlinked>>;

    /// Applies attribute mutations and returns the updated entry.
    async fn set_attr(&self, id: FileId, attr: SetAttr) -> Result<FileEntry>;

    /// Pages through a directory. Cookie 0 starts a fresh enumeration;
    /// resumed cookies must carry the verifier from the first page.
    /// Entries appear in insertion-stable order; a resumed enumeration
    /// yields each entry that existed for the whole enumeration at most
    /// once and never skips one.
    async fn readdir(
        &self,
        dir: FileId,
        cookie: u64,
        verifier: u64,
        max_bytes: u32,
    ) -> Result<ReadDirPage>;

    /// Creates a symbolic link.
    async fn symlink(
        &self,
        parent: FileId,
        name: &str,
        target: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<FileEntry>;

    /// Reads a symbolic link target.
    async fn readlink(&self, id: FileId) -> Result<String>;

    async fn get_xattr(&self, id: FileId, name: &str) -> Result<Vec<u8>>;

    async fn set_xattr(&self, id: FileId, name: &str, value: Vec<u8>) -> Result<()>;

    async fn remove_xattr(&self, id: FileId, name: &str) -> Result<()>;

    async fn list_xattr(&self, id: FileId) -> Result<Vec<String>>;

    /// Number of live entries, for share statistics.
    async fn entry_count(&self) -> Result<u64>;

    /// Parent of a directory, `None` for the share root. Used for
    /// rename cycle checks.
    async fn parent_of(&self, dir: FileId) -> Result<Option<FileId>>;
}

/// Validates a directory entry name against the advertised limits.
pub fn validate_name(name: &str, caps: &MetadataCaps) -> Result<()> {
    use crate::error::Error;

    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::InvalidArgument);
    }
    if name.len() > caps.max_name_len {
        return Err(Error::NameTooLong);
    }
    if name.bytes().any(|b| b == 0 || b == b'/') {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}
