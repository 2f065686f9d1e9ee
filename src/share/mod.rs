//! Defines the store registry and the share registry: named mount
//! points bound to a (metadata store, content store, cache,
//! permissions, root attributes) tuple.
//!
//! Stores are registered by name and may not be deleted while a share
//! references them. Shares bind lazily: the root entry is created at
//! bind time from the share's configured root attributes. Permission
//! edits are hot and visible to the very next request.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::cache::SliceCache;
use crate::content::ContentStore;
use crate::error::{Error, Result};
use crate::identity::{IdentityStore, Permission};
use crate::metadata::{FileId, MetadataCaps, MetadataStore, RootAttrs};

/// A bound share.
pub struct Share {
    pub name: String,
    pub metadata: Arc<dyn MetadataStore>,
    pub content: Arc<dyn ContentStore>,
    pub cache: Arc<SliceCache>,
    pub root: FileId,
    pub read_only: bool,
    /// Level for authenticated users with no explicit mapping.
    pub default_access: Permission,
    pub guest_allowed: bool,
    /// Captured at bind; the coordinator refuses operations the store
    /// does not advertise.
    pub caps: MetadataCaps,
    metadata_store_name: String,
    content_store_name: String,
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("read_only", &self.read_only)
            .field("default_access", &self.default_access)
            .field("guest_allowed", &self.guest_allowed)
            .field("caps", &self.caps)
            .field("metadata_store_name", &self.metadata_store_name)
            .field("content_store_name", &self.content_store_name)
            .finish()
    }
}

/// Parameters for creating a share.
#[derive(Debug, Clone)]
pub struct ShareSpec {
    /// Absolute path-like name, e.g. `/export`.
    pub name: String,
    /// Registered metadata store to bind.
    pub metadata_store: String,
    /// Registered content store to bind.
    pub content_store: String,
    /// Cache byte budget for this share's binding.
    pub cache_budget: u64,
    pub read_only: bool,
    pub default_access: Permission,
    pub guest_allowed: bool,
    pub root_attrs: RootAttrs,
}

struct Inner {
    metadata_stores: HashMap<String, Arc<dyn MetadataStore>>,
    content_stores: HashMap<String, Arc<dyn ContentStore>>,
    shares: HashMap<String, Arc<Share>>,
}

/// Registry of stores and shares; the target of adapter lookups.
pub struct ShareRegistry {
    inner: RwLock<Inner>,
    identity: Arc<dyn IdentityStore>,
}

impl ShareRegistry {
    pub fn new(identity: Arc<dyn IdentityStore>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                metadata_stores: HashMap::new(),
                content_stores: HashMap::new(),
                shares: HashMap::new(),
            }),
            identity,
        }
    }

    pub fn register_metadata_store(
        &self,
        name: &str,
        store: Arc<dyn MetadataStore>,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        if inner.metadata_stores.contains_key(name) {
            return Err(Error::AlreadyExists);
        }
        inner.metadata_stores.insert(name.to_owned(), store);
        Ok(())
    }

    pub fn register_content_store(&self, name: &str, store: Arc<dyn ContentStore>) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        if inner.content_stores.contains_key(name) {
            return Err(Error::AlreadyExists);
        }
        inner.content_stores.insert(name.to_owned(), store);
        Ok(())
    }

    /// Removes a registered metadata store. Refused while any share
    /// still binds it.
    pub fn unregister_metadata_store(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        if inner.shares.values().any(|share| share.metadata_store_name == name) {
            return Err(Error::InvalidArgument);
        }
        inner.metadata_stores.remove(name).ok_or(Error::NotFound)?;
        Ok(())
    }

    pub fn unregister_content_store(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        if inner.shares.values().any(|share| share.content_store_name == name) {
            return Err(Error::InvalidArgument);
        }
        inner.content_stores.remove(name).ok_or(Error::NotFound)?;
        Ok(())
    }

    /// Creates and binds a share: resolves its stores, creates the
    /// root entry from the configured attributes, and publishes it.
    pub async fn create_share(&self, spec: ShareSpec) -> Result<Arc<Share>> {
        if !spec.name.starts_with('/') || spec.name.len() < 2 {
            return Err(Error::InvalidArgument);
        }
        let (metadata, content) = {
            let inner = self.inner.read().map_err(|_| Error::Io)?;
            if inner.shares.contains_key(&spec.name) {
                return Err(Error::AlreadyExists);
            }
            let metadata =
                inner.metadata_stores.get(&spec.metadata_store).cloned().ok_or(Error::NotFound)?;
            let content =
                inner.content_stores.get(&spec.content_store).cloned().ok_or(Error::NotFound)?;
            (metadata, content)
        };

        let root = metadata.ensure_root(spec.root_attrs).await?;
        let caps = metadata.capabilities();
        let cache = Arc::new(SliceCache::new(content.clone(), spec.cache_budget));
        let share = Arc::new(Share {
            name: spec.name.clone(),
            metadata,
            content,
            cache,
            root,
            read_only: spec.read_only,
            default_access: spec.default_access,
            guest_allowed: spec.guest_allowed,
            caps,
            metadata_store_name: spec.metadata_store,
            content_store_name: spec.content_store,
        });

        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        if inner.shares.contains_key(&spec.name) {
            return Err(Error::AlreadyExists);
        }
        inner.shares.insert(spec.name.clone(), share.clone());
        info!(share = %spec.name, "share bound");
        Ok(share)
    }

    /// Deletes a share and strips its dependent permissions from the
    /// identity store.
    pub async fn delete_share(&self, name: &str) -> Result<()> {
        {
            let mut inner = self.inner.write().map_err(|_| Error::Io)?;
            inner.shares.remove(name).ok_or(Error::NotFound)?;
        }
        self.identity.drop_share(name).await?;
        info!(share = name, "share deleted");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<Share>> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        inner.shares.get(name).cloned().ok_or(Error::NotFound)
    }

    pub fn list(&self) -> Vec<Arc<Share>> {
        match self.inner.read() {
            Ok(inner) => {
                let mut shares: Vec<Arc<Share>> = inner.shares.values().cloned().collect();
                shares.sort_by(|a, b| a.name.cmp(&b.name));
                shares
            }
            Err(_) => Vec::new(),
        }
    }

    /// Resolves a path to the share with the longest matching prefix
    /// and the remainder relative to the share root.
    pub fn resolve(&self, path: &str) -> Result<(Arc<Share>, String)> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        let mut best: Option<&Arc<Share>> = None;
        for share in inner.shares.values() {
            let matches = path == share.name
                || (path.starts_with(&share.name)
                    && path.as_bytes().get(share.name.len()) == Some(&b'/'));
            if matches && best.map_or(true, |held| share.name.len() > held.name.len()) {
                best = Some(share);
            }
        }
        let share = best.cloned().ok_or(Error::NotFound)?;
        let remainder = path[share.name.len()..].trim_start_matches('/').to_owned();
        Ok((share, remainder))
    }
}
