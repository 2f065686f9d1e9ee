//! Defines users, groups, per-share permissions and the
//! [`IdentityStore`] contract both adapters authenticate against.
//!
//! The store resolves an authenticated principal into a protocol-neutral
//! identity; the coordinator combines [`IdentityStore::permission_for`]
//! with the share's defaults to authorize every verb.

pub mod memory;

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;

use crate::error::Result;

/// Unique user identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub u64);

/// Unique group identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u64);

/// Per-share permission level, ordered so the group maximum is a plain
/// `max`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Permission {
    #[default]
    None,
    Read,
    ReadWrite,
}

impl Permission {
    pub fn allows_read(self) -> bool {
        self >= Permission::Read
    }

    pub fn allows_write(self) -> bool {
        self >= Permission::ReadWrite
    }
}

/// A user record.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// Opaque to the core; verified by the adapters' auth mechanisms.
    pub password_hash: Option<String>,
    /// Numeric pair carried onto the wire where both protocols require
    /// numeric owners.
    pub uid: u32,
    pub gid: u32,
    pub display_name: String,
    pub enabled: bool,
    pub groups: BTreeSet<GroupId>,
    /// Share name to direct permission level.
    pub share_access: HashMap<String, Permission>,
}

/// A group record.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub gid: Option<u32>,
    pub description: String,
    pub members: BTreeSet<UserId>,
    /// System groups refuse deletion.
    pub system: bool,
    pub share_access: HashMap<String, Permission>,
}

/// The authenticated identity a protocol adapter hands to the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Principal {
    /// Authenticated by username (NTLM, AUTH_SYS mapping).
    User(String),
    /// Authenticated Kerberos principal, mapped through the store's
    /// static table.
    Kerberos(String),
    Guest,
}

/// Resolution of a [`Principal`]: the record plus the numeric ids the
/// wire formats need.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthIdentity {
    pub user: Option<UserId>,
    pub username: Option<String>,
    pub uid: u32,
    pub gid: u32,
    /// All numeric gids, primary first.
    pub gids: Vec<u32>,
    pub guest: bool,
}

impl AuthIdentity {
    pub fn guest() -> Self {
        Self { user: None, username: None, uid: 65534, gid: 65534, gids: vec![65534], guest: true }
    }
}

/// Backend-neutral identity contract.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn create_user(
        &self,
        username: &str,
        password_hash: Option<String>,
        uid: u32,
        gid: u32,
        display_name: &str,
    ) -> Result<User>;

    async fn user(&self, id: UserId) -> Result<User>;

    async fn user_by_name(&self, username: &str) -> Result<User>;

    async fn set_user_enabled(&self, id: UserId, enabled: bool) -> Result<()>;

    /// Deletes a user and removes it from every group atomically.
    async fn delete_user(&self, id: UserId) -> Result<()>;

    async fn create_group(&self, name: &str, gid: Option<u32>, description: &str)
        -> Result<Group>;

    async fn group(&self, id: GroupId) -> Result<Group>;

    async fn group_by_name(&self, name: &str) -> Result<Group>;

    /// Refuses system groups.
    async fn delete_group(&self, id: GroupId) -> Result<()>;

    /// Membership is symmetric: the group lists the user and the user
    /// lists the group after this returns.
    async fn add_member(&self, group: GroupId, user: UserId) -> Result<()>;

    async fn remove_member(&self, group: GroupId, user: UserId) -> Result<()>;

    async fn grant_user_access(&self, user: UserId, share: &str, level: Permission)
        -> Result<()>;

    async fn revoke_user_access(&self, user: UserId, share: &str) -> Result<()>;

    async fn grant_group_access(&self, group: GroupId, share: &str, level: Permission)
        -> Result<()>;

    async fn revoke_group_access(&self, group: GroupId, share: &str) -> Result<()>;

    /// Strips every permission that references `share`; called when a
    /// share is deleted.
    async fn drop_share(&self, share: &str) -> Result<()>;

    /// Registers a Kerberos principal to username mapping.
    async fn map_kerberos(&self, principal: &str, username: &str) -> Result<()>;

    /// Resolves a principal to an identity. Disabled users and unknown
    /// principals resolve to `PermissionDenied`.
    async fn resolve(&self, principal: &Principal) -> Result<AuthIdentity>;

    /// Direct-or-group permission for `user` on `share`: the user's own
    /// mapping when present, otherwise the maximum across the user's
    /// groups. `None` when neither says anything, so the share defaults
    /// apply.
    async fn permission_for(&self, user: UserId, share: &str) -> Result<Option<Permission>>;
}

/// Effective permission for an identity on a share, per the
/// authorization ladder: direct mapping, then group maximum, then the
/// share's authenticated default, then the guest level.
pub async fn effective_permission(
    store: &dyn IdentityStore,
    identity: &AuthIdentity,
    share: &str,
    authenticated_default: Permission,
    guest_allowed: bool,
) -> Result<Permission> {
    if identity.guest {
        return Ok(if guest_allowed { Permission::Read } else { Permission::None });
    }
    if let Some(user) = identity.user {
        if let Some(level) = store.permission_for(user, share).await? {
            return Ok(level);
        }
    }
    Ok(authenticated_default)
}
