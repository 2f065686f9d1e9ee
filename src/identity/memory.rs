//! In-memory [`IdentityStore`] with the same mutex discipline as the
//! other memory backends.
//!
//! Creates the undeletable `admins` and `users` system groups up front.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use super::{
    AuthIdentity, Group, GroupId, IdentityStore, Permission, Principal, User, UserId,
};
use crate::error::{Error, Result};

struct Inner {
    next_user: u64,
    next_group: u64,
    users: HashMap<UserId, User>,
    groups: HashMap<GroupId, Group>,
    by_username: HashMap<String, UserId>,
    by_groupname: HashMap<String, GroupId>,
    kerberos: HashMap<String, String>,
}

pub struct MemoryIdentityStore {
    inner: RwLock<Inner>,
}

impl Default for MemoryIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        let mut inner = Inner {
            next_user: 1,
            next_group: 1,
            users: HashMap::new(),
            groups: HashMap::new(),
            by_username: HashMap::new(),
            by_groupname: HashMap::new(),
            kerberos: HashMap::new(),
        };
        for (name, gid) in [("admins", 0), ("users", 100)] {
            let id = GroupId(inner.next_group);
            inner.next_group += 1;
            inner.groups.insert(
                id,
                Group {
                    id,
                    name: name.to_owned(),
                    gid: Some(gid),
                    description: String::new(),
                    members: BTreeSet::new(),
                    system: true,
                    share_access: HashMap::new(),
                },
            );
            inner.by_groupname.insert(name.to_owned(), id);
        }
        Self { inner: RwLock::new(inner) }
    }
}

impl Inner {
    fn user_mut(&mut self, id: UserId) -> Result<&mut User> {
        self.users.get_mut(&id).ok_or(Error::NotFound)
    }

    fn group_mut(&mut self, id: GroupId) -> Result<&mut Group> {
        self.groups.get_mut(&id).ok_or(Error::NotFound)
    }

    fn identity_of(&self, user: &User) -> AuthIdentity {
        let mut gids = vec![user.gid];
        for group in user.groups.iter().filter_map(|id| self.groups.get(id)) {
            if let Some(gid) = group.gid {
                if !gids.contains(&gid) {
                    gids.push(gid);
                }
            }
        }
        AuthIdentity {
            user: Some(user.id),
            username: Some(user.username.clone()),
            uid: user.uid,
            gid: user.gid,
            gids,
            guest: false,
        }
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn create_user(
        &self,
        username: &str,
        password_hash: Option<String>,
        uid: u32,
        gid: u32,
        display_name: &str,
    ) -> Result<User> {
        if username.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        if inner.by_username.contains_key(username) {
            return Err(Error::AlreadyExists);
        }
        let id = UserId(inner.next_user);
        inner.next_user += 1;
        let user = User {
            id,
            username: username.to_owned(),
            password_hash,
            uid,
            gid,
            display_name: display_name.to_owned(),
            enabled: true,
            groups: BTreeSet::new(),
            share_access: HashMap::new(),
        };
        inner.by_username.insert(username.to_owned(), id);
        inner.users.insert(id, user.clone());
        debug!(username, uid, "created user");
        Ok(user)
    }

    async fn user(&self, id: UserId) -> Result<User> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        inner.users.get(&id).cloned().ok_or(Error::NotFound)
    }

    async fn user_by_name(&self, username: &str) -> Result<User> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        let id = inner.by_username.get(username).ok_or(Error::NotFound)?;
        inner.users.get(id).cloned().ok_or(Error::NotFound)
    }

    async fn set_user_enabled(&self, id: UserId, enabled: bool) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        inner.user_mut(id)?.enabled = enabled;
        Ok(())
    }

    async fn delete_user(&self, id: UserId) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        let user = inner.users.remove(&id).ok_or(Error::NotFound)?;
        inner.by_username.remove(&user.username);
        // Membership is symmetric, so strip the user from every group
        // in the same critical section.
        for group_id in &user.groups {
            if let Some(group) = inner.groups.get_mut(group_id) {
                group.members.remove(&id);
            }
        }
        Ok(())
    }

    async fn create_group(
        &self,
        name: &str,
        gid: Option<u32>,
        description: &str,
    ) -> Result<Group> {
        if name.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        if inner.by_groupname.contains_key(name) {
            return Err(Error::AlreadyExists);
        }
        let id = GroupId(inner.next_group);
        inner.next_group += 1;
        let group = Group {
            id,
            name: name.to_owned(),
            gid,
            description: description.to_owned(),
            members: BTreeSet::new(),
            system: false,
            share_access: HashMap::new(),
        };
        inner.by_groupname.insert(name.to_owned(), id);
        inner.groups.insert(id, group.clone());
        Ok(group)
    }

    async fn group(&self, id: GroupId) -> Result<Group> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        inner.groups.get(&id).cloned().ok_or(Error::NotFound)
    }

    async fn group_by_name(&self, name: &str) -> Result<Group> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        let id = inner.by_groupname.get(name).ok_or(Error::NotFound)?;
        inner.groups.get(id).cloned().ok_or(Error::NotFound)
    }

    async fn delete_group(&self, id: GroupId) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        let group = inner.groups.get(&id).ok_or(Error::NotFound)?;
        if group.system {
            return Err(Error::PermissionDenied);
        }
        let members: Vec<UserId> = group.members.iter().copied().collect();
        if let Some(removed) = inner.groups.remove(&id) {
            inner.by_groupname.remove(&removed.name);
        }
        for user_id in members {
            if let Some(user) = inner.users.get_mut(&user_id) {
                user.groups.remove(&id);
            }
        }
        Ok(())
    }

    async fn add_member(&self, group: GroupId, user: UserId) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        if !inner.users.contains_key(&user) {
            return Err(Error::NotFound);
        }
        inner.group_mut(group)?.members.insert(user);
        inner.user_mut(user)?.groups.insert(group);
        Ok(())
    }

    async fn remove_member(&self, group: GroupId, user: UserId) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        inner.group_mut(group)?.members.remove(&user);
        inner.user_mut(user)?.groups.remove(&group);
        Ok(())
    }

    async fn grant_user_access(
        &self,
        user: UserId,
        share: &str,
        level: Permission,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        inner.user_mut(user)?.share_access.insert(share.to_owned(), level);
        Ok(())
    }

    async fn revoke_user_access(&self, user: UserId, share: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        inner.user_mut(user)?.share_access.remove(share);
        Ok(())
    }

    async fn grant_group_access(
        &self,
        group: GroupId,
        share: &str,
        level: Permission,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        inner.group_mut(group)?.share_access.insert(share.to_owned(), level);
        Ok(())
    }

    async fn revoke_group_access(&self, group: GroupId, share: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        inner.group_mut(group)?.share_access.remove(share);
        Ok(())
    }

    async fn drop_share(&self, share: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        for user in inner.users.values_mut() {
            user.share_access.remove(share);
        }
        for group in inner.groups.values_mut() {
            group.share_access.remove(share);
        }
        Ok(())
    }

    async fn map_kerberos(&self, principal: &str, username: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Error::Io)?;
        if !inner.by_username.contains_key(username) {
            return Err(Error::NotFound);
        }
        inner.kerberos.insert(principal.to_owned(), username.to_owned());
        Ok(())
    }

    async fn resolve(&self, principal: &Principal) -> Result<AuthIdentity> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        let username = match principal {
            Principal::Guest => return Ok(AuthIdentity::guest()),
            Principal::User(name) => name.as_str(),
            Principal::Kerberos(krb) => {
                inner.kerberos.get(krb).ok_or(Error::PermissionDenied)?.as_str()
            }
        };
        let id = inner.by_username.get(username).ok_or(Error::PermissionDenied)?;
        let user = inner.users.get(id).ok_or(Error::PermissionDenied)?;
        if !user.enabled {
            return Err(Error::PermissionDenied);
        }
        Ok(inner.identity_of(user))
    }

    async fn permission_for(&self, user: UserId, share: &str) -> Result<Option<Permission>> {
        let inner = self.inner.read().map_err(|_| Error::Io)?;
        let record = inner.users.get(&user).ok_or(Error::NotFound)?;
        if let Some(level) = record.share_access.get(share) {
            return Ok(Some(*level));
        }
        let group_max = record
            .groups
            .iter()
            .filter_map(|id| inner.groups.get(id))
            .filter_map(|group| group.share_access.get(share))
            .max();
        Ok(group_max.copied())
    }
}
