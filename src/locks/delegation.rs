//! Delegation and lease records: NFSv4 delegations and SMB leases
//! unified under one scope model and one recall path.

use std::time::Instant;

use crate::metadata::FileId;

use super::range::{LockKind, LockRecord};

/// SMB lease state bits (R, W, H).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LeaseState(pub u8);

impl LeaseState {
    pub const READ: u8 = 0x1;
    pub const WRITE: u8 = 0x2;
    pub const HANDLE: u8 = 0x4;

    pub fn read() -> Self {
        Self(Self::READ)
    }

    pub fn read_write() -> Self {
        Self(Self::READ | Self::WRITE)
    }

    pub fn read_write_handle() -> Self {
        Self(Self::READ | Self::WRITE | Self::HANDLE)
    }

    pub fn has_read(self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn has_write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    pub fn has_handle(self) -> bool {
        self.0 & Self::HANDLE != 0
    }
}

/// What a delegation or lease allows its holder to assume.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// NFSv4 read delegation.
    Read,
    /// NFSv4 write delegation.
    Write,
    /// SMB lease with RWH flags.
    Lease(LeaseState),
}

impl Scope {
    /// Whether the holder may cache writes under this scope.
    pub fn is_writing(self) -> bool {
        match self {
            Scope::Read => false,
            Scope::Write => true,
            Scope::Lease(state) => state.has_write(),
        }
    }

    /// The scope left after a break for a conflicting reader: writers
    /// downgrade to read, readers have nothing left to retain.
    pub fn downgraded_for_reader(self) -> Option<Scope> {
        match self {
            Scope::Read => None,
            Scope::Write => Some(Scope::Read),
            Scope::Lease(state) if state.has_write() => {
                Some(Scope::Lease(LeaseState(state.0 & !LeaseState::WRITE)))
            }
            Scope::Lease(_) => None,
        }
    }
}

/// Which protocol holds the delegation; recall dispatch matches on
/// this to pick the backchannel or the SMB session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LeaseOrigin {
    Nfsv4,
    Smb,
}

/// Identifier of a granted delegation or lease.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DelegationId(pub u64);

/// Lifecycle: `Granted -> (Returned | Recalling -> (Returned |
/// Revoked))`. Returned and Revoked records leave the table; Revoked
/// ids are remembered so late returns surface the revocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DelegationState {
    Granted,
    Recalling,
}

/// A live delegation or lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationRecord {
    pub id: DelegationId,
    pub file: FileId,
    /// Client identifier of the holder.
    pub holder: String,
    pub scope: Scope,
    pub origin: LeaseOrigin,
    pub state: DelegationState,
    pub granted_at: Instant,
}

/// Protocol-neutral recall emitted toward the adapter that owns the
/// holder's channel. `retain` carries the downgrade target, `None`
/// demands a full return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecallEvent {
    pub delegation: DelegationId,
    pub file: FileId,
    pub holder: String,
    pub origin: LeaseOrigin,
    pub retain: Option<Scope>,
}

/// Two delegations conflict iff the holders differ and either side
/// writes; any number of read-only holders may coexist.
pub fn delegations_conflict(a: &DelegationRecord, b: &DelegationRecord) -> bool {
    a.holder != b.holder && (a.scope.is_writing() || b.scope.is_writing())
}

/// A lock conflicts with a lease held by someone else iff the lock is
/// exclusive or the lease writes; the lease's scope is file-wide so
/// the lock's range always falls under it.
pub fn lock_conflicts_with_lease(lock: &LockRecord, lease: &DelegationRecord) -> bool {
    lock.owner.client != lease.holder
        && (lock.kind == LockKind::Exclusive || lease.scope.is_writing())
}
