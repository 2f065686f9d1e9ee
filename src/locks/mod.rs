//! Defines the unified lock & lease manager shared by both protocol
//! adapters.
//!
//! Byte-range locks (NLM and SMB origins), NFSv4 delegations and SMB
//! leases live in one per-file table with one conflict policy. A
//! byte-range lock that collides with a foreign lease breaks the lease
//! and, on an unanswered break, revokes it --- the "NFS wins" rule.
//! Recalls are emitted as protocol-neutral [`RecallEvent`]s on an
//! async channel the adapters consume; returning the delegation is the
//! acknowledgement.

pub mod delegation;
pub mod grace;
pub mod range;
pub mod store;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LockConfig;
use crate::error::{Error, Result};
use crate::metadata::FileId;

use delegation::{
    lock_conflicts_with_lease, DelegationId, DelegationRecord, DelegationState, LeaseOrigin,
    RecallEvent, Scope,
};
use grace::{Grace, ReclaimKey};
use range::{locks_conflict, ByteRange, LockId, LockKind, LockOrigin, LockOwner, LockRecord};
use store::{LockStore, PersistedLock};

/// Wait for a blocking lock with no caller deadline.
const DEFAULT_BLOCK_WAIT: Duration = Duration::from_secs(30);

/// A lock acquisition request.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub file: FileId,
    pub range: ByteRange,
    pub kind: LockKind,
    pub owner: LockOwner,
    pub origin: LockOrigin,
    /// Reassertion of a pre-restart lock during the grace window.
    pub reclaim: bool,
    /// Queue behind conflicting locks instead of failing immediately.
    pub blocking: bool,
    /// Survive restart; subject to reclaim.
    pub persistent: bool,
}

struct FileLockState {
    locks: Vec<LockRecord>,
    delegations: Vec<DelegationRecord>,
    /// FIFO tickets of blocked lock waiters; the head retries first.
    queue: VecDeque<u64>,
    /// Open handles: (holder client, writes) pairs, for lease grant
    /// decisions.
    opens: Vec<(String, bool)>,
}

struct FileLockEntry {
    state: Mutex<FileLockState>,
    /// Woken on any release, return or revocation.
    changed: Notify,
}

impl FileLockEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(FileLockState {
                locks: Vec::new(),
                delegations: Vec::new(),
                queue: VecDeque::new(),
                opens: Vec::new(),
            }),
            changed: Notify::new(),
        }
    }
}

/// The manager. One instance per server.
pub struct LockManager {
    files: DashMap<FileId, Arc<FileLockEntry>>,
    lock_index: DashMap<LockId, FileId>,
    delegation_index: DashMap<DelegationId, FileId>,
    /// Revoked ids remembered so a late return surfaces the fact.
    revoked: StdMutex<HashSet<DelegationId>>,
    next_lock: AtomicU64,
    next_delegation: AtomicU64,
    next_ticket: AtomicU64,
    config: LockConfig,
    grace: Grace,
    store: Arc<dyn LockStore>,
    recall_tx: async_channel::Sender<RecallEvent>,
    recall_rx: async_channel::Receiver<RecallEvent>,
}

impl LockManager {
    /// Loads persisted locks and opens the grace window. A lock store
    /// failure here is fatal for server startup.
    pub async fn start(config: LockConfig, store: Arc<dyn LockStore>) -> Result<Arc<Self>> {
        let persisted = store.load_all().await?;
        let pending: HashSet<ReclaimKey> =
            persisted.iter().map(|lock| (lock.file, lock.owner.clone())).collect();
        let grace = Grace::new(config.grace_period(), pending);
        let (recall_tx, recall_rx) = async_channel::unbounded();
        Ok(Arc::new(Self {
            files: DashMap::new(),
            lock_index: DashMap::new(),
            delegation_index: DashMap::new(),
            revoked: StdMutex::new(HashSet::new()),
            next_lock: AtomicU64::new(1),
            next_delegation: AtomicU64::new(1),
            next_ticket: AtomicU64::new(1),
            config,
            grace,
            store,
            recall_tx,
            recall_rx,
        }))
    }

    /// Recall events feed; the receiver is cloneable, each event is
    /// consumed once.
    pub fn subscribe_recalls(&self) -> async_channel::Receiver<RecallEvent> {
        self.recall_rx.clone()
    }

    pub fn grace_active(&self) -> bool {
        self.grace.is_active()
    }

    /// Expires the grace window and purges never-reclaimed persisted
    /// locks. Normally driven by [`LockManager::spawn_grace_timer`].
    pub async fn expire_grace(&self) {
        for (file, owner) in self.grace.expire() {
            if let Err(error) = self.store.remove(file, &owner).await {
                warn!(file = file.0, %error, "failed to purge unreclaimed lock");
            }
        }
    }

    /// Releases reclaim blocking when the window lapses.
    pub fn spawn_grace_timer(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::from_std(manager.grace.deadline());
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => manager.expire_grace().await,
                changed = shutdown.changed() => {
                    let _ = changed;
                }
            }
        })
    }

    fn entry(&self, file: FileId) -> Arc<FileLockEntry> {
        let guard = self.files.entry(file).or_insert_with(|| Arc::new(FileLockEntry::new()));
        Arc::clone(guard.value())
    }

    /// Acquires a byte-range lock under the shared conflict rules.
    /// Blocking requests queue FIFO until `deadline` (a default bound
    /// applies when the caller has none).
    pub async fn acquire_lock(
        &self,
        request: LockRequest,
        deadline: Option<Instant>,
    ) -> Result<LockId> {
        if self.grace.is_active() {
            if !request.reclaim {
                return Err(Error::GracePeriodActive);
            }
        } else if request.reclaim {
            // Reclaim outside grace is honored only when a persisted
            // lock backs it (per-client reboot notification path).
            let persisted = self.store.load_all().await?;
            let backed = persisted
                .iter()
                .any(|lock| lock.file == request.file && lock.owner == request.owner);
            if !backed {
                return Err(Error::InvalidArgument);
            }
        }

        let entry = self.entry(request.file);
        let record = LockRecord {
            id: LockId(self.next_lock.fetch_add(1, Ordering::Relaxed)),
            file: request.file,
            range: request.range,
            kind: request.kind,
            owner: request.owner.clone(),
            origin: request.origin,
            persistent: request.persistent,
        };
        let block_deadline = deadline.unwrap_or_else(|| Instant::now() + DEFAULT_BLOCK_WAIT);
        let mut ticket: Option<u64> = None;

        loop {
            self.break_conflicting_leases(&entry, &record).await;

            let notified = {
                let mut state = entry.state.lock().await;
                let lease_conflict = state
                    .delegations
                    .iter()
                    .any(|lease| lock_conflicts_with_lease(&record, lease));
                let lock_conflict =
                    state.locks.iter().any(|held| locks_conflict(held, &record));
                let at_head =
                    ticket.map_or(true, |mine| state.queue.front() == Some(&mine));

                if !lease_conflict && !lock_conflict && at_head {
                    if let Some(mine) = ticket {
                        if state.queue.front() == Some(&mine) {
                            state.queue.pop_front();
                        }
                    }
                    state.locks.push(record.clone());
                    drop(state);

                    if request.persistent {
                        let persisted = PersistedLock {
                            file: record.file,
                            range: record.range,
                            kind: record.kind,
                            owner: record.owner.clone(),
                            origin: record.origin,
                        };
                        if let Err(error) = self.store.save(&persisted).await {
                            let mut state = entry.state.lock().await;
                            state.locks.retain(|held| held.id != record.id);
                            drop(state);
                            entry.changed.notify_waiters();
                            return Err(error);
                        }
                    }
                    self.lock_index.insert(record.id, record.file);
                    if request.reclaim {
                        let key = (record.file, record.owner.clone());
                        self.grace.note_reclaimed(&key);
                    }
                    debug!(file = record.file.0, lock = record.id.0, "lock granted");
                    entry.changed.notify_waiters();
                    return Ok(record.id);
                }

                if lease_conflict {
                    // A fresh lease slipped in; go break it.
                    None
                } else if !request.blocking {
                    return Err(Error::LockConflict);
                } else {
                    if ticket.is_none() {
                        let mine = self.next_ticket.fetch_add(1, Ordering::Relaxed);
                        state.queue.push_back(mine);
                        ticket = Some(mine);
                    }
                    let mut waiter = Box::pin(entry.changed.notified());
                    waiter.as_mut().enable();
                    Some(waiter)
                }
            };

            if let Some(waiter) = notified {
                let at = tokio::time::Instant::from_std(block_deadline);
                if tokio::time::timeout_at(at, waiter).await.is_err() {
                    if let Some(mine) = ticket {
                        let mut state = entry.state.lock().await;
                        state.queue.retain(|queued| *queued != mine);
                    }
                    entry.changed.notify_waiters();
                    return Err(Error::Timeout);
                }
            }
        }
    }

    /// Issues lease breaks for every foreign lease that conflicts with
    /// `record`, waits out the break timeout, and revokes on silence.
    async fn break_conflicting_leases(&self, entry: &Arc<FileLockEntry>, record: &LockRecord) {
        let targets: Vec<DelegationId> = {
            let mut state = entry.state.lock().await;
            let mut ids = Vec::new();
            for lease in state.delegations.iter_mut() {
                if !lock_conflicts_with_lease(record, lease) {
                    continue;
                }
                if lease.state == DelegationState::Granted {
                    lease.state = DelegationState::Recalling;
                    let retain = if record.kind == LockKind::Exclusive {
                        None
                    } else {
                        lease.scope.downgraded_for_reader()
                    };
                    let event = RecallEvent {
                        delegation: lease.id,
                        file: lease.file,
                        holder: lease.holder.clone(),
                        origin: lease.origin,
                        retain,
                    };
                    info!(
                        file = lease.file.0,
                        holder = %lease.holder,
                        "lease break issued for byte-range lock"
                    );
                    let _ = self.recall_tx.try_send(event);
                }
                ids.push(lease.id);
            }
            ids
        };

        for id in targets {
            let acked = self
                .wait_delegation_cleared(entry, id, self.config.lock_break_timeout())
                .await;
            if !acked {
                // NFS wins: the silent holder loses the lease.
                self.revoke_delegation(entry, id).await;
            }
        }
    }

    async fn wait_delegation_cleared(
        &self,
        entry: &Arc<FileLockEntry>,
        id: DelegationId,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let waiter = {
                let state = entry.state.lock().await;
                if !state.delegations.iter().any(|lease| lease.id == id) {
                    return true;
                }
                let mut waiter = Box::pin(entry.changed.notified());
                waiter.as_mut().enable();
                waiter
            };
            if tokio::time::timeout_at(deadline, waiter).await.is_err() {
                return false;
            }
        }
    }

    async fn revoke_delegation(&self, entry: &Arc<FileLockEntry>, id: DelegationId) {
        {
            let mut state = entry.state.lock().await;
            if let Some(position) =
                state.delegations.iter().position(|lease| lease.id == id)
            {
                let record = state.delegations.swap_remove(position);
                warn!(
                    file = record.file.0,
                    holder = %record.holder,
                    "delegation revoked after unanswered recall"
                );
            } else {
                return;
            }
        }
        self.delegation_index.remove(&id);
        if let Ok(mut revoked) = self.revoked.lock() {
            revoked.insert(id);
        }
        entry.changed.notify_waiters();
    }

    pub async fn release_lock(&self, id: LockId) -> Result<()> {
        let (_, file) = self.lock_index.remove(&id).ok_or(Error::NotFound)?;
        let entry = self.entry(file);
        let removed = {
            let mut state = entry.state.lock().await;
            let position = state.locks.iter().position(|held| held.id == id);
            match position {
                Some(position) => state.locks.swap_remove(position),
                None => return Err(Error::NotFound),
            }
        };
        if removed.persistent {
            if let Err(error) = self.store.remove(file, &removed.owner).await {
                warn!(file = file.0, %error, "failed to unpersist released lock");
            }
        }
        entry.changed.notify_waiters();
        Ok(())
    }

    /// Requests a delegation (NFSv4) or lease (SMB). Refused, never
    /// recalled-for: conflicts with live state surface as
    /// `LockNotGranted`. A same-holder request upgrades in place,
    /// except that an upgrade to a writing scope is refused while a
    /// foreign byte-range lock exists.
    pub async fn request_delegation(
        &self,
        file: FileId,
        holder: &str,
        scope: Scope,
        origin: LeaseOrigin,
    ) -> Result<DelegationId> {
        let entry = self.entry(file);
        let mut state = entry.state.lock().await;

        let conflicting_delegation = state
            .delegations
            .iter()
            .any(|lease| lease.holder != holder && (lease.scope.is_writing() || scope.is_writing()));
        if conflicting_delegation {
            return Err(Error::LockNotGranted);
        }
        let foreign_any_lock = state.locks.iter().any(|held| held.owner.client != holder);
        let foreign_exclusive_lock = state
            .locks
            .iter()
            .any(|held| held.owner.client != holder && held.kind == LockKind::Exclusive);
        if scope.is_writing() && foreign_any_lock {
            return Err(Error::LockNotGranted);
        }
        if !scope.is_writing() && foreign_exclusive_lock {
            return Err(Error::LockNotGranted);
        }
        let foreign_open = state
            .opens
            .iter()
            .any(|(client, writes)| client != holder && (*writes || scope.is_writing()));
        if foreign_open {
            return Err(Error::LockNotGranted);
        }

        if let Some(position) = state.delegations.iter().position(|lease| lease.holder == holder)
        {
            if state.delegations[position].state == DelegationState::Recalling {
                return Err(Error::LockNotGranted);
            }
            state.delegations[position].scope = scope;
            return Ok(state.delegations[position].id);
        }

        let id = DelegationId(self.next_delegation.fetch_add(1, Ordering::Relaxed));
        state.delegations.push(DelegationRecord {
            id,
            file,
            holder: holder.to_owned(),
            scope,
            origin,
            state: DelegationState::Granted,
            granted_at: Instant::now(),
        });
        drop(state);
        self.delegation_index.insert(id, file);
        debug!(file = file.0, holder, "delegation granted");
        Ok(id)
    }

    /// Returns a delegation; doubles as the recall/break
    /// acknowledgement. Returning one that was already revoked
    /// surfaces `DelegationRevoked`.
    pub async fn return_delegation(&self, id: DelegationId) -> Result<()> {
        if let Ok(mut revoked) = self.revoked.lock() {
            if revoked.remove(&id) {
                return Err(Error::DelegationRevoked);
            }
        }
        let (_, file) = self.delegation_index.remove(&id).ok_or(Error::NotFound)?;
        let entry = self.entry(file);
        {
            let mut state = entry.state.lock().await;
            state.delegations.retain(|lease| lease.id != id);
        }
        entry.changed.notify_waiters();
        Ok(())
    }

    /// Reports an open from any protocol: recalls conflicting foreign
    /// delegations, waits for acknowledgement, revokes on timeout, and
    /// records the open for later grant decisions. Returns the recalls
    /// issued.
    pub async fn notify_open(
        &self,
        file: FileId,
        holder: &str,
        writes: bool,
    ) -> Result<Vec<RecallEvent>> {
        let entry = self.entry(file);
        let mut issued = Vec::new();
        loop {
            let recalls: Vec<(DelegationId, Option<RecallEvent>)> = {
                let mut state = entry.state.lock().await;
                let mut out = Vec::new();
                for lease in state.delegations.iter_mut() {
                    let conflict =
                        lease.holder != holder && (writes || lease.scope.is_writing());
                    if !conflict {
                        continue;
                    }
                    if lease.state == DelegationState::Granted {
                        lease.state = DelegationState::Recalling;
                        let retain =
                            if writes { None } else { lease.scope.downgraded_for_reader() };
                        let event = RecallEvent {
                            delegation: lease.id,
                            file,
                            holder: lease.holder.clone(),
                            origin: lease.origin,
                            retain,
                        };
                        let _ = self.recall_tx.try_send(event.clone());
                        out.push((lease.id, Some(event)));
                    } else {
                        out.push((lease.id, None));
                    }
                }
                if out.is_empty() {
                    state.opens.push((holder.to_owned(), writes));
                }
                out
            };
            if recalls.is_empty() {
                return Ok(issued);
            }
            for (id, event) in recalls {
                if let Some(event) = event {
                    issued.push(event);
                }
                let acked = self
                    .wait_delegation_cleared(&entry, id, self.config.recall_timeout())
                    .await;
                if !acked {
                    self.revoke_delegation(&entry, id).await;
                }
            }
        }
    }

    /// Reports a close; drops one recorded open for the holder.
    pub async fn notify_close(&self, file: FileId, holder: &str) {
        let entry = self.entry(file);
        let mut state = entry.state.lock().await;
        if let Some(position) =
            state.opens.iter().position(|(client, _)| client == holder)
        {
            state.opens.swap_remove(position);
        }
        drop(state);
        entry.changed.notify_waiters();
    }

    /// NSM reboot notification: the client's volatile locks and
    /// delegations are dropped; its persisted locks stay in the store
    /// for reclaim.
    pub async fn client_rebooted(&self, client: &str) {
        info!(client, "client reboot notification; dropping volatile state");
        let entries: Vec<Arc<FileLockEntry>> =
            self.files.iter().map(|entry| entry.value().clone()).collect();
        for entry in entries {
            let (lock_ids, delegation_ids) = {
                let mut state = entry.state.lock().await;
                let lock_ids: Vec<LockId> = state
                    .locks
                    .iter()
                    .filter(|held| held.owner.client == client)
                    .map(|held| held.id)
                    .collect();
                state.locks.retain(|held| held.owner.client != client);
                let delegation_ids: Vec<DelegationId> = state
                    .delegations
                    .iter()
                    .filter(|lease| lease.holder == client)
                    .map(|lease| lease.id)
                    .collect();
                state.delegations.retain(|lease| lease.holder != client);
                state.opens.retain(|(holder, _)| holder != client);
                (lock_ids, delegation_ids)
            };
            for id in lock_ids {
                self.lock_index.remove(&id);
            }
            for id in delegation_ids {
                self.delegation_index.remove(&id);
            }
            entry.changed.notify_waiters();
        }
    }

    /// Locks currently held on `file`, for observability and tests.
    pub async fn locks_on(&self, file: FileId) -> Vec<LockRecord> {
        let entry = self.entry(file);
        let state = entry.state.lock().await;
        state.locks.clone()
    }

    /// Delegations currently live on `file`.
    pub async fn delegations_on(&self, file: FileId) -> Vec<DelegationRecord> {
        let entry = self.entry(file);
        let state = entry.state.lock().await;
        state.delegations.clone()
    }
}
