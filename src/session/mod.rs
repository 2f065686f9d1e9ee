//! NFS client records and v4.1 sessions: slot-table replay cache,
//! fore-channel-bound backchannel, stateid packing and the liveness
//! reaper.

use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::locks::delegation::DelegationId;
use crate::locks::LockManager;
use crate::metadata::FileId;

/// NFS client identifier. Derived from the client's co_ownerid, so a
/// client presenting reboot-stable input gets the same id across
/// server restarts.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

/// v4.1 session identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(pub [u8; 16]);

/// Outcome of a SEQUENCE check against the slot table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// Fresh request: execute it and cache the reply.
    New,
    /// Exact replay of the last request on this slot; return the
    /// cached reply without re-executing.
    Replay(Option<Vec<u8>>),
}

struct Slot {
    last_seq: u32,
    cached_reply: Option<Vec<u8>>,
}

struct Session {
    client: ClientId,
    slots: Vec<Slot>,
    /// v4.1: callbacks ride the fore-channel connection; no dial-out.
    backchannel_bound: bool,
    last_activity: Instant,
    delegations: Vec<DelegationId>,
    opens: HashSet<FileId>,
}

#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: ClientId,
    pub owner: String,
    pub created_at: Instant,
}

/// Owns client and session records for the NFSv4 family.
pub struct SessionManager {
    clients: DashMap<String, ClientRecord>,
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    next_session: AtomicU64,
    next_stateid: AtomicU64,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
            next_stateid: AtomicU64::new(1),
            config,
        })
    }

    /// EXCHANGE_ID: registers (or re-finds) a client by its owner
    /// string. The id is a stable hash of the owner, so reboot-stable
    /// input yields the same id across restarts.
    pub fn exchange_id(&self, owner: &str) -> ClientId {
        let record = self
            .clients
            .entry(owner.to_owned())
            .or_insert_with(|| {
                let id = ClientId(fnv1a(owner.as_bytes()));
                debug!(owner, client = id.0, "registered nfs client");
                ClientRecord { id, owner: owner.to_owned(), created_at: Instant::now() }
            })
            .clone();
        record.id
    }

    /// CREATE_SESSION: allocates a session with the configured slot
    /// table width.
    pub fn create_session(&self, client: ClientId) -> SessionId {
        let serial = self.next_session.fetch_add(1, Ordering::Relaxed);
        let mut raw = [0u8; 16];
        {
            let mut cursor = Cursor::new(&mut raw[..]);
            // Infallible: the buffer is exactly 16 bytes.
            let _ = cursor.write_u64::<LittleEndian>(client.0);
            let _ = cursor.write_u64::<LittleEndian>(serial);
        }
        let id = SessionId(raw);
        let slots = (0..self.config.slot_count)
            .map(|_| Slot { last_seq: 0, cached_reply: None })
            .collect();
        self.sessions.insert(
            id,
            Arc::new(Mutex::new(Session {
                client,
                slots,
                backchannel_bound: false,
                last_activity: Instant::now(),
                delegations: Vec::new(),
                opens: HashSet::new(),
            })),
        );
        info!(client = client.0, serial, "created v4.1 session");
        id
    }

    fn session(&self, id: SessionId) -> Result<Arc<Mutex<Session>>> {
        self.sessions.get(&id).map(|session| session.value().clone()).ok_or(Error::NotFound)
    }

    /// SEQUENCE: enforces exactly-once per (slot, seq). Accepts the
    /// successor, replays the last, rejects everything else.
    pub async fn sequence(
        &self,
        id: SessionId,
        slot: u32,
        seq: u32,
    ) -> Result<SequenceOutcome> {
        let session = self.session(id)?;
        let mut session = session.lock().await;
        session.last_activity = Instant::now();
        let slot = session
            .slots
            .get_mut(slot as usize)
            .ok_or(Error::InvalidArgument)?;
        if seq == slot.last_seq.wrapping_add(1) {
            slot.last_seq = seq;
            // Advancing the slot evicts the previous cached reply.
            slot.cached_reply = None;
            Ok(SequenceOutcome::New)
        } else if seq == slot.last_seq && seq != 0 {
            Ok(SequenceOutcome::Replay(slot.cached_reply.clone()))
        } else {
            Err(Error::ReplayMisordered)
        }
    }

    /// Caches the reply for the request most recently admitted on
    /// `slot`.
    pub async fn complete(
        &self,
        id: SessionId,
        slot: u32,
        seq: u32,
        reply: Vec<u8>,
    ) -> Result<()> {
        let session = self.session(id)?;
        let mut session = session.lock().await;
        let slot = session
            .slots
            .get_mut(slot as usize)
            .ok_or(Error::InvalidArgument)?;
        if slot.last_seq == seq {
            slot.cached_reply = Some(reply);
        }
        Ok(())
    }

    /// Binds the backchannel to the fore-channel connection.
    pub async fn bind_backchannel(&self, id: SessionId) -> Result<()> {
        let session = self.session(id)?;
        session.lock().await.backchannel_bound = true;
        Ok(())
    }

    pub async fn backchannel_bound(&self, id: SessionId) -> Result<bool> {
        let session = self.session(id)?;
        let bound = session.lock().await.backchannel_bound;
        Ok(bound)
    }

    pub async fn record_open(&self, id: SessionId, file: FileId) -> Result<()> {
        let session = self.session(id)?;
        session.lock().await.opens.insert(file);
        Ok(())
    }

    pub async fn record_delegation(&self, id: SessionId, delegation: DelegationId) -> Result<()> {
        let session = self.session(id)?;
        session.lock().await.delegations.push(delegation);
        Ok(())
    }

    /// DESTROY_SESSION.
    pub fn destroy_session(&self, id: SessionId) -> Result<()> {
        self.sessions.remove(&id).map(|_| ()).ok_or(Error::NotFound)
    }

    /// Allocates a stateid bound to `client`.
    pub fn new_stateid(&self, client: ClientId) -> StateId {
        let counter = self.next_stateid.fetch_add(1, Ordering::Relaxed) as u32;
        StateId::encode(client, counter)
    }

    /// Sessions idle past `lease`, removed and returned with the state
    /// the reaper must release.
    async fn expire_idle(&self, lease: Duration) -> Vec<(SessionId, Vec<DelegationId>)> {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut expired = Vec::new();
        for id in ids {
            let Ok(session) = self.session(id) else { continue };
            let stale = {
                let session = session.lock().await;
                session.last_activity.elapsed() > lease
            };
            if stale {
                if let Some((_, session)) = self.sessions.remove(&id) {
                    let session = session.lock().await;
                    info!(
                        client = session.client.0,
                        opens = session.opens.len(),
                        "session expired"
                    );
                    expired.push((id, session.delegations.clone()));
                }
            }
        }
        expired
    }
}

/// Stateid: a sequence counter plus 12 opaque bytes packing the client
/// id and a per-server open counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct StateId {
    pub seq: u32,
    pub other: [u8; 12],
}

impl StateId {
    pub fn encode(client: ClientId, counter: u32) -> Self {
        let mut other = [0u8; 12];
        {
            let mut cursor = Cursor::new(&mut other[..]);
            let _ = cursor.write_u64::<LittleEndian>(client.0);
            let _ = cursor.write_u32::<LittleEndian>(counter);
        }
        Self { seq: 1, other }
    }

    pub fn decode(&self) -> Result<(ClientId, u32)> {
        let mut cursor = Cursor::new(&self.other[..]);
        let client = cursor.read_u64::<LittleEndian>().map_err(|_| Error::InvalidArgument)?;
        let counter = cursor.read_u32::<LittleEndian>().map_err(|_| Error::InvalidArgument)?;
        Ok((ClientId(client), counter))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    hash
}

/// Expires idle sessions and returns their delegations to the lock
/// manager.
pub struct SessionReaper {
    sessions: Arc<SessionManager>,
    locks: Arc<LockManager>,
    shutdown: watch::Receiver<bool>,
}

impl SessionReaper {
    pub fn spawn(
        sessions: Arc<SessionManager>,
        locks: Arc<LockManager>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { Self { sessions, locks, shutdown }.run().await })
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.sessions.config.reaper_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let lease = self.sessions.config.lease_duration();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for (_, delegations) in self.sessions.expire_idle(lease).await {
                        for delegation in delegations {
                            let _ = self.locks.return_delegation(delegation).await;
                        }
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!("session reaper stopping");
                        return;
                    }
                }
            }
        }
    }
}
