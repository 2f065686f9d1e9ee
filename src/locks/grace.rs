//! Reclaim grace window: `Active -> (EarlyExit | Expired) -> Open`.
//!
//! While active, only reclaim acquisitions succeed. The window exits
//! early once every persisted lock has been reclaimed; otherwise the
//! timer expires it and unreclaimed persisted locks are deleted.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

use crate::metadata::FileId;

use super::range::LockOwner;

/// Key a reclaim must present to tick off a persisted lock.
pub type ReclaimKey = (FileId, LockOwner);

/// How the window reached `Open`; `None` while still active.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GraceEnd {
    EarlyExit,
    Expired,
}

struct GraceInner {
    deadline: Instant,
    pending: HashSet<ReclaimKey>,
    ended: Option<GraceEnd>,
}

pub struct Grace {
    inner: Mutex<GraceInner>,
}

impl Grace {
    /// Opens the window. With nothing to reclaim it exits immediately.
    pub fn new(window: Duration, pending: HashSet<ReclaimKey>) -> Self {
        let ended = if pending.is_empty() { Some(GraceEnd::EarlyExit) } else { None };
        if ended.is_some() {
            info!("no persisted locks; grace window skipped");
        } else {
            info!(locks = pending.len(), ?window, "grace window open");
        }
        Self {
            inner: Mutex::new(GraceInner { deadline: Instant::now() + window, pending, ended }),
        }
    }

    pub fn is_active(&self) -> bool {
        let inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return false,
        };
        inner.ended.is_none() && Instant::now() < inner.deadline
    }

    pub fn deadline(&self) -> Instant {
        self.inner.lock().map(|inner| inner.deadline).unwrap_or_else(|_| Instant::now())
    }

    /// Whether a persisted lock with this key awaits reclaim.
    pub fn is_pending(&self, key: &ReclaimKey) -> bool {
        self.inner.lock().map(|inner| inner.pending.contains(key)).unwrap_or(false)
    }

    /// Ticks off a reclaimed lock; exits early when the set drains.
    /// Returns true when this reclaim closed the window.
    pub fn note_reclaimed(&self, key: &ReclaimKey) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return false,
        };
        inner.pending.remove(key);
        if inner.pending.is_empty() && inner.ended.is_none() {
            inner.ended = Some(GraceEnd::EarlyExit);
            info!("all persisted locks reclaimed; grace window exits early");
            return true;
        }
        false
    }

    /// Expires the window, returning the keys never reclaimed so the
    /// caller can purge them from the lock store.
    pub fn expire(&self) -> Vec<ReclaimKey> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return Vec::new(),
        };
        if inner.ended.is_some() {
            return Vec::new();
        }
        inner.ended = Some(GraceEnd::Expired);
        let stale: Vec<ReclaimKey> = inner.pending.drain().collect();
        info!(unreclaimed = stale.len(), "grace window expired");
        stale
    }

    pub fn ended(&self) -> Option<GraceEnd> {
        self.inner.lock().map(|inner| inner.ended).unwrap_or(None)
    }
}
