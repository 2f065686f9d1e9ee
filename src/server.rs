//! Server assembly: wires stores, cache flushers, the lock manager,
//! sessions, the coordinator and the adapter supervisor together, and
//! owns the background task lifecycle.
//!
//! Startup order: load persisted locks (fatal on failure), open the
//! grace window, then let adapters bind. Shutdown order: stop
//! accepting, drain adapters, flush dirty cache bytes best-effort,
//! stop background tasks. Persistent locks are already durable; they
//! were written through at acquisition.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapter::Supervisor;
use crate::cache::flusher::Flusher;
use crate::config::Config;
use crate::coordinator::FsCoordinator;
use crate::error::Result;
use crate::identity::IdentityStore;
use crate::locks::store::LockStore;
use crate::locks::LockManager;
use crate::session::{SessionManager, SessionReaper};
use crate::share::{Share, ShareRegistry, ShareSpec};

/// A running DittoFS core.
pub struct Server {
    config: Config,
    pub registry: Arc<ShareRegistry>,
    pub identity: Arc<dyn IdentityStore>,
    pub locks: Arc<LockManager>,
    pub sessions: Arc<SessionManager>,
    pub coordinator: Arc<FsCoordinator>,
    pub supervisor: Arc<Supervisor>,
    shutdown: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Builds the core and starts its background tasks. A lock store
    /// failure while seeding the grace window is fatal.
    pub async fn start(
        config: Config,
        identity: Arc<dyn IdentityStore>,
        lock_store: Arc<dyn LockStore>,
    ) -> Result<Arc<Self>> {
        let locks = LockManager::start(config.locks.clone(), lock_store).await?;
        let sessions = SessionManager::new(config.sessions.clone());
        let registry = Arc::new(ShareRegistry::new(identity.clone()));
        let coordinator = FsCoordinator::new(
            registry.clone(),
            identity.clone(),
            locks.clone(),
            sessions.clone(),
            config.retry.clone(),
        );
        let supervisor = Arc::new(Supervisor::new(config.shutdown.drain_timeout()));
        let (shutdown, _) = watch::channel(false);

        let server = Arc::new(Self {
            config,
            registry,
            identity,
            locks,
            sessions,
            coordinator,
            supervisor,
            shutdown,
            tasks: StdMutex::new(Vec::new()),
        });

        let grace_timer = server.locks.spawn_grace_timer(server.shutdown.subscribe());
        let reaper = SessionReaper::spawn(
            server.sessions.clone(),
            server.locks.clone(),
            server.shutdown.subscribe(),
        );
        server.track(grace_timer);
        server.track(reaper);
        info!("core started");
        Ok(server)
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }

    /// Creates and binds a share, and starts its cache flusher.
    pub async fn create_share(&self, spec: ShareSpec) -> Result<Arc<Share>> {
        let share = self.registry.create_share(spec).await?;
        let flusher = Flusher::spawn(
            share.cache.clone(),
            self.config.cache.flusher_interval(),
            self.config.cache.idle_timeout(),
            self.shutdown.subscribe(),
        );
        self.track(flusher);
        Ok(share)
    }

    /// Deletes a share after flushing what it buffered.
    pub async fn delete_share(&self, name: &str) -> Result<()> {
        if let Ok(share) = self.registry.get(name) {
            if let Err(error) = share.cache.flush_all().await {
                warn!(share = name, %error, "flush on share delete failed");
            }
        }
        self.registry.delete_share(name).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Graceful shutdown: drain adapters, flush dirty bytes
    /// best-effort, stop background tasks.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.supervisor.disable_all().await;
        for share in self.registry.list() {
            if let Err(error) = share.cache.flush_all().await {
                warn!(share = %share.name, %error, "best-effort flush failed at shutdown");
            }
        }
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        let drain = self.config.shutdown.drain_timeout();
        for task in tasks {
            let aborter = task.abort_handle();
            if tokio::time::timeout(drain, task).await.is_err() {
                aborter.abort();
                warn!("background task missed the shutdown deadline");
            }
        }
        info!("core stopped");
    }
}
