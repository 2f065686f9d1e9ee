//! Defines the protocol-agnostic adapter lifecycle: a uniform
//! [`Adapter`] contract, the [`Supervisor`] that enables, disables and
//! hot-reloads adapters, and a generic TCP listener adapter the
//! protocol front-ends build on.
//!
//! Lifecycle operations on one adapter never touch another; the core's
//! metadata, cache and lock state is untouched by any of them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// The protocol families the supervisor knows.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    Nfs,
    Smb,
}

/// Uniform adapter contract.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// Binds and begins accepting. Fails without side effects.
    async fn start(&self, port: u16) -> Result<()>;

    /// Stops accepting, waits out in-flight connections up to the
    /// drain deadline, then closes what remains.
    async fn stop(&self, drain: Duration) -> Result<()>;

    /// The bound port while running.
    fn port(&self) -> Option<u16>;
}

struct AdapterSlot {
    adapter: Arc<dyn Adapter>,
    enabled: bool,
    port: u16,
}

/// Tracks enabled state and drives adapter lifecycle transitions.
pub struct Supervisor {
    slots: StdMutex<HashMap<AdapterKind, AdapterSlot>>,
    drain_timeout: Duration,
}

impl Supervisor {
    pub fn new(drain_timeout: Duration) -> Self {
        Self { slots: StdMutex::new(HashMap::new()), drain_timeout }
    }

    /// Registers an adapter implementation; it starts disabled.
    pub fn register(&self, adapter: Arc<dyn Adapter>) -> Result<()> {
        let mut slots = self.slots.lock().map_err(|_| Error::Io)?;
        let kind = adapter.kind();
        if slots.contains_key(&kind) {
            return Err(Error::AlreadyExists);
        }
        slots.insert(kind, AdapterSlot { adapter, enabled: false, port: 0 });
        Ok(())
    }

    fn slot_adapter(&self, kind: AdapterKind) -> Result<Arc<dyn Adapter>> {
        let slots = self.slots.lock().map_err(|_| Error::Io)?;
        slots.get(&kind).map(|slot| slot.adapter.clone()).ok_or(Error::NotFound)
    }

    /// Enables an adapter on `port`. Invalid configurations are
    /// rejected synchronously, before any state change.
    pub async fn enable(&self, kind: AdapterKind, port: u16) -> Result<()> {
        if port == 0 {
            return Err(Error::InvalidArgument);
        }
        {
            let slots = self.slots.lock().map_err(|_| Error::Io)?;
            let slot = slots.get(&kind).ok_or(Error::NotFound)?;
            if slot.enabled {
                return Err(Error::AlreadyExists);
            }
        }
        let adapter = self.slot_adapter(kind)?;
        adapter.start(port).await?;
        let mut slots = self.slots.lock().map_err(|_| Error::Io)?;
        if let Some(slot) = slots.get_mut(&kind) {
            slot.enabled = true;
            slot.port = port;
        }
        info!(?kind, port, "adapter enabled");
        Ok(())
    }

    /// Disables an adapter, draining in-flight work first.
    pub async fn disable(&self, kind: AdapterKind) -> Result<()> {
        {
            let slots = self.slots.lock().map_err(|_| Error::Io)?;
            let slot = slots.get(&kind).ok_or(Error::NotFound)?;
            if !slot.enabled {
                return Err(Error::InvalidArgument);
            }
        }
        let adapter = self.slot_adapter(kind)?;
        adapter.stop(self.drain_timeout).await?;
        let mut slots = self.slots.lock().map_err(|_| Error::Io)?;
        if let Some(slot) = slots.get_mut(&kind) {
            slot.enabled = false;
            slot.port = 0;
        }
        info!(?kind, "adapter disabled");
        Ok(())
    }

    /// Hot-reloads an adapter onto a new port: drain-stop, then start.
    /// Core state and the other adapters are untouched.
    pub async fn set_port(&self, kind: AdapterKind, port: u16) -> Result<()> {
        if port == 0 {
            return Err(Error::InvalidArgument);
        }
        {
            let slots = self.slots.lock().map_err(|_| Error::Io)?;
            let slot = slots.get(&kind).ok_or(Error::NotFound)?;
            if !slot.enabled {
                return Err(Error::InvalidArgument);
            }
            if slot.port == port {
                return Ok(());
            }
        }
        let adapter = self.slot_adapter(kind)?;
        adapter.stop(self.drain_timeout).await?;
        adapter.start(port).await?;
        let mut slots = self.slots.lock().map_err(|_| Error::Io)?;
        if let Some(slot) = slots.get_mut(&kind) {
            slot.port = port;
        }
        info!(?kind, port, "adapter port changed");
        Ok(())
    }

    /// `(enabled, bound port)` for one adapter.
    pub fn status(&self, kind: AdapterKind) -> Result<(bool, Option<u16>)> {
        let slots = self.slots.lock().map_err(|_| Error::Io)?;
        let slot = slots.get(&kind).ok_or(Error::NotFound)?;
        Ok((slot.enabled, slot.adapter.port()))
    }

    /// Disables every enabled adapter; used at shutdown.
    pub async fn disable_all(&self) {
        let kinds: Vec<AdapterKind> = match self.slots.lock() {
            Ok(slots) => slots
                .iter()
                .filter(|(_, slot)| slot.enabled)
                .map(|(kind, _)| *kind)
                .collect(),
            Err(_) => return,
        };
        for kind in kinds {
            if let Err(error) = self.disable(kind).await {
                warn!(?kind, %error, "adapter failed to stop cleanly");
            }
        }
    }
}

/// Per-connection work a protocol front-end plugs into [`TcpAdapter`].
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, socket: TcpStream);
}

struct Listening {
    port: u16,
    accept_task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    connections: Arc<StdMutex<Vec<JoinHandle<()>>>>,
}

/// Generic TCP listener adapter: accepts connections and spawns the
/// handler per socket, tracking in-flight work for drain.
pub struct TcpAdapter<H: ConnectionHandler> {
    kind: AdapterKind,
    handler: Arc<H>,
    listening: StdMutex<Option<Listening>>,
}

impl<H: ConnectionHandler> TcpAdapter<H> {
    pub fn new(kind: AdapterKind, handler: Arc<H>) -> Self {
        Self { kind, handler, listening: StdMutex::new(None) }
    }

    async fn accept_loop(
        listener: TcpListener,
        handler: Arc<H>,
        mut shutdown: watch::Receiver<bool>,
        connections: Arc<StdMutex<Vec<JoinHandle<()>>>>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            warn!(%error, "accept failed");
                            continue;
                        }
                    };
                    debug!(%peer, "connection accepted");
                    if let Err(error) = socket.set_nodelay(true) {
                        warn!(%error, "set_nodelay failed");
                    }
                    let handler = handler.clone();
                    let task = tokio::spawn(async move {
                        handler.handle(socket).await;
                    });
                    if let Ok(mut connections) = connections.lock() {
                        connections.retain(|task| !task.is_finished());
                        connections.push(task);
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[async_trait]
impl<H: ConnectionHandler> Adapter for TcpAdapter<H> {
    fn kind(&self) -> AdapterKind {
        self.kind
    }

    async fn start(&self, port: u16) -> Result<()> {
        {
            let listening = self.listening.lock().map_err(|_| Error::Io)?;
            if listening.is_some() {
                return Err(Error::AlreadyExists);
            }
        }
        let listener =
            TcpListener::bind(("127.0.0.1", port)).await.map_err(|_| Error::Io)?;
        let port = listener.local_addr().map_err(|_| Error::Io)?.port();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let connections = Arc::new(StdMutex::new(Vec::new()));
        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            self.handler.clone(),
            shutdown_rx,
            connections.clone(),
        ));
        let mut listening = self.listening.lock().map_err(|_| Error::Io)?;
        *listening = Some(Listening { port, accept_task, shutdown, connections });
        Ok(())
    }

    async fn stop(&self, drain: Duration) -> Result<()> {
        let listening = {
            let mut listening = self.listening.lock().map_err(|_| Error::Io)?;
            listening.take().ok_or(Error::InvalidArgument)?
        };
        let _ = listening.shutdown.send(true);
        let _ = listening.accept_task.await;

        let connections: Vec<JoinHandle<()>> = match listening.connections.lock() {
            Ok(mut connections) => connections.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        let aborters: Vec<_> = connections.iter().map(|task| task.abort_handle()).collect();
        if tokio::time::timeout(drain, join_all(connections)).await.is_err() {
            // Drain deadline passed; sever what remains.
            for aborter in &aborters {
                aborter.abort();
            }
            warn!(
                connections = aborters.len(),
                "drain deadline reached; connections closed"
            );
        }
        Ok(())
    }

    fn port(&self) -> Option<u16> {
        self.listening.lock().ok().and_then(|listening| {
            listening.as_ref().map(|listening| listening.port)
        })
    }
}
