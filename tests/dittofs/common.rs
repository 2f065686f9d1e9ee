use std::sync::Arc;

use dittofs::config::Config;
use dittofs::content::memory::MemoryContentStore;
use dittofs::coordinator::{HandleId, OpContext};
use dittofs::identity::memory::MemoryIdentityStore;
use dittofs::identity::{AuthIdentity, IdentityStore, Permission, Principal};
use dittofs::locks::store::{LockStore, MemoryLockStore};
use dittofs::metadata::{FileId, RootAttrs};
use dittofs::server::Server;
use dittofs::share::{Share, ShareSpec};

pub struct Fixture {
    pub server: Arc<Server>,
    pub share: Arc<Share>,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::build(Config::for_tests(), Arc::new(MemoryLockStore::new())).await
    }

    pub async fn with_lock_store(lock_store: Arc<dyn LockStore>) -> Self {
        Self::build(Config::for_tests(), lock_store).await
    }

    pub async fn with_config(config: Config) -> Self {
        Self::build(config, Arc::new(MemoryLockStore::new())).await
    }

    async fn build(config: Config, lock_store: Arc<dyn LockStore>) -> Self {
        let identity = Arc::new(MemoryIdentityStore::new());
        identity
            .create_user("tester", None, 1000, 1000, "Test User")
            .await
            .expect("create fixture user");
        let budget = config.cache.byte_budget;
        let server =
            Server::start(config, identity, lock_store).await.expect("start server");
        server
            .registry
            .register_metadata_store("meta", Arc::new(dittofs::metadata::memory::MemoryMetadataStore::new()))
            .expect("register metadata store");
        server
            .registry
            .register_content_store("data", Arc::new(MemoryContentStore::new()))
            .expect("register content store");
        let share = server
            .create_share(ShareSpec {
                name: "/export".into(),
                metadata_store: "meta".into(),
                content_store: "data".into(),
                cache_budget: budget,
                read_only: false,
                default_access: Permission::ReadWrite,
                guest_allowed: true,
                root_attrs: RootAttrs::default(),
            })
            .await
            .expect("bind /export");
        Self { server, share }
    }

    /// Authenticated context tagged with a protocol-neutral client id.
    pub async fn ctx(&self, client: &str) -> OpContext {
        let identity = self
            .server
            .identity
            .resolve(&Principal::User("tester".into()))
            .await
            .expect("resolve fixture user");
        OpContext::new(identity, client)
    }

    pub fn guest_ctx(&self, client: &str) -> OpContext {
        OpContext::new(AuthIdentity::guest(), client)
    }

    pub fn root(&self) -> FileId {
        self.share.root
    }

    /// Creates a file under the root and writes `data` through a
    /// committed handle.
    pub async fn write_file(&self, client: &str, name: &str, data: &[u8]) -> FileId {
        let ctx = self.ctx(client).await;
        let entry = self
            .server
            .coordinator
            .create_regular(&self.share, &ctx, self.root(), name, 0o644)
            .await
            .expect("create file");
        let opened = self
            .server
            .coordinator
            .open(&self.share, &ctx, entry.id, true, None)
            .await
            .expect("open for write");
        self.server
            .coordinator
            .write(opened.handle, 0, data)
            .await
            .expect("write payload");
        self.server
            .coordinator
            .commit(opened.handle, 0, data.len() as u64)
            .await
            .expect("commit payload");
        self.server.coordinator.close(opened.handle).await.expect("close handle");
        entry.id
    }

    /// Opens `id` read-only and returns its full contents.
    pub async fn read_file(&self, client: &str, id: FileId) -> Vec<u8> {
        let ctx = self.ctx(client).await;
        let opened = self
            .server
            .coordinator
            .open(&self.share, &ctx, id, false, None)
            .await
            .expect("open for read");
        let size = self.server.coordinator.size(opened.handle).await.expect("size");
        let (bytes, eof) = self
            .server
            .coordinator
            .read(opened.handle, 0, size.max(1))
            .await
            .expect("read contents");
        assert!(eof);
        self.server.coordinator.close(opened.handle).await.expect("close handle");
        bytes
    }

    pub async fn open_write(&self, client: &str, id: FileId) -> HandleId {
        let ctx = self.ctx(client).await;
        self.server
            .coordinator
            .open(&self.share, &ctx, id, true, None)
            .await
            .expect("open for write")
            .handle
    }
}
