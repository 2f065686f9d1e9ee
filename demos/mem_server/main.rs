//! Memory-backed demo server: binds both adapter slots with a
//! diagnostic line protocol so the lifecycle, share and cache plumbing
//! can be poked with `nc`.

use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{error, info};

use dittofs::adapter::{AdapterKind, ConnectionHandler, TcpAdapter};
use dittofs::config::Config;
use dittofs::content::memory::MemoryContentStore;
use dittofs::identity::memory::MemoryIdentityStore;
use dittofs::identity::Permission;
use dittofs::locks::store::MemoryLockStore;
use dittofs::metadata::memory::MemoryMetadataStore;
use dittofs::metadata::RootAttrs;
use dittofs::server::Server;
use dittofs::share::ShareSpec;

#[derive(Parser, Debug)]
#[command(about = "DittoFS demo server with in-memory stores")]
struct Args {
    /// Port for the NFS adapter slot.
    #[arg(long, default_value_t = 12049)]
    nfs_port: u16,

    /// Port for the SMB adapter slot.
    #[arg(long, default_value_t = 10445)]
    smb_port: u16,

    /// Optional TOML configuration file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,
}

struct StatusHandler {
    server: Arc<Server>,
    label: &'static str,
}

#[async_trait]
impl ConnectionHandler for StatusHandler {
    async fn handle(&self, socket: TcpStream) {
        let (read, mut write) = socket.into_split();
        let mut lines = BufReader::new(read).lines();
        let banner = format!("dittofs {} adapter slot\n", self.label);
        if write.write_all(banner.as_bytes()).await.is_err() {
            return;
        }
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = match line.trim() {
                "shares" => {
                    let names: Vec<String> = self
                        .server
                        .registry
                        .list()
                        .iter()
                        .map(|share| {
                            format!(
                                "{} cached={}B dirty={}B",
                                share.name,
                                share.cache.total_size(),
                                share.cache.dirty_size()
                            )
                        })
                        .collect();
                    names.join("\n") + "\n"
                }
                "grace" => format!("grace_active={}\n", self.server.locks.grace_active()),
                "quit" => break,
                other => format!("unknown command: {other}\n"),
            };
            if write.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(error) => {
                error!(%error, "failed to load config");
                return;
            }
        },
        None => Config::default(),
    };

    let identity = Arc::new(MemoryIdentityStore::new());
    let server = match Server::start(config, identity, Arc::new(MemoryLockStore::new())).await {
        Ok(server) => server,
        Err(error) => {
            error!(%error, "server failed to start");
            return;
        }
    };

    server
        .registry
        .register_metadata_store("memory-meta", Arc::new(MemoryMetadataStore::new()))
        .expect("register metadata store");
    server
        .registry
        .register_content_store("memory-data", Arc::new(MemoryContentStore::new()))
        .expect("register content store");
    server
        .create_share(ShareSpec {
            name: "/export".into(),
            metadata_store: "memory-meta".into(),
            content_store: "memory-data".into(),
            cache_budget: server.config().cache.byte_budget,
            read_only: false,
            default_access: Permission::ReadWrite,
            guest_allowed: true,
            root_attrs: RootAttrs::default(),
        })
        .await
        .expect("bind /export");

    let nfs = Arc::new(TcpAdapter::new(
        AdapterKind::Nfs,
        Arc::new(StatusHandler { server: server.clone(), label: "nfs" }),
    ));
    let smb = Arc::new(TcpAdapter::new(
        AdapterKind::Smb,
        Arc::new(StatusHandler { server: server.clone(), label: "smb" }),
    ));
    server.supervisor.register(nfs).expect("register nfs slot");
    server.supervisor.register(smb).expect("register smb slot");
    server
        .supervisor
        .enable(AdapterKind::Nfs, args.nfs_port)
        .await
        .expect("enable nfs slot");
    server
        .supervisor
        .enable(AdapterKind::Smb, args.smb_port)
        .await
        .expect("enable smb slot");

    info!(nfs = args.nfs_port, smb = args.smb_port, "demo server listening; ctrl-c to stop");
    let _ = tokio::signal::ctrl_c().await;
    server.shutdown().await;
}
