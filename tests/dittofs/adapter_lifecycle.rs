use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::common::Fixture;
use dittofs::adapter::{AdapterKind, ConnectionHandler, TcpAdapter};
use dittofs::content::ContentStore;
use dittofs::error::Error;
use dittofs::metadata::MetadataStore;

struct EchoHandler;

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn handle(&self, mut socket: TcpStream) {
        let mut buf = [0u8; 64];
        while let Ok(read) = socket.read(&mut buf).await {
            if read == 0 {
                break;
            }
            if socket.write_all(&buf[..read]).await.is_err() {
                break;
            }
        }
    }
}

/// Reserve a probably-free local port.
fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("probe port");
    listener.local_addr().expect("local addr").port()
}

async fn roundtrip(client: &mut TcpStream, payload: &[u8]) {
    client.write_all(payload).await.expect("send");
    let mut buf = vec![0u8; payload.len()];
    client.read_exact(&mut buf).await.expect("echo back");
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn hot_reload_of_one_adapter_does_not_disturb_the_other() {
    let fixture = Fixture::new().await;
    let supervisor = &fixture.server.supervisor;
    supervisor
        .register(Arc::new(TcpAdapter::new(AdapterKind::Nfs, Arc::new(EchoHandler))))
        .expect("register nfs");
    supervisor
        .register(Arc::new(TcpAdapter::new(AdapterKind::Smb, Arc::new(EchoHandler))))
        .expect("register smb");

    let nfs_port = free_port();
    let smb_port = free_port();
    supervisor.enable(AdapterKind::Nfs, nfs_port).await.expect("enable nfs");
    supervisor.enable(AdapterKind::Smb, smb_port).await.expect("enable smb");

    // A connected SMB client mid-conversation.
    let mut smb_client =
        TcpStream::connect(("127.0.0.1", smb_port)).await.expect("smb connect");
    roundtrip(&mut smb_client, b"before").await;

    // Core state that must survive the reload.
    let file = fixture.write_file("client", "stable.txt", b"stable").await;

    let new_nfs_port = free_port();
    supervisor.set_port(AdapterKind::Nfs, new_nfs_port).await.expect("hot reload");

    // The SMB conversation continues undisturbed.
    roundtrip(&mut smb_client, b"after").await;

    // NFS clients rebind to the new port; the old one is gone.
    let mut nfs_client =
        TcpStream::connect(("127.0.0.1", new_nfs_port)).await.expect("rebind");
    roundtrip(&mut nfs_client, b"hello").await;
    assert!(TcpStream::connect(("127.0.0.1", nfs_port)).await.is_err());

    // Core state is unchanged.
    assert_eq!(fixture.read_file("client", file).await, b"stable");
}

#[tokio::test]
async fn disable_drains_then_refuses_new_connections() {
    let fixture = Fixture::new().await;
    let supervisor = &fixture.server.supervisor;
    supervisor
        .register(Arc::new(TcpAdapter::new(AdapterKind::Nfs, Arc::new(EchoHandler))))
        .expect("register");

    let port = free_port();
    supervisor.enable(AdapterKind::Nfs, port).await.expect("enable");
    {
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        roundtrip(&mut client, b"ping").await;
    }

    supervisor.disable(AdapterKind::Nfs).await.expect("disable");
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    assert_eq!(supervisor.status(AdapterKind::Nfs).expect("status"), (false, None));
}

#[tokio::test]
async fn invalid_lifecycle_requests_fail_synchronously() {
    let fixture = Fixture::new().await;
    let supervisor = &fixture.server.supervisor;
    supervisor
        .register(Arc::new(TcpAdapter::new(AdapterKind::Nfs, Arc::new(EchoHandler))))
        .expect("register");

    assert_eq!(
        supervisor.enable(AdapterKind::Nfs, 0).await.unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(
        supervisor.enable(AdapterKind::Smb, free_port()).await.unwrap_err(),
        Error::NotFound
    );
    assert_eq!(
        supervisor.disable(AdapterKind::Nfs).await.unwrap_err(),
        Error::InvalidArgument
    );
}

#[tokio::test]
async fn shutdown_stops_adapters_and_background_tasks() {
    let fixture = Fixture::new().await;
    let supervisor = &fixture.server.supervisor;
    supervisor
        .register(Arc::new(TcpAdapter::new(AdapterKind::Nfs, Arc::new(EchoHandler))))
        .expect("register");
    let port = free_port();
    supervisor.enable(AdapterKind::Nfs, port).await.expect("enable");

    // Leave dirty bytes behind; shutdown flushes them best-effort.
    let file = fixture.write_file("client", "flushed.bin", b"seed").await;
    let handle = fixture.open_write("client", file).await;
    fixture.server.coordinator.write(handle, 0, b"SEED").await.expect("write");

    tokio::time::timeout(Duration::from_secs(5), fixture.server.shutdown())
        .await
        .expect("shutdown completes");

    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    let entry = fixture.share.metadata.read_entry(file).await.expect("entry");
    let content = entry.content.expect("content");
    assert_eq!(
        fixture.share.content.read(content, 0, 4).await.expect("store read"),
        b"SEED"
    );
}
