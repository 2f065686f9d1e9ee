use super::common::Fixture;
use dittofs::content::ContentStore;
use dittofs::error::Error;
use dittofs::metadata::MetadataStore;

#[tokio::test]
async fn bytes_written_over_nfs_are_visible_over_smb() {
    let fixture = Fixture::new().await;

    let file = fixture.write_file("nfs-client-a", "x.txt", b"hello").await;
    let bytes = fixture.read_file("smb-client-b", file).await;
    assert_eq!(bytes, b"hello");
    assert_eq!(bytes.len(), 5);
}

#[tokio::test]
async fn smb_delete_is_promptly_visible_to_nfs() {
    let fixture = Fixture::new().await;
    let smb = fixture.ctx("smb-client").await;
    let nfs = fixture.ctx("nfs-client").await;
    let coordinator = &fixture.server.coordinator;

    fixture.write_file("nfs-client", "x.txt", b"hello").await;
    coordinator
        .unlink(&fixture.share, &smb, fixture.root(), "x.txt")
        .await
        .expect("delete over smb");

    let stat = coordinator.lookup(&fixture.share, &nfs, fixture.root(), "x.txt").await;
    assert_eq!(stat.unwrap_err(), Error::NotFound);
}

#[tokio::test]
async fn committed_writes_are_seen_by_any_fresh_handle() {
    let fixture = Fixture::new().await;
    let file = fixture.write_file("writer", "data.bin", b"first").await;

    // Overwrite a range through a second handle, commit, then read
    // through a third.
    let handle = fixture.open_write("writer", file).await;
    fixture.server.coordinator.write(handle, 0, b"FIRST").await.expect("overwrite");
    fixture.server.coordinator.commit(handle, 0, 5).await.expect("commit");
    fixture.server.coordinator.close(handle).await.expect("close");

    let bytes = fixture.read_file("reader", file).await;
    assert_eq!(bytes, b"FIRST");
}

#[tokio::test]
async fn unlinked_open_file_keeps_content_until_last_close() {
    let fixture = Fixture::new().await;
    let ctx = fixture.ctx("client").await;
    let coordinator = &fixture.server.coordinator;

    let file = fixture.write_file("client", "doomed.txt", b"still readable").await;
    let opened = coordinator
        .open(&fixture.share, &ctx, file, false, None)
        .await
        .expect("hold file open");

    coordinator
        .unlink(&fixture.share, &ctx, fixture.root(), "doomed.txt")
        .await
        .expect("unlink while open");

    // The open handle still serves the bytes.
    let (bytes, _) = coordinator.read(opened.handle, 0, 14).await.expect("read after unlink");
    assert_eq!(bytes, b"still readable");

    // Last close reclaims the content.
    coordinator.close(opened.handle).await.expect("last close");
    let entry = fixture.share.metadata.read_entry(file).await.expect("entry survives");
    let content = entry.content.expect("regular file had content");
    assert_eq!(fixture.share.content.stat(content).await, Err(Error::NotFound));
}

#[tokio::test]
async fn create_then_unlink_restores_the_parent_listing() {
    let fixture = Fixture::new().await;
    let ctx = fixture.ctx("client").await;
    let coordinator = &fixture.server.coordinator;

    let before = coordinator
        .readdir(&fixture.share, &ctx, fixture.root(), 0, 0, 65536)
        .await
        .expect("listing before");

    fixture.write_file("client", "ephemeral.txt", b"x").await;
    coordinator
        .unlink(&fixture.share, &ctx, fixture.root(), "ephemeral.txt")
        .await
        .expect("unlink");

    let after = coordinator
        .readdir(&fixture.share, &ctx, fixture.root(), 0, 0, 65536)
        .await
        .expect("listing after");
    let names = |page: &dittofs::metadata::ReadDirPage| {
        page.entries.iter().map(|entry| entry.name.clone()).collect::<Vec<_>>()
    };
    assert_eq!(names(&before), names(&after));
}
