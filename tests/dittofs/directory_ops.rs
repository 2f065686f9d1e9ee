use super::common::Fixture;
use dittofs::error::Error;
use dittofs::metadata::FileId;

#[tokio::test]
async fn rename_moves_across_directories_atomically() {
    let fixture = Fixture::new().await;
    let ctx = fixture.ctx("client").await;
    let coordinator = &fixture.server.coordinator;

    let src_dir = coordinator
        .mkdir(&fixture.share, &ctx, fixture.root(), "src", 0o755)
        .await
        .expect("mkdir src");
    let dst_dir = coordinator
        .mkdir(&fixture.share, &ctx, fixture.root(), "dst", 0o755)
        .await
        .expect("mkdir dst");
    let file = coordinator
        .create_regular(&fixture.share, &ctx, src_dir.id, "moved.txt", 0o644)
        .await
        .expect("create file");

    coordinator
        .rename(&fixture.share, &ctx, src_dir.id, "moved.txt", dst_dir.id, "arrived.txt")
        .await
        .expect("rename");

    // Never both absent: exactly the new name resolves.
    assert_eq!(
        coordinator.lookup(&fixture.share, &ctx, src_dir.id, "moved.txt").await,
        Err(Error::NotFound)
    );
    assert_eq!(
        coordinator
            .lookup(&fixture.share, &ctx, dst_dir.id, "arrived.txt")
            .await
            .expect("new name resolves"),
        file.id
    );
}

#[tokio::test]
async fn rename_into_own_descendant_is_refused() {
    let fixture = Fixture::new().await;
    let ctx = fixture.ctx("client").await;
    let coordinator = &fixture.server.coordinator;

    let outer = coordinator
        .mkdir(&fixture.share, &ctx, fixture.root(), "outer", 0o755)
        .await
        .expect("mkdir outer");
    let inner = coordinator
        .mkdir(&fixture.share, &ctx, outer.id, "inner", 0o755)
        .await
        .expect("mkdir inner");

    let refused = coordinator
        .rename(&fixture.share, &ctx, fixture.root(), "outer", inner.id, "cycle")
        .await;
    assert_eq!(refused.unwrap_err(), Error::InvalidArgument);
    // Both directories still resolve where they were.
    assert!(coordinator.lookup(&fixture.share, &ctx, fixture.root(), "outer").await.is_ok());
    assert!(coordinator.lookup(&fixture.share, &ctx, outer.id, "inner").await.is_ok());
}

#[tokio::test]
async fn link_count_matches_directory_references() {
    let fixture = Fixture::new().await;
    let ctx = fixture.ctx("client").await;
    let coordinator = &fixture.server.coordinator;

    let file = fixture.write_file("client", "primary", b"shared").await;
    coordinator
        .link(&fixture.share, &ctx, fixture.root(), "alias-1", file)
        .await
        .expect("first link");
    coordinator
        .link(&fixture.share, &ctx, fixture.root(), "alias-2", file)
        .await
        .expect("second link");

    let count_references = |entries: &[dittofs::metadata::DirEntry], id: FileId| {
        entries.iter().filter(|entry| entry.id == id).count() as u32
    };
    let page = coordinator
        .readdir(&fixture.share, &ctx, fixture.root(), 0, 0, 65536)
        .await
        .expect("list root");
    let entry = coordinator.getattr(&fixture.share, &ctx, file).await.expect("getattr");
    assert_eq!(entry.nlink, count_references(&page.entries, file));
    assert_eq!(entry.nlink, 3);

    // Aliases serve the same bytes.
    let alias = coordinator
        .lookup(&fixture.share, &ctx, fixture.root(), "alias-2")
        .await
        .expect("alias resolves");
    assert_eq!(fixture.read_file("client", alias).await, b"shared");

    coordinator
        .unlink(&fixture.share, &ctx, fixture.root(), "alias-1")
        .await
        .expect("drop one alias");
    let entry = coordinator.getattr(&fixture.share, &ctx, file).await.expect("getattr");
    assert_eq!(entry.nlink, 2);
}

#[tokio::test]
async fn rmdir_requires_an_empty_directory() {
    let fixture = Fixture::new().await;
    let ctx = fixture.ctx("client").await;
    let coordinator = &fixture.server.coordinator;

    let dir = coordinator
        .mkdir(&fixture.share, &ctx, fixture.root(), "full", 0o755)
        .await
        .expect("mkdir");
    coordinator
        .create_regular(&fixture.share, &ctx, dir.id, "occupant", 0o644)
        .await
        .expect("fill dir");

    assert_eq!(
        coordinator.rmdir(&fixture.share, &ctx, fixture.root(), "full").await,
        Err(Error::NotEmpty)
    );
    coordinator.unlink(&fixture.share, &ctx, dir.id, "occupant").await.expect("empty it");
    coordinator.rmdir(&fixture.share, &ctx, fixture.root(), "full").await.expect("rmdir");
}

#[tokio::test]
async fn symlinks_round_trip_their_target() {
    let fixture = Fixture::new().await;
    let ctx = fixture.ctx("client").await;
    let coordinator = &fixture.server.coordinator;

    let link = coordinator
        .symlink(&fixture.share, &ctx, fixture.root(), "pointer", "../elsewhere/target")
        .await
        .expect("symlink");
    let target = coordinator
        .readlink(&fixture.share, &ctx, link.id)
        .await
        .expect("readlink");
    assert_eq!(target, "../elsewhere/target");
}

#[tokio::test]
async fn readdirplus_carries_attributes() {
    let fixture = Fixture::new().await;
    let ctx = fixture.ctx("client").await;
    let coordinator = &fixture.server.coordinator;

    fixture.write_file("client", "visible.txt", b"12345").await;
    let (entries, _, eof) = coordinator
        .read_dir_plus(&fixture.share, &ctx, fixture.root(), 0, 0, 65536)
        .await
        .expect("readdirplus");
    assert!(eof);
    let entry = entries
        .iter()
        .find(|entry| entry.entry.name == "visible.txt")
        .expect("entry listed");
    let attr = entry.attr.as_ref().expect("attributes attached");
    assert_eq!(attr.size, 5);
}

#[tokio::test]
async fn set_and_list_xattrs() {
    let fixture = Fixture::new().await;
    let ctx = fixture.ctx("client").await;
    let coordinator = &fixture.server.coordinator;

    let file = fixture.write_file("client", "tagged.txt", b"x").await;
    coordinator
        .set_xattr(&fixture.share, &ctx, file, "user.origin", b"smb".to_vec())
        .await
        .expect("set xattr");
    assert_eq!(
        coordinator
            .get_xattr(&fixture.share, &ctx, file, "user.origin")
            .await
            .expect("get xattr"),
        b"smb"
    );
    assert_eq!(
        coordinator.list_xattr(&fixture.share, &ctx, file).await.expect("list"),
        vec!["user.origin".to_owned()]
    );
    coordinator
        .remove_xattr(&fixture.share, &ctx, file, "user.origin")
        .await
        .expect("remove");
    assert_eq!(
        coordinator.get_xattr(&fixture.share, &ctx, file, "user.origin").await,
        Err(Error::NotFound)
    );
}
