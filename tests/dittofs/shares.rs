use std::sync::Arc;

use super::common::Fixture;
use dittofs::content::memory::MemoryContentStore;
use dittofs::error::Error;
use dittofs::identity::{IdentityStore, Permission};
use dittofs::metadata::memory::MemoryMetadataStore;
use dittofs::metadata::{MetadataStore, RootAttrs};
use dittofs::share::ShareSpec;

fn second_spec(name: &str) -> ShareSpec {
    ShareSpec {
        name: name.into(),
        metadata_store: "meta-2".into(),
        content_store: "data-2".into(),
        cache_budget: 1 << 20,
        read_only: false,
        default_access: Permission::ReadWrite,
        guest_allowed: false,
        root_attrs: RootAttrs { mode: 0o750, uid: 10, gid: 10 },
    }
}

fn register_second_stores(fixture: &Fixture) {
    fixture
        .server
        .registry
        .register_metadata_store("meta-2", Arc::new(MemoryMetadataStore::new()))
        .expect("register metadata");
    fixture
        .server
        .registry
        .register_content_store("data-2", Arc::new(MemoryContentStore::new()))
        .expect("register content");
}

#[tokio::test]
async fn root_attrs_flow_into_the_lazily_created_root() {
    let fixture = Fixture::new().await;
    register_second_stores(&fixture);
    let share = fixture
        .server
        .create_share(second_spec("/secondary"))
        .await
        .expect("bind share");

    let root = share.metadata.read_entry(share.root).await.expect("root entry");
    assert!(root.is_dir());
    assert_eq!(root.mode, 0o750);
    assert_eq!(root.uid, 10);
    assert_eq!(root.gid, 10);
}

#[tokio::test]
async fn share_deletion_strips_dependent_permissions() {
    let fixture = Fixture::new().await;
    register_second_stores(&fixture);
    fixture.server.create_share(second_spec("/secondary")).await.expect("bind");

    let identity = &fixture.server.identity;
    let user = identity.user_by_name("tester").await.expect("user");
    identity
        .grant_user_access(user.id, "/secondary", Permission::ReadWrite)
        .await
        .expect("grant");
    assert_eq!(
        identity.permission_for(user.id, "/secondary").await.expect("query"),
        Some(Permission::ReadWrite)
    );

    fixture.server.delete_share("/secondary").await.expect("delete share");
    assert_eq!(
        identity.permission_for(user.id, "/secondary").await.expect("query"),
        None
    );
    assert_eq!(fixture.server.registry.get("/secondary").err(), Some(Error::NotFound));
}

#[tokio::test]
async fn stores_outlive_shares_but_not_the_other_way_round() {
    let fixture = Fixture::new().await;
    register_second_stores(&fixture);
    fixture.server.create_share(second_spec("/secondary")).await.expect("bind");

    assert_eq!(
        fixture.server.registry.unregister_metadata_store("meta-2"),
        Err(Error::InvalidArgument)
    );
    assert_eq!(
        fixture.server.registry.unregister_content_store("data-2"),
        Err(Error::InvalidArgument)
    );

    fixture.server.delete_share("/secondary").await.expect("delete");
    fixture.server.registry.unregister_metadata_store("meta-2").expect("unregister meta");
    fixture.server.registry.unregister_content_store("data-2").expect("unregister data");
}

#[tokio::test]
async fn read_only_shares_refuse_mutation() {
    let fixture = Fixture::new().await;
    register_second_stores(&fixture);
    let mut spec = second_spec("/frozen");
    spec.read_only = true;
    let share = fixture.server.create_share(spec).await.expect("bind read-only");

    let ctx = fixture.ctx("client").await;
    let refused = fixture
        .server
        .coordinator
        .create_regular(&share, &ctx, share.root, "file.txt", 0o644)
        .await;
    assert_eq!(refused.unwrap_err(), Error::ReadOnly);
}

#[tokio::test]
async fn path_resolution_routes_to_the_right_share() {
    let fixture = Fixture::new().await;
    register_second_stores(&fixture);
    fixture.server.create_share(second_spec("/export/nested")).await.expect("bind nested");

    let coordinator = &fixture.server.coordinator;
    let (share, rest) = coordinator.resolve_share("/export/nested/deep/file.txt").expect("resolve");
    assert_eq!(share.name, "/export/nested");
    assert_eq!(rest, "deep/file.txt");

    let (share, rest) = coordinator.resolve_share("/export/top.txt").expect("resolve");
    assert_eq!(share.name, "/export");
    assert_eq!(rest, "top.txt");
}

#[tokio::test]
async fn share_stat_reports_store_totals() {
    let fixture = Fixture::new().await;
    let ctx = fixture.ctx("client").await;

    fixture.write_file("client", "counted.bin", b"0123456789").await;
    let stat = fixture
        .server
        .coordinator
        .share_stat(&fixture.share, &ctx)
        .await
        .expect("share stat");
    assert_eq!(stat.bytes_used, 10);
    // Root plus one file.
    assert_eq!(stat.entries, 2);
}
