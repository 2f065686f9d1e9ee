use std::sync::Arc;

use super::common::Fixture;
use dittofs::config::Config;
use dittofs::content::memory::MemoryContentStore;
use dittofs::coordinator::{OpContext, ACCESS_MODIFY, ACCESS_READ};
use dittofs::error::Error;
use dittofs::identity::{IdentityStore, Permission, Principal};
use dittofs::metadata::memory::MemoryMetadataStore;
use dittofs::metadata::RootAttrs;
use dittofs::share::ShareSpec;

/// A share whose authenticated default is read-only, so explicit
/// grants matter.
async fn restricted_fixture() -> Fixture {
    let fixture = Fixture::with_config(Config::for_tests()).await;
    fixture
        .server
        .registry
        .register_metadata_store("meta-restricted", Arc::new(MemoryMetadataStore::new()))
        .expect("register metadata");
    fixture
        .server
        .registry
        .register_content_store("data-restricted", Arc::new(MemoryContentStore::new()))
        .expect("register content");
    fixture
        .server
        .create_share(ShareSpec {
            name: "/restricted".into(),
            metadata_store: "meta-restricted".into(),
            content_store: "data-restricted".into(),
            cache_budget: 1 << 20,
            read_only: false,
            default_access: Permission::Read,
            guest_allowed: false,
            root_attrs: RootAttrs::default(),
        })
        .await
        .expect("bind /restricted");
    fixture
}

#[tokio::test]
async fn default_level_refuses_writes_until_granted() {
    let fixture = restricted_fixture().await;
    let share = fixture.server.registry.get("/restricted").expect("share");
    let ctx = fixture.ctx("client").await;
    let coordinator = &fixture.server.coordinator;

    // Reads pass on the authenticated default.
    coordinator
        .readdir(&share, &ctx, share.root, 0, 0, 65536)
        .await
        .expect("read allowed");
    let refused = coordinator
        .create_regular(&share, &ctx, share.root, "nope.txt", 0o644)
        .await;
    assert_eq!(refused.unwrap_err(), Error::PermissionDenied);

    // A direct grant applies to the very next request.
    let user = fixture.server.identity.user_by_name("tester").await.expect("user");
    fixture
        .server
        .identity
        .grant_user_access(user.id, "/restricted", Permission::ReadWrite)
        .await
        .expect("grant");
    coordinator
        .create_regular(&share, &ctx, share.root, "yes.txt", 0o644)
        .await
        .expect("write after grant");
}

#[tokio::test]
async fn group_grants_reach_members() {
    let fixture = restricted_fixture().await;
    let share = fixture.server.registry.get("/restricted").expect("share");
    let identity = &fixture.server.identity;
    let coordinator = &fixture.server.coordinator;

    let user = identity.user_by_name("tester").await.expect("user");
    let group = identity.create_group("editors", Some(3000), "write access").await.expect("group");
    identity.add_member(group.id, user.id).await.expect("join group");
    identity
        .grant_group_access(group.id, "/restricted", Permission::ReadWrite)
        .await
        .expect("group grant");

    let ctx = fixture.ctx("client").await;
    coordinator
        .create_regular(&share, &ctx, share.root, "by-group.txt", 0o644)
        .await
        .expect("group grant suffices");

    // Revoking the group grant is hot.
    identity.revoke_group_access(group.id, "/restricted").await.expect("revoke");
    let refused = coordinator
        .create_regular(&share, &ctx, share.root, "after-revoke.txt", 0o644)
        .await;
    assert_eq!(refused.unwrap_err(), Error::PermissionDenied);
}

#[tokio::test]
async fn guests_are_confined_to_guest_enabled_shares() {
    let fixture = restricted_fixture().await;
    let coordinator = &fixture.server.coordinator;

    // Guest on the guest-enabled fixture share: read yes, write no.
    let guest = fixture.guest_ctx("anon");
    coordinator
        .readdir(&fixture.share, &guest, fixture.root(), 0, 0, 65536)
        .await
        .expect("guest read on guest share");
    assert_eq!(
        coordinator
            .create_regular(&fixture.share, &guest, fixture.root(), "guest.txt", 0o644)
            .await
            .unwrap_err(),
        Error::PermissionDenied
    );

    // Guest on the restricted share: nothing.
    let restricted = fixture.server.registry.get("/restricted").expect("share");
    assert_eq!(
        coordinator
            .readdir(&restricted, &guest, restricted.root, 0, 0, 65536)
            .await
            .unwrap_err(),
        Error::PermissionDenied
    );
}

#[tokio::test]
async fn access_mask_reflects_effective_permission() {
    let fixture = restricted_fixture().await;
    let share = fixture.server.registry.get("/restricted").expect("share");
    let ctx = fixture.ctx("client").await;
    let coordinator = &fixture.server.coordinator;

    let granted = coordinator
        .access(&share, &ctx, ACCESS_READ | ACCESS_MODIFY)
        .await
        .expect("access query");
    assert_eq!(granted, ACCESS_READ);

    let user = fixture.server.identity.user_by_name("tester").await.expect("user");
    fixture
        .server
        .identity
        .grant_user_access(user.id, "/restricted", Permission::ReadWrite)
        .await
        .expect("grant");
    let granted = coordinator
        .access(&share, &ctx, ACCESS_READ | ACCESS_MODIFY)
        .await
        .expect("access query");
    assert_eq!(granted, ACCESS_READ | ACCESS_MODIFY);
}

#[tokio::test]
async fn kerberos_principals_authorize_like_their_user() {
    let fixture = restricted_fixture().await;
    let identity = &fixture.server.identity;
    let coordinator = &fixture.server.coordinator;
    let share = fixture.server.registry.get("/restricted").expect("share");

    identity.map_kerberos("tester@REALM", "tester").await.expect("map principal");
    let resolved = identity
        .resolve(&Principal::Kerberos("tester@REALM".into()))
        .await
        .expect("resolve kerberos");
    let ctx = OpContext::new(resolved, "krb-client");

    coordinator
        .readdir(&share, &ctx, share.root, 0, 0, 65536)
        .await
        .expect("kerberos identity reads");
}

#[tokio::test]
async fn disabled_users_cannot_resolve() {
    let fixture = Fixture::new().await;
    let identity = &fixture.server.identity;
    let user = identity.user_by_name("tester").await.expect("user");
    identity.set_user_enabled(user.id, false).await.expect("disable");
    assert_eq!(
        identity.resolve(&Principal::User("tester".into())).await,
        Err(Error::PermissionDenied)
    );
}
