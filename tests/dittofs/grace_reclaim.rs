use std::sync::Arc;
use std::time::Duration;

use super::common::Fixture;
use dittofs::error::Error;
use dittofs::locks::range::{ByteRange, LockKind, LockOrigin};
use dittofs::locks::store::{LockStore, MemoryLockStore, PersistedLock};
use dittofs::metadata::FileId;

fn survivor_lock(file: u64) -> PersistedLock {
    PersistedLock {
        file: FileId(file),
        range: ByteRange::new(0, 10),
        kind: LockKind::Exclusive,
        owner: dittofs::locks::range::LockOwner::new("client-c", 1),
        origin: LockOrigin::Nlm,
    }
}

#[tokio::test]
async fn grace_window_admits_only_reclaims_then_exits_early() {
    let store = Arc::new(MemoryLockStore::seeded(vec![survivor_lock(42)]));
    let fixture = Fixture::with_lock_store(store).await;
    let c = fixture.ctx("client-c").await;
    let d = fixture.ctx("client-d").await;
    let coordinator = &fixture.server.coordinator;
    assert!(fixture.server.locks.grace_active());

    // A non-reclaim acquisition from another owner is refused with the
    // grace status, immediately.
    let refused = coordinator
        .acquire_lock(
            &fixture.share,
            &d,
            FileId(42),
            ByteRange::new(50, 10),
            LockKind::Shared,
            1,
            LockOrigin::Nlm,
            false,
            false,
            false,
        )
        .await;
    assert_eq!(refused.unwrap_err(), Error::GracePeriodActive);

    // C reasserts its pre-restart lock.
    coordinator
        .acquire_lock(
            &fixture.share,
            &c,
            FileId(42),
            ByteRange::new(0, 10),
            LockKind::Exclusive,
            1,
            LockOrigin::Nlm,
            true,
            false,
            true,
        )
        .await
        .expect("reclaim succeeds");

    // Every persisted lock is back: the window exits early and normal
    // service resumes on disjoint ranges.
    assert!(!fixture.server.locks.grace_active());
    coordinator
        .acquire_lock(
            &fixture.share,
            &d,
            FileId(42),
            ByteRange::new(50, 10),
            LockKind::Shared,
            1,
            LockOrigin::Nlm,
            false,
            false,
            false,
        )
        .await
        .expect("non-reclaim succeeds after early exit");
}

#[tokio::test]
async fn expired_grace_purges_unreclaimed_persisted_locks() {
    let store = Arc::new(MemoryLockStore::seeded(vec![survivor_lock(7)]));
    let fixture = Fixture::with_lock_store(store.clone()).await;

    // Nobody reclaims; the 500ms test window lapses on its own.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(!fixture.server.locks.grace_active());
    assert!(store.load_all().await.expect("load").is_empty());
}

#[tokio::test]
async fn empty_lock_store_skips_the_grace_window() {
    let fixture = Fixture::new().await;
    let ctx = fixture.ctx("client").await;

    // No persisted locks: service is immediate.
    assert!(!fixture.server.locks.grace_active());
    fixture
        .server
        .coordinator
        .acquire_lock(
            &fixture.share,
            &ctx,
            FileId(1),
            ByteRange::new(0, 1),
            LockKind::Shared,
            1,
            LockOrigin::Nlm,
            false,
            false,
            false,
        )
        .await
        .expect("no grace blocking");
}

#[tokio::test]
async fn client_reboot_drops_volatile_locks_but_keeps_persisted_ones() {
    let fixture = Fixture::new().await;
    let ctx = fixture.ctx("client-x").await;
    let coordinator = &fixture.server.coordinator;

    let file = fixture.write_file("client-x", "held.bin", b"data").await;
    coordinator
        .acquire_lock(
            &fixture.share,
            &ctx,
            file,
            ByteRange::new(0, 4),
            LockKind::Exclusive,
            1,
            LockOrigin::Nlm,
            false,
            false,
            true,
        )
        .await
        .expect("persistent lock");
    coordinator
        .acquire_lock(
            &fixture.share,
            &ctx,
            file,
            ByteRange::new(10, 4),
            LockKind::Exclusive,
            2,
            LockOrigin::Nlm,
            false,
            false,
            false,
        )
        .await
        .expect("volatile lock");

    coordinator.client_rebooted("client-x").await;
    assert!(fixture.server.locks.locks_on(file).await.is_empty());

    // The persisted lock is reclaimable even though the global grace
    // window is closed.
    coordinator
        .acquire_lock(
            &fixture.share,
            &ctx,
            file,
            ByteRange::new(0, 4),
            LockKind::Exclusive,
            1,
            LockOrigin::Nlm,
            true,
            false,
            true,
        )
        .await
        .expect("per-client reclaim after reboot");
}
