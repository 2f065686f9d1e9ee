use std::time::Duration;

use super::common::Fixture;
use dittofs::error::Error;
use dittofs::locks::delegation::{LeaseState, Scope};
use dittofs::locks::range::{ByteRange, LockKind, LockOrigin};

#[tokio::test]
async fn nlm_lock_breaks_smb_lease_and_wins_after_ack() {
    let fixture = Fixture::new().await;
    let smb = fixture.ctx("smb-a").await;
    let nfs = fixture.ctx("nfs-b").await;
    let coordinator = fixture.server.coordinator.clone();

    let file = fixture.write_file("smb-a", "y.bin", b"old").await;
    let opened = coordinator
        .open(
            &fixture.share,
            &smb,
            file,
            true,
            Some(Scope::Lease(LeaseState::read_write())),
        )
        .await
        .expect("smb open with lease");
    let lease = opened.delegation.expect("rw lease granted");

    // The lease holder acknowledges the break by returning the lease.
    let recalls = fixture.server.locks.subscribe_recalls();
    let acker = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let event = recalls.recv().await.expect("break event");
            assert_eq!(event.delegation, lease);
            coordinator.return_delegation(event.delegation).await.expect("ack break");
        })
    };

    let lock = coordinator
        .acquire_lock(
            &fixture.share,
            &nfs,
            file,
            ByteRange::new(0, 1),
            LockKind::Exclusive,
            1,
            LockOrigin::Nlm,
            false,
            false,
            false,
        )
        .await
        .expect("nlm lock wins after lease break");
    acker.await.expect("acker joins");

    // B writes under its lock and commits; A's next read observes it.
    let handle = fixture.open_write("nfs-b", file).await;
    coordinator.write(handle, 0, b"Z").await.expect("write under lock");
    coordinator.commit(handle, 0, 1).await.expect("commit");
    coordinator.close(handle).await.expect("close");

    let (bytes, _) = coordinator.read(opened.handle, 0, 1).await.expect("smb re-read");
    assert_eq!(bytes, b"Z");

    coordinator.release_lock(lock).await.expect("release");
    coordinator.close(opened.handle).await.expect("close smb handle");
}

#[tokio::test]
async fn unanswered_lease_break_is_revoked_within_the_timeout() {
    let fixture = Fixture::new().await;
    let smb = fixture.ctx("smb-a").await;
    let nfs = fixture.ctx("nfs-b").await;
    let coordinator = &fixture.server.coordinator;

    let file = fixture.write_file("smb-a", "y.bin", b"data").await;
    let opened = coordinator
        .open(
            &fixture.share,
            &smb,
            file,
            true,
            Some(Scope::Lease(LeaseState::read_write())),
        )
        .await
        .expect("smb open with lease");
    let lease = opened.delegation.expect("lease granted");

    let started = std::time::Instant::now();
    coordinator
        .acquire_lock(
            &fixture.share,
            &nfs,
            file,
            ByteRange::new(0, 1),
            LockKind::Exclusive,
            1,
            LockOrigin::Nlm,
            false,
            false,
            false,
        )
        .await
        .expect("lock granted after revoke");
    // Break timeout is 200ms under the test config.
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(fixture.server.locks.delegations_on(file).await.is_empty());
    assert_eq!(
        coordinator.return_delegation(lease).await.unwrap_err(),
        Error::DelegationRevoked
    );
    coordinator.close(opened.handle).await.expect("close");
}

#[tokio::test]
async fn smb_write_lease_is_refused_while_nlm_lock_exists() {
    let fixture = Fixture::new().await;
    let nfs = fixture.ctx("nfs-a").await;
    let smb = fixture.ctx("smb-b").await;
    let coordinator = &fixture.server.coordinator;

    let file = fixture.write_file("nfs-a", "locked.bin", b"data").await;
    coordinator
        .acquire_lock(
            &fixture.share,
            &nfs,
            file,
            ByteRange::to_eof(0),
            LockKind::Shared,
            7,
            LockOrigin::Nlm,
            false,
            false,
            false,
        )
        .await
        .expect("nlm shared lock");

    // The write lease is refused, but the open itself succeeds
    // without one.
    let opened = coordinator
        .open(
            &fixture.share,
            &smb,
            file,
            true,
            Some(Scope::Lease(LeaseState::read_write())),
        )
        .await
        .expect("open without lease");
    assert_eq!(opened.delegation, None);
    coordinator.close(opened.handle).await.expect("close");
}

#[tokio::test]
async fn smb_byte_range_locks_share_nlm_conflict_rules() {
    let fixture = Fixture::new().await;
    let nfs = fixture.ctx("nfs-a").await;
    let smb = fixture.ctx("smb-b").await;
    let coordinator = &fixture.server.coordinator;

    let file = fixture.write_file("nfs-a", "shared.bin", b"data").await;
    coordinator
        .acquire_lock(
            &fixture.share,
            &nfs,
            file,
            ByteRange::new(0, 4),
            LockKind::Exclusive,
            1,
            LockOrigin::Nlm,
            false,
            false,
            false,
        )
        .await
        .expect("nlm exclusive");

    let denied = coordinator
        .acquire_lock(
            &fixture.share,
            &smb,
            file,
            ByteRange::new(2, 4),
            LockKind::Exclusive,
            9,
            LockOrigin::Smb,
            false,
            false,
            false,
        )
        .await;
    assert_eq!(denied.unwrap_err(), Error::LockConflict);

    // A disjoint SMB lock is fine.
    coordinator
        .acquire_lock(
            &fixture.share,
            &smb,
            file,
            ByteRange::new(100, 4),
            LockKind::Exclusive,
            9,
            LockOrigin::Smb,
            false,
            false,
            false,
        )
        .await
        .expect("disjoint smb lock");
}

#[tokio::test]
async fn open_for_write_recalls_a_foreign_write_delegation() {
    let fixture = Fixture::new().await;
    let holder = fixture.ctx("nfs-holder").await;
    let intruder = fixture.ctx("smb-intruder").await;
    let coordinator = &fixture.server.coordinator;

    let file = fixture.write_file("nfs-holder", "delegated.bin", b"data").await;
    let delegation = coordinator
        .request_delegation(
            &fixture.share,
            &holder,
            file,
            Scope::Write,
            dittofs::locks::delegation::LeaseOrigin::Nfsv4,
        )
        .await
        .expect("write delegation");

    // No ack: the recall times out and the delegation is revoked, so
    // the open proceeds.
    let opened = coordinator
        .open(&fixture.share, &intruder, file, true, None)
        .await
        .expect("open proceeds after revoke");
    assert!(fixture.server.locks.delegations_on(file).await.is_empty());
    assert_eq!(
        coordinator.return_delegation(delegation).await.unwrap_err(),
        Error::DelegationRevoked
    );
    coordinator.close(opened.handle).await.expect("close");
}
