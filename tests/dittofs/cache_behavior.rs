use std::time::Duration;

use super::common::Fixture;
use dittofs::cache::slice::SliceState;
use dittofs::content::ContentStore;
use dittofs::metadata::MetadataStore;

const HALF_MIB: usize = 512 * 1024;

fn payload(tag: u8) -> Vec<u8> {
    (0..HALF_MIB).map(|index| tag.wrapping_add(index as u8)).collect()
}

#[tokio::test]
async fn eviction_stays_under_budget_and_rereads_are_identical() {
    // The test config budget is 1 MiB; three committed 512 KiB files
    // cannot all stay resident.
    let fixture = Fixture::new().await;
    let cache = &fixture.share.cache;

    let first = fixture.write_file("client", "a.bin", &payload(1)).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = fixture.write_file("client", "b.bin", &payload(2)).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let third = fixture.write_file("client", "c.bin", &payload(3)).await;

    assert!(cache.total_size() <= cache.byte_budget());

    // The oldest file's bytes were evicted, not merely dropped.
    let states = cache.slice_states(first).await;
    assert!(!states.is_empty());
    assert!(states.iter().all(|(_, _, state)| *state == SliceState::Evicted));

    // A re-read refills from the content store, byte-identical.
    let bytes = fixture.read_file("client", first).await;
    assert_eq!(bytes, payload(1));
    let bytes = fixture.read_file("client", second).await;
    assert_eq!(bytes, payload(2));
    let bytes = fixture.read_file("client", third).await;
    assert_eq!(bytes, payload(3));
}

#[tokio::test]
async fn background_flusher_drains_idle_dirty_files() {
    let fixture = Fixture::new().await;
    let file = fixture.write_file("client", "seed.bin", b"seed").await;

    // Dirty the file and leave it idle; the share's flusher sweeps it
    // without an explicit commit (50ms interval, 100ms idle timeout).
    let handle = fixture.open_write("client", file).await;
    fixture.server.coordinator.write(handle, 0, b"SEED").await.expect("write");
    assert!(fixture.share.cache.dirty_size() > 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fixture.share.cache.dirty_size(), 0);

    let entry = fixture.share.metadata.read_entry(file).await.expect("entry");
    let content = entry.content.expect("content handle");
    let stored = fixture.share.content.read(content, 0, 4).await.expect("store read");
    assert_eq!(stored, b"SEED");
    fixture.server.coordinator.close(handle).await.expect("close");
}

#[tokio::test]
async fn set_size_shrinks_and_zero_extends() {
    let fixture = Fixture::new().await;
    let file = fixture.write_file("client", "sized.bin", b"abcdefgh").await;
    let coordinator = &fixture.server.coordinator;

    let handle = fixture.open_write("client", file).await;
    coordinator.set_size(handle, 3).await.expect("shrink");
    assert_eq!(coordinator.size(handle).await.expect("size"), 3);
    let (bytes, eof) = coordinator.read(handle, 0, 16).await.expect("read shrunk");
    assert_eq!(bytes, b"abc");
    assert!(eof);

    coordinator.set_size(handle, 6).await.expect("extend");
    let (bytes, eof) = coordinator.read(handle, 0, 16).await.expect("read extended");
    assert_eq!(bytes, b"abc\0\0\0");
    assert!(eof);
    coordinator.close(handle).await.expect("close");
}

#[tokio::test]
async fn reads_past_end_of_file_report_eof() {
    let fixture = Fixture::new().await;
    let file = fixture.write_file("client", "short.bin", b"1234").await;
    let handle = fixture.open_write("client", file).await;
    let coordinator = &fixture.server.coordinator;

    let (bytes, eof) = coordinator.read(handle, 2, 100).await.expect("clipped read");
    assert_eq!(bytes, b"34");
    assert!(eof);

    let (bytes, eof) = coordinator.read(handle, 50, 10).await.expect("read past end");
    assert!(bytes.is_empty());
    assert!(eof);
    coordinator.close(handle).await.expect("close");
}

#[tokio::test]
async fn write_visibility_is_program_order_on_one_handle() {
    let fixture = Fixture::new().await;
    let file = fixture.write_file("client", "order.bin", b"........").await;
    let handle = fixture.open_write("client", file).await;
    let coordinator = &fixture.server.coordinator;

    coordinator.write(handle, 0, b"AAAA").await.expect("first write");
    coordinator.write(handle, 2, b"BBBB").await.expect("overlapping write");
    let (bytes, _) = coordinator.read(handle, 0, 8).await.expect("read back");
    assert_eq!(bytes, b"AABBBB..");
    coordinator.close(handle).await.expect("close");
}
