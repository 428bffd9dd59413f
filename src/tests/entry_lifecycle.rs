use std::sync::Arc;

use super::utils::{TestCache, PAGE};
use crate::cache::lists::ListTag;
use crate::vfs::IoType;

#[test]
fn test_create_then_lookup() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 1 << 20);

    let created = rig.cache_page(&file, 0, b"hello");
    assert_eq!(created.offset(), 0);
    assert!(!created.is_dirty());

    let found = rig.cache.lookup(&file, 0).expect("entry should be cached");
    assert_eq!(found.phys(), created.phys());
    assert!(rig.cache.lookup(&file, PAGE as u64).is_none());

    let statistics = rig.cache.statistics();
    assert_eq!(statistics.entry_count, 1);
    assert_eq!(statistics.physical_pages, 1);
    assert_eq!(statistics.dirty_pages, 0);
}

#[test]
fn test_create_or_lookup_dedups() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 1 << 20);

    let phys = rig.mm.allocate_frame();
    let (first, created) = rig.cache.create_or_lookup(&file, None, phys, 0, None);
    assert!(created);

    // The racing insert loses and receives the existing entry.
    let other_phys = rig.mm.allocate_frame();
    let (second, created) = rig.cache.create_or_lookup(&file, None, other_phys, 0, None);
    assert!(!created);
    assert_eq!(second.phys(), first.phys());
    assert_eq!(rig.cache.statistics().entry_count, 1);
}

#[cfg(not(miri))]
#[test]
fn test_concurrent_create_or_lookup_creates_once() {
    let rig = Arc::new(TestCache::new(1000));
    let file = rig.file(1, IoType::RegularFile, 1 << 20);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let rig = rig.clone();
        let file = file.clone();
        handles.push(std::thread::spawn(move || {
            let phys = rig.mm.allocate_frame();
            let (entry, created) = rig.cache.create_or_lookup(&file, None, phys, 0, None);
            (entry.phys(), created)
        }));
    }

    let results: Vec<(u64, bool)> =
        handles.into_iter().map(|handle| handle.join().unwrap()).collect();

    let created_count = results.iter().filter(|(_, created)| *created).count();
    assert_eq!(created_count, 1);
    assert_eq!(rig.cache.statistics().entry_count, 1);

    let winner = results.iter().find(|(_, created)| *created).unwrap().0;
    assert!(results.iter().all(|(phys, _)| *phys == winner));
}

#[test]
fn test_released_entry_returns_to_clean_lru() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 1 << 20);

    let entry = rig.cache_page(&file, 0, b"");
    let raw = entry.entry().clone();
    assert_eq!(raw.list_tag(), ListTag::Clean);
    assert_eq!(raw.refcount(), 1);

    drop(entry);
    assert_eq!(raw.refcount(), 0);
    assert_eq!(raw.list_tag(), ListTag::Clean);
}

#[test]
fn test_set_va_attaches_once() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 1 << 20);
    let entry = rig.cache_page(&file, 0, b"");

    assert_eq!(entry.va(), None);
    assert!(rig.cache.set_entry_va(&entry, 0xffff_9000_0000_0000));
    assert_eq!(entry.va(), Some(0xffff_9000_0000_0000));
    assert_eq!(rig.cache.statistics().entry_count, 1);

    // A second attach loses; the address is already set.
    assert!(!rig.cache.set_entry_va(&entry, 0xffff_9000_0000_1000));
    assert_eq!(entry.va(), Some(0xffff_9000_0000_0000));
}

#[test]
fn test_set_va_respects_disable_switch() {
    let rig = TestCache::with_config(
        1000,
        crate::CacheConfig {
            disable_worker: true,
            disable_virtual_addresses: true,
            ..crate::CacheConfig::default()
        },
    );
    let file = rig.file(1, IoType::RegularFile, 1 << 20);
    let entry = rig.cache_page(&file, 0, b"");

    assert!(!rig.cache.set_entry_va(&entry, 0xffff_9000_0000_0000));
    assert_eq!(entry.va(), None);
}

#[test]
fn test_get_va_adopts_backing_address() {
    let rig = TestCache::new(1000);
    let device = rig.file(1, IoType::BlockDevice, 1 << 20);
    let file = rig.file(2, IoType::RegularFile, 1 << 20);

    let device_entry = rig.cache_page(&device, 0, b"");
    let (file_entry, created) =
        rig.cache
            .create_or_lookup(&file, None, device_entry.phys(), 0, Some(&device_entry));
    assert!(created);

    assert!(rig.cache.set_entry_va(&file_entry, 0xffff_9000_0000_0000));
    // The attach lands on the owner; the file entry adopts it lazily.
    assert_eq!(device_entry.va(), Some(0xffff_9000_0000_0000));
    assert_eq!(file_entry.get_va(), Some(0xffff_9000_0000_0000));
}

#[test]
fn test_io_buffer_cache_backed() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 1 << 20);

    let first = rig.cache_page(&file, 0, b"");
    let second = rig.cache_page(&file, PAGE as u64, b"");

    let mut buffer = crate::IoBuffer::new(PAGE);
    buffer.append_entry(&first);
    buffer.append_entry(&second);
    assert!(rig.cache.is_io_buffer_cache_backed(&file, &buffer, 0, 2 * PAGE));

    // Offset disagreement breaks the backing.
    assert!(!rig
        .cache
        .is_io_buffer_cache_backed(&file, &buffer, PAGE as u64, PAGE));

    // A raw frame is not cache backed.
    let mut raw = crate::IoBuffer::new(PAGE);
    raw.append_frame(rig.mm.allocate_frame(), None);
    assert!(!rig.cache.is_io_buffer_cache_backed(&file, &raw, 0, PAGE));
}

#[test]
fn test_copy_and_cache_io_buffer_shares_pages() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 1 << 20);

    // A read buffer of three raw frames, fresh from the device.
    let mut source = crate::IoBuffer::new(PAGE);
    for fill in [b'a', b'b', b'c'] {
        let phys = rig.mm.allocate_frame();
        rig.mm.write_frame(phys, 0, &[fill; 8]);
        source.append_frame(phys, None);
    }

    let mut destination = crate::IoBuffer::new(PAGE);
    let copied = rig.cache.copy_and_cache_io_buffer(
        &file,
        0,
        &mut destination,
        2 * PAGE,
        &mut source,
        3 * PAGE,
        PAGE,
    );

    // Pages [1, 3) of the source landed in the destination, and all three
    // got cached for the file.
    assert_eq!(copied, 2 * PAGE);
    assert_eq!(destination.page_count(), 2);
    assert_eq!(rig.cache.statistics().entry_count, 3);
    assert_eq!(destination.phys_at(0), source.phys_at(1));
    assert!(rig
        .cache
        .is_io_buffer_cache_backed(&file, &destination, PAGE as u64, 2 * PAGE));

    // The source buffer now holds the new entries so it cannot free the
    // frames out from under the cache.
    for index in 0..3 {
        assert!(source.entry_at(index).is_some());
    }
}
