use super::utils::{TestCache, WriterFailure, PAGE};
use crate::vfs::IoType;
use crate::{CacheError, FlushFlags};

#[test]
fn test_single_page_write_flush() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, PAGE as u64);

    let entry = rig.cache_page(&file, 0, b"ABCD");
    assert!(rig.cache.mark_entry_dirty(&entry));
    assert!(file.has_dirty_data());
    assert_eq!(rig.cache.statistics().dirty_pages, 1);
    rig.cache.inner().check_file_dirty_list(&file);

    rig.cache
        .flush(&file, 0, None, FlushFlags::default(), None)
        .expect("flush should succeed");

    let writes = rig.writer.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].offset, 0);
    assert_eq!(writes[0].len, PAGE);
    assert_eq!(&writes[0].bytes[..4], b"ABCD");

    assert!(!entry.is_dirty());
    assert!(!file.has_dirty_data());
    assert_eq!(rig.cache.statistics().dirty_pages, 0);
}

#[test]
fn test_mark_dirty_reports_transition_once() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 1 << 20);
    let entry = rig.cache_page(&file, 0, b"");

    assert!(rig.cache.mark_entry_dirty(&entry));
    assert!(!rig.cache.mark_entry_dirty(&entry));

    // The first clean wins the write token; the second flusher backs off.
    assert!(rig.cache.mark_entry_clean(&entry, true));
    assert!(!rig.cache.mark_entry_clean(&entry, true));
    assert_eq!(rig.cache.statistics().dirty_pages, 0);
}

#[test]
fn test_flush_coalesces_across_clean_streak() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 16 * PAGE as u64);

    // Pages 0..4 cached with page 1 clean, plus a lone page at 7.
    let mut entries = Vec::new();
    for index in [0u64, 1, 2, 3, 7] {
        let fill = [b'0' + index as u8; 4];
        entries.push((index, rig.cache_page(&file, index * PAGE as u64, &fill)));
    }
    for (index, entry) in &entries {
        if *index != 1 {
            assert!(rig.cache.mark_entry_dirty(entry));
        }
    }

    rig.cache
        .flush(&file, 0, None, FlushFlags::default(), None)
        .expect("flush should succeed");

    // One big write spans the clean page at 1; the gap to page 7 is not
    // bridged.
    let writes = rig.writer.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].offset, 0);
    assert_eq!(writes[0].len, 4 * PAGE);
    assert_eq!(&writes[0].bytes[PAGE..PAGE + 4], b"1111");
    assert_eq!(writes[1].offset, 7 * PAGE as u64);
    assert_eq!(writes[1].len, PAGE);

    for (_, entry) in &entries {
        assert!(!entry.is_dirty());
    }
    assert_eq!(rig.cache.statistics().dirty_pages, 0);
}

#[test]
fn test_ranged_flush_leaves_outside_pages_dirty() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 16 * PAGE as u64);

    let inside = rig.cache_page(&file, 0, b"in");
    let outside = rig.cache_page(&file, 8 * PAGE as u64, b"out");
    assert!(rig.cache.mark_entry_dirty(&inside));
    assert!(rig.cache.mark_entry_dirty(&outside));

    rig.cache
        .flush(&file, 0, Some(PAGE as u64), FlushFlags::default(), None)
        .expect("flush should succeed");

    assert!(!inside.is_dirty());
    assert!(outside.is_dirty());
    assert_eq!(rig.writer.writes().len(), 1);
    rig.cache.inner().check_file_dirty_list(&file);
}

#[test]
fn test_flush_respects_page_cap() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 16 * PAGE as u64);

    let first = rig.cache_page(&file, 0, b"");
    let second = rig.cache_page(&file, 8 * PAGE as u64, b"");
    assert!(rig.cache.mark_entry_dirty(&first));
    assert!(rig.cache.mark_entry_dirty(&second));

    rig.cache
        .flush(&file, 0, None, FlushFlags::default(), Some(1))
        .expect("flush should succeed");

    assert_eq!(rig.writer.writes().len(), 1);
    assert_eq!(rig.cache.statistics().dirty_pages, 1);
    assert!(!first.is_dirty());
    assert!(second.is_dirty());
}

#[test]
fn test_failed_write_re_dirties_pages() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 16 * PAGE as u64);

    let entry = rig.cache_page(&file, 0, b"");
    assert!(rig.cache.mark_entry_dirty(&entry));

    // The flush loop re-discovers re-dirtied pages within one call, so the
    // writer has to keep refusing for the dirt to survive the flush.
    rig.writer.fail_next(WriterFailure::Error);
    rig.writer.fail_next(WriterFailure::Error);
    let result = rig.cache.flush(&file, 0, None, FlushFlags::default(), None);
    assert!(matches!(result, Err(CacheError::Io(_))));

    // The page and the file are dirty again for the worker to retry.
    assert!(entry.is_dirty());
    assert!(file.has_dirty_data());
    assert_eq!(rig.cache.statistics().dirty_pages, 1);
    assert!(rig.writer.writes().is_empty());
    rig.cache.inner().check_file_dirty_list(&file);

    rig.cache
        .flush(&file, 0, None, FlushFlags::default(), None)
        .expect("retry should succeed");
    assert!(!entry.is_dirty());
    assert_eq!(rig.writer.writes().len(), 1);
}

#[test]
fn test_transient_write_failure_is_reported_but_retried() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 16 * PAGE as u64);

    let entry = rig.cache_page(&file, 0, b"");
    assert!(rig.cache.mark_entry_dirty(&entry));

    // One refusal: the loop re-dirties the page, picks it back up, and the
    // retry within the same call lands. The first error still surfaces.
    rig.writer.fail_next(WriterFailure::Error);
    let result = rig.cache.flush(&file, 0, None, FlushFlags::default(), None);
    assert!(matches!(result, Err(CacheError::Io(_))));

    assert!(!entry.is_dirty());
    assert_eq!(rig.cache.statistics().dirty_pages, 0);
    assert_eq!(rig.writer.writes().len(), 1);
    // The failure marked the file dirty; the worker gets to confirm.
    assert!(file.has_dirty_data());
}

#[test]
fn test_short_write_re_dirties_the_tail() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 16 * PAGE as u64);

    let first = rig.cache_page(&file, 0, b"");
    let second = rig.cache_page(&file, PAGE as u64, b"");
    assert!(rig.cache.mark_entry_dirty(&first));
    assert!(rig.cache.mark_entry_dirty(&second));

    // The writer completes one page and stalls on the second, twice, so
    // the in-call retry cannot mask the re-dirtying of the tail.
    rig.writer.fail_next(WriterFailure::Short(PAGE));
    rig.writer.fail_next(WriterFailure::Short(PAGE));
    let result = rig.cache.flush(&file, 0, None, FlushFlags::default(), None);
    assert!(matches!(
        result,
        Err(CacheError::DataLengthMismatch {
            written,
            expected,
        }) if written == PAGE && expected == 2 * PAGE,
    ));

    assert!(!first.is_dirty());
    assert!(second.is_dirty());
    assert!(file.has_dirty_data());
    rig.cache.inner().check_file_dirty_list(&file);
}

#[test]
fn test_flush_clamps_to_file_size() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, PAGE as u64 + 100);

    let first = rig.cache_page(&file, 0, b"");
    let second = rig.cache_page(&file, PAGE as u64, b"");
    assert!(rig.cache.mark_entry_dirty(&first));
    assert!(rig.cache.mark_entry_dirty(&second));

    rig.cache
        .flush(&file, 0, None, FlushFlags::default(), None)
        .expect("flush should succeed");

    let writes = rig.writer.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].len, PAGE + 100);
}

#[test]
fn test_block_device_flush_issues_sync() {
    let rig = TestCache::new(1000);
    let device = rig.file(1, IoType::BlockDevice, 1 << 20);

    let entry = rig.cache_page(&device, 0, b"");
    assert!(rig.cache.mark_entry_dirty(&entry));

    rig.cache
        .flush(&device, 0, None, FlushFlags::default(), None)
        .expect("flush should succeed");
    assert_eq!(rig.writer.sync_count(), 1);

    // A synchronized flush owns its own durability; no extra sync.
    assert!(rig.cache.mark_entry_dirty(&entry));
    rig.cache
        .flush(&device, 0, None, FlushFlags::synchronized(), None)
        .expect("flush should succeed");
    assert_eq!(rig.writer.sync_count(), 1);
}

#[test]
fn test_flush_skips_clean_file() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 1 << 20);

    let _entry = rig.cache_page(&file, 0, b"");
    rig.cache
        .flush(&file, 0, None, FlushFlags::default(), None)
        .expect("flush should succeed");
    assert!(rig.writer.writes().is_empty());
}

#[test]
fn test_too_dirty_after_heavy_writes() {
    let rig = TestCache::new(1000);
    let file = rig.file(1, IoType::RegularFile, 1 << 30);
    assert!(!rig.cache.is_too_dirty());

    let mut entries = Vec::new();
    for index in 0..500u64 {
        let entry = rig.cache_page(&file, index * PAGE as u64, b"");
        assert!(rig.cache.mark_entry_dirty(&entry));
        entries.push(entry);
    }

    rig.mm.set_free_physical_pages(50);
    assert!(rig.cache.is_too_dirty());
}
