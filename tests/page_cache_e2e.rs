use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use page_cache::{
    CacheConfig,
    EvictMode,
    FileObject,
    FlushFlags,
    FlushPage,
    IoType,
    PageCache,
    PageWriter,
    SyntheticMemory,
};

const PAGE: usize = 4096;

/// A device writer that persists pages into its own backing store, reading
/// content out of the synthetic memory frames.
struct BackingStore {
    mm: Arc<SyntheticMemory>,
    blocks: Mutex<Vec<u8>>,
}

impl BackingStore {
    fn new(mm: Arc<SyntheticMemory>, size: usize) -> Arc<Self> {
        Arc::new(Self {
            mm,
            blocks: Mutex::new(vec![0; size]),
        })
    }

    fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        self.blocks.lock()[offset..offset + len].to_vec()
    }
}

impl PageWriter for BackingStore {
    fn write_pages(
        &self,
        _file: &FileObject,
        offset: u64,
        pages: &[FlushPage],
        len: usize,
        _synchronized: bool,
    ) -> io::Result<usize> {
        let mut blocks = self.blocks.lock();
        let mut written = 0;
        for page in pages {
            let frame = self.mm.frame_bytes(page.phys);
            let take = usize::min(PAGE, len - written);
            let start = offset as usize + written;
            blocks[start..start + take].copy_from_slice(&frame[..take]);
            written += take;
            if written == len {
                break;
            }
        }
        Ok(written)
    }

    fn synchronize_device(&self, _file: &FileObject) -> io::Result<()> {
        Ok(())
    }
}

struct Harness {
    cache: PageCache,
    mm: Arc<SyntheticMemory>,
    store: Arc<BackingStore>,
}

fn harness(config: CacheConfig) -> Harness {
    let mm = Arc::new(SyntheticMemory::new(PAGE, 1000));
    let store = BackingStore::new(mm.clone(), 1 << 20);
    let cache = PageCache::new(mm.clone(), config).expect("create page cache");
    Harness { cache, mm, store }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_e2e_write_flush_read_back() {
    let rig = harness(CacheConfig {
        disable_worker: true,
        ..CacheConfig::default()
    });
    let file = FileObject::new(1, IoType::RegularFile, 1 << 20, rig.store.clone());

    // Cache two pages, write into them, and dirty them.
    for (index, fill) in [(0u64, b'A'), (1, b'B')] {
        let phys = rig.mm.allocate_frame();
        rig.mm.write_frame(phys, 0, &[fill; 16]);
        let (entry, created) =
            rig.cache
                .create_or_lookup(&file, None, phys, index * PAGE as u64, None);
        assert!(created);
        assert!(rig.cache.mark_entry_dirty(&entry));
    }
    assert!(file.has_dirty_data());

    rig.cache
        .flush(&file, 0, None, FlushFlags::default(), None)
        .expect("flush should succeed");

    // The data reached the store, bytes for bytes, as one coalesced write.
    assert_eq!(&rig.store.read(0, 16), &[b'A'; 16]);
    assert_eq!(&rig.store.read(PAGE, 16), &[b'B'; 16]);
    assert!(!file.has_dirty_data());
    assert_eq!(rig.cache.statistics().dirty_pages, 0);
}

#[test]
fn test_e2e_worker_cleans_in_background() {
    let rig = harness(CacheConfig {
        disable_worker: false,
        clean_delay_ms: 20,
        ..CacheConfig::default()
    });
    let file = FileObject::new(1, IoType::RegularFile, 1 << 20, rig.store.clone());

    let phys = rig.mm.allocate_frame();
    rig.mm.write_frame(phys, 0, b"background");
    let (entry, _) = rig.cache.create_or_lookup(&file, None, phys, 0, None);
    assert!(rig.cache.mark_entry_dirty(&entry));

    let cleaned = wait_until(Duration::from_secs(5), || !file.has_dirty_data());
    assert!(cleaned, "worker never flushed the file");
    assert_eq!(&rig.store.read(0, 10), b"background");
}

#[test]
fn test_e2e_truncate_then_trim() {
    let rig = harness(CacheConfig {
        disable_worker: true,
        ..CacheConfig::default()
    });
    let file = FileObject::new(1, IoType::RegularFile, 1 << 20, rig.store.clone());

    for index in 0..200u64 {
        let phys = rig.mm.allocate_frame();
        rig.cache
            .create_or_lookup(&file, None, phys, index * PAGE as u64, None);
    }
    assert_eq!(rig.cache.statistics().entry_count, 200);

    // Truncate away the tail, then squeeze the rest under memory pressure.
    file.set_size(100 * PAGE as u64);
    rig.cache.evict(&file, 100 * PAGE as u64, EvictMode::Truncate);
    assert_eq!(rig.cache.statistics().entry_count, 100);

    rig.mm.set_free_physical_pages(50);
    rig.cache.trim(false);

    let statistics = rig.cache.statistics();
    assert_eq!(statistics.physical_pages, 70);
    assert!(rig.cache.lookup(&file, 99 * PAGE as u64).is_some());
}

#[test]
fn test_e2e_device_and_file_share_a_frame() {
    let rig = harness(CacheConfig {
        disable_worker: true,
        ..CacheConfig::default()
    });
    let device = FileObject::new(1, IoType::BlockDevice, 1 << 20, rig.store.clone());
    let file = FileObject::new(2, IoType::RegularFile, 1 << 20, rig.store.clone());

    let phys = rig.mm.allocate_frame();
    rig.mm.write_frame(phys, 0, b"shared frame");
    let (device_entry, _) = rig.cache.create_or_lookup(&device, None, phys, 0, None);
    let (file_entry, _) =
        rig.cache
            .create_or_lookup(&file, None, phys, 8 * PAGE as u64, Some(&device_entry));

    // One frame backs both layers; writes through the file dirty the
    // device layer, and the device flush carries them to the store.
    assert_eq!(rig.cache.statistics().physical_pages, 1);
    assert!(rig.cache.mark_entry_dirty(&file_entry));
    assert!(device_entry.is_dirty());

    rig.cache
        .flush(&device, 0, None, FlushFlags::default(), None)
        .expect("flush should succeed");
    assert_eq!(&rig.store.read(0, 12), b"shared frame");
    assert!(!device_entry.is_dirty());
}
