mod dirty;
mod entry;
mod evict;
mod flags;
mod flush;
mod link;
pub(crate) mod lists;
mod lookup;
mod trim;
mod worker;

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::Mutex;

pub use self::entry::{EntryRef, PageCacheEntry};
pub use self::evict::EvictMode;
pub use self::flush::FlushFlags;
use self::flags::ENTRY_MAPPED;
use self::lists::{GlobalLists, ListTag};
use self::worker::{CacheWorker, WorkerSignal, STATE_CLEAN};
use crate::buffer::IoBuffer;
use crate::config::{CacheConfig, Thresholds, MAX_DIRTY_SHIFT};
use crate::error::CacheError;
use crate::mm::{MemoryProvider, VirtualWarningLevel};
use crate::vfs::FileObject;

#[derive(Debug, Clone, PartialEq, Eq)]
/// A point-in-time snapshot of cache accounting.
pub struct CacheStatistics {
    /// Entries currently present in file trees.
    pub entry_count: usize,
    /// Free physical pages at which eviction starts.
    pub headroom_pages_trigger: usize,
    /// Free physical pages eviction shoots for.
    pub headroom_pages_retreat: usize,
    /// Cache size below which paging out is requested.
    pub minimum_pages_target: usize,
    /// Physical pages owned by the cache.
    pub physical_pages: usize,
    /// Dirty pages awaiting writeback.
    pub dirty_pages: usize,
    /// When the last cleaning pass started, measured from cache creation.
    pub last_clean_time: Duration,
}

/// The unified page cache.
///
/// One instance holds all of the cache's global state: the per-file trees
/// hang off [FileObject]s, while the LRU lists, counters, thresholds, and the
/// background worker live here. Memory management is consumed through the
/// injected [MemoryProvider].
pub struct PageCache {
    inner: Arc<CacheInner>,
    worker: Option<JoinHandle<()>>,
}

impl PageCache {
    /// Create a page cache over the given memory provider and spawn its
    /// background worker.
    pub fn new(
        mm: Arc<dyn MemoryProvider>,
        config: CacheConfig,
    ) -> Result<Self, CacheError> {
        let thresholds = Thresholds::compute(&*mm, &config);
        debug_assert!(thresholds.headroom_pages_retreat > 0);
        debug_assert!(thresholds.headroom_pages_trigger > 0);

        let (worker_tx, worker_rx) = crossbeam_channel::unbounded();
        let page_size = mm.page_size();
        let page_shift = mm.page_shift();
        let inner = Arc::new(CacheInner {
            mm,
            config: config.clone(),
            thresholds,
            page_size,
            page_shift,
            lists: Mutex::new(GlobalLists::default()),
            dirty_files: Mutex::new(Vec::new()),
            entry_count: AtomicUsize::new(0),
            physical_pages: AtomicUsize::new(0),
            dirty_pages: AtomicUsize::new(0),
            mapped_pages: AtomicUsize::new(0),
            mapped_dirty_pages: AtomicUsize::new(0),
            worker_state: AtomicU32::new(STATE_CLEAN),
            worker_tx,
            worker_thread: OnceLock::new(),
            created_at: Instant::now(),
            last_clean_millis: AtomicU64::new(0),
        });

        let worker = if config.disable_worker {
            None
        } else {
            let handle = CacheWorker::spawn(&inner, worker_rx)
                .map_err(|_| CacheError::InsufficientResources)?;
            Some(handle)
        };

        Ok(Self { inner, worker })
    }

    #[inline]
    /// The size of the data cached by each entry.
    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Search for the entry caching `offset` of the given file, taking a
    /// reference on it and refreshing its LRU position.
    pub fn lookup(&self, file: &Arc<FileObject>, offset: u64) -> Option<EntryRef> {
        let entry = self.inner.lookup(file, offset)?;
        Some(EntryRef::adopt(self.inner.clone(), entry))
    }

    /// Insert a new entry for `(file, offset)` or return the existing one.
    ///
    /// Returns the entry and whether this call created it. `link` shares the
    /// physical frame with an entry of the other cacheable kind.
    pub fn create_or_lookup(
        &self,
        file: &Arc<FileObject>,
        va: Option<usize>,
        phys: u64,
        offset: u64,
        link: Option<&EntryRef>,
    ) -> (EntryRef, bool) {
        let (entry, created) =
            self.inner
                .create_or_lookup(file, va, phys, offset, link.map(EntryRef::entry));
        (EntryRef::adopt(self.inner.clone(), entry), created)
    }

    /// Insert a new entry the caller knows to be unique for `(file, offset)`.
    pub fn create_and_insert(
        &self,
        file: &Arc<FileObject>,
        va: Option<usize>,
        phys: u64,
        offset: u64,
        link: Option<&EntryRef>,
    ) -> EntryRef {
        let entry =
            self.inner
                .create_and_insert(file, va, phys, offset, link.map(EntryRef::entry));
        EntryRef::adopt(self.inner.clone(), entry)
    }

    /// Cache every page of `src` for the given file and share up to
    /// `copy_size` bytes of them into `dst`, starting at `source_copy_offset`
    /// within the source. Returns the number of bytes shared into `dst`.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_and_cache_io_buffer(
        &self,
        file: &Arc<FileObject>,
        file_offset: u64,
        dst: &mut IoBuffer,
        copy_size: usize,
        src: &mut IoBuffer,
        source_size: usize,
        source_copy_offset: usize,
    ) -> usize {
        self.inner.copy_and_cache_io_buffer(
            file,
            file_offset,
            dst,
            copy_size,
            src,
            source_size,
            source_copy_offset,
        )
    }

    /// Whether the buffer's pages targeting `(file, offset)` are all backed
    /// by live cache entries of that file.
    pub fn is_io_buffer_cache_backed(
        &self,
        file: &FileObject,
        buffer: &IoBuffer,
        offset: u64,
        size: usize,
    ) -> bool {
        self.inner
            .is_io_buffer_cache_backed(file, buffer, offset, size)
    }

    /// Flush dirty pages of the file in `[offset, offset + size)`; a `size`
    /// of `None` runs to the end of the file. `page_cap` bounds how many
    /// pages are written.
    pub fn flush(
        &self,
        file: &Arc<FileObject>,
        offset: u64,
        size: Option<u64>,
        flags: FlushFlags,
        page_cap: Option<usize>,
    ) -> Result<(), CacheError> {
        self.inner.flush(file, offset, size, flags, page_cap)
    }

    /// Flush every file object currently flagged as carrying dirty data.
    pub fn flush_dirty_files(&self, flags: FlushFlags) -> Result<(), CacheError> {
        self.inner.flush_dirty_file_objects(flags, None)
    }

    /// Drop the file's cache entries at or beyond `offset`.
    pub fn evict(&self, file: &Arc<FileObject>, offset: u64, mode: EvictMode) {
        self.inner.evict(file, offset, mode);
    }

    /// Mark the entry (or the backing owner of its frame) dirty. Returns
    /// `true` if this call performed the transition.
    pub fn mark_entry_dirty(&self, entry: &EntryRef) -> bool {
        self.inner.mark_entry_dirty(entry.entry())
    }

    /// Mark the entry clean. Returns `true` if this call performed the
    /// transition, which makes the caller the one responsible for writing
    /// the page out.
    pub fn mark_entry_clean(&self, entry: &EntryRef, move_to_clean_list: bool) -> bool {
        self.inner.mark_entry_clean(entry.entry(), move_to_clean_list)
    }

    /// Collapse two independently-owned frames onto one, making `upper` a
    /// non-owner referencing `lower`.
    pub fn link_entries(&self, lower: &EntryRef, upper: &EntryRef) -> bool {
        self.inner.link_entries(lower.entry(), upper.entry())
    }

    /// Whether the entry could share a frame with an entry of the given file.
    pub fn can_link(&self, entry: &EntryRef, file: &FileObject) -> bool {
        self.inner.can_link(entry.entry(), file)
    }

    /// Attach a virtual address to the entry's frame owner. Returns whether
    /// this call performed the attach.
    pub fn set_entry_va(&self, entry: &EntryRef, va: usize) -> bool {
        self.inner.set_entry_va(entry.entry(), va)
    }

    /// Whether the cache holds an uncomfortable amount of dirty data and
    /// writers should throttle.
    pub fn is_too_dirty(&self) -> bool {
        self.inner.is_too_dirty()
    }

    /// Schedule a cleaning pass of the background worker.
    pub fn schedule_worker(&self) {
        self.inner.schedule_worker();
    }

    /// Evict clean entries until the cache fits current memory conditions.
    /// `timid` makes the pass try file locks once and skip on failure, for
    /// callers that may already hold one.
    pub fn trim(&self, timid: bool) {
        self.inner.trim(timid);
    }

    /// A snapshot of the cache counters and thresholds.
    pub fn statistics(&self) -> CacheStatistics {
        self.inner.statistics()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<CacheInner> {
        &self.inner
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        let _ = self.inner.worker_tx.send(WorkerSignal::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// State shared between the cache facade, held entry references, and the
/// background worker.
pub(crate) struct CacheInner {
    mm: Arc<dyn MemoryProvider>,
    config: CacheConfig,
    thresholds: Thresholds,
    page_size: usize,
    page_shift: u32,
    /// The global list lock and the lists it guards.
    lists: Mutex<GlobalLists>,
    /// File objects flagged dirty, pending the worker's flush pass.
    dirty_files: Mutex<Vec<Weak<FileObject>>>,
    /// Entries present in file trees.
    entry_count: AtomicUsize,
    /// Physical pages owned by entries, including ones off their trees and
    /// awaiting destruction.
    physical_pages: AtomicUsize,
    dirty_pages: AtomicUsize,
    mapped_pages: AtomicUsize,
    mapped_dirty_pages: AtomicUsize,
    worker_state: AtomicU32,
    worker_tx: Sender<WorkerSignal>,
    worker_thread: OnceLock<ThreadId>,
    created_at: Instant,
    last_clean_millis: AtomicU64,
}

impl CacheInner {
    /// Drop a protocol reference. An entry whose last reference goes away
    /// while detached and clean moves to the tail of the clean LRU.
    pub(crate) fn release_entry_ref(&self, entry: &Arc<PageCacheEntry>) {
        let old = entry.dec_ref();
        if old == 1 && entry.list_tag() == ListTag::Detached && !entry.flags().is_dirty()
        {
            let mut lists = self.lists.lock();
            // Re-check now that the list lock is held.
            if !entry.flags().is_dirty() {
                lists::push_tail(&mut lists.clean, entry, ListTag::Clean);
            }
        }
    }

    /// [CacheInner::release_entry_ref] for callers already holding the list
    /// lock.
    pub(crate) fn release_entry_ref_locked(
        &self,
        lists: &mut GlobalLists,
        entry: &Arc<PageCacheEntry>,
    ) {
        let old = entry.dec_ref();
        if old == 1 && entry.list_tag() == ListTag::Detached && !entry.flags().is_dirty()
        {
            lists::push_tail(&mut lists.clean, entry, ListTag::Clean);
        }
    }

    /// Refresh an entry's list placement after a lookup or creation.
    pub(crate) fn update_entry_list(&self, entry: &Arc<PageCacheEntry>, created: bool) {
        let mut lists = self.lists.lock();
        if created {
            debug_assert_eq!(entry.list_tag(), ListTag::Detached);
            debug_assert!(!entry.flags().is_dirty());
            lists::push_tail(&mut lists.clean, entry, ListTag::Clean);
            return;
        }

        // A clean entry on a clean list moves to the back of the LRU. A
        // clean entry off every list was pulled off by a reference holder
        // and gets reinserted when the references drop.
        if entry.flags().is_dirty() {
            return;
        }
        let tag = entry.list_tag();
        if matches!(tag, ListTag::Clean | ListTag::CleanUnmapped)
            && entry.try_claim_list(tag)
        {
            lists::push_tail(&mut lists.clean, entry, ListTag::Clean);
        }
    }

    /// Attach `va` to the entry's frame owner, mirroring it into the entry
    /// itself for non-owners. Returns whether this call performed the attach.
    pub(crate) fn set_entry_va(&self, entry: &Arc<PageCacheEntry>, va: usize) -> bool {
        debug_assert!(va != 0 && va % self.page_size == 0);

        if entry.va().is_some() || self.config.disable_virtual_addresses {
            return false;
        }

        let owner = entry.owner_of();
        let old = owner.atomic_flags().fetch_or(ENTRY_MAPPED);
        debug_assert!(old.is_page_owner());

        let mut set = false;
        if !old.is_mapped() {
            set = true;
            owner.store_va(va);
            self.mapped_pages.fetch_add(1, Ordering::Relaxed);
            if old.is_dirty() {
                self.mapped_dirty_pages.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Mirror the owner's address into the entry that was asked about.
        // Every racer is trying to store the same value.
        if !Arc::ptr_eq(&owner, entry) {
            if let Some(owner_va) = owner.va() {
                debug_assert!(!entry.flags().is_mapped());
                entry.store_va(owner_va);
            }
        }

        set
    }

    /// Flag the file object as carrying dirty data, queue it for the
    /// worker's flush pass, and schedule the worker.
    pub(crate) fn mark_file_dirty(&self, file: &Arc<FileObject>) {
        if file.set_dirty_data() {
            self.dirty_files.lock().push(Arc::downgrade(file));
            self.schedule_worker();
        }
    }

    /// Returns the current free physical page count if the cache holds too
    /// much physical memory and should shrink.
    pub(crate) fn is_too_big(&self) -> Option<usize> {
        // Below the minimum the cache is entitled to its size no matter how
        // tight memory is.
        if self.physical_pages.load(Ordering::Relaxed) <= self.thresholds.minimum_pages {
            return None;
        }

        let free = self.mm.free_physical_pages();
        if free > self.thresholds.headroom_pages_trigger {
            return None;
        }
        Some(free)
    }

    /// Returns the current free virtual page count if the cache maps too
    /// much virtual address space and should unmap entries.
    pub(crate) fn is_too_mapped(&self) -> Option<usize> {
        let free_pages = (self.mm.free_virtual_bytes() >> self.page_shift) as usize;
        if free_pages > self.thresholds.virtual_pages_trigger
            && self.mm.virtual_warning_level() == VirtualWarningLevel::None
        {
            return None;
        }

        if self.mapped_pages.load(Ordering::Relaxed) == 0 {
            return None;
        }
        Some(free_pages)
    }

    /// Whether the cache holds enough dirty pages that writers should back
    /// off. Dirty pages stop the cache from shrinking when memory gets
    /// tight. The worker thread is exempt; it is the one draining the dirt.
    pub(crate) fn is_too_dirty(&self) -> bool {
        if self.is_worker_thread() {
            return self.is_too_big().is_some();
        }

        let free = self.mm.free_physical_pages();
        let physical = self.physical_pages.load(Ordering::Relaxed);
        let retreat = self.thresholds.headroom_pages_retreat;
        let ideal_size = if free < retreat {
            physical.saturating_sub(retreat - free)
        } else {
            physical + (free - retreat)
        };

        let max_dirty = ideal_size >> MAX_DIRTY_SHIFT;
        self.dirty_pages.load(Ordering::Relaxed) >= max_dirty
    }

    pub(crate) fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            entry_count: self.entry_count.load(Ordering::Relaxed),
            headroom_pages_trigger: self.thresholds.headroom_pages_trigger,
            headroom_pages_retreat: self.thresholds.headroom_pages_retreat,
            minimum_pages_target: self.thresholds.minimum_pages_target,
            physical_pages: self.physical_pages.load(Ordering::Relaxed),
            dirty_pages: self.dirty_pages.load(Ordering::Relaxed),
            last_clean_time: Duration::from_millis(
                self.last_clean_millis.load(Ordering::Relaxed),
            ),
        }
    }

    #[inline]
    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    #[cfg(test)]
    /// Validate that every dirty entry in the file's tree sits on the file's
    /// dirty list.
    pub(crate) fn check_file_dirty_list(&self, file: &Arc<FileObject>) {
        let tree = file.lock.read();
        let dirty = file.dirty_pages.lock();
        for entry in tree.entries.values() {
            if !entry.flags().is_dirty() {
                continue;
            }
            assert_eq!(
                entry.list_tag(),
                ListTag::Dirty,
                "dirty entry at {:#x} not tagged onto the dirty list",
                entry.offset(),
            );
            let queued = dirty.iter().any(|slot| {
                slot.peek(ListTag::Dirty)
                    .is_some_and(|queued| Arc::ptr_eq(&queued, entry))
            });
            assert!(
                queued,
                "dirty entry at {:#x} missing from the dirty list",
                entry.offset(),
            );
        }
    }
}
