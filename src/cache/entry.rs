use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use super::flags::{AtomicEntryFlags, EntryFlags};
use super::lists::ListTag;
use super::CacheInner;
use crate::vfs::FileObject;

/// Reference counts beyond this are treated as leaks.
const REFERENCE_LIMIT: u32 = 0x1000;

/// One cached page and its metadata.
///
/// An entry either owns its physical frame or references the backing entry
/// that does; it lives in its file's offset tree while cached and on at most
/// one of the cache lists at a time. The reference count tracks protocol
/// references only: the tree does not count as one.
pub struct PageCacheEntry {
    file: Arc<FileObject>,
    offset: u64,
    phys: AtomicU64,
    /// Virtual address of the frame, `0` when unmapped.
    va: AtomicUsize,
    backing: ArcSwapOption<PageCacheEntry>,
    refcount: AtomicU32,
    flags: AtomicEntryFlags,
    tree_linked: AtomicBool,
    /// Which list the entry is on; [ListTag::Detached] when on none.
    list_tag: AtomicU8,
    /// Bumped on every list transition; a queued list slot is only honored
    /// while its recorded stamp still matches.
    list_stamp: AtomicU64,
}

impl PageCacheEntry {
    pub(crate) fn new(
        file: Arc<FileObject>,
        va: Option<usize>,
        phys: u64,
        offset: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            file,
            offset,
            phys: AtomicU64::new(phys),
            va: AtomicUsize::new(va.unwrap_or(0)),
            backing: ArcSwapOption::const_empty(),
            refcount: AtomicU32::new(1),
            flags: AtomicEntryFlags::default(),
            tree_linked: AtomicBool::new(false),
            list_tag: AtomicU8::new(ListTag::Detached as u8),
            list_stamp: AtomicU64::new(0),
        })
    }

    #[inline]
    pub(crate) fn file(&self) -> &Arc<FileObject> {
        &self.file
    }

    #[inline]
    /// The file or device offset of the cached page.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    /// The physical address of the frame holding the page content.
    pub fn phys(&self) -> u64 {
        self.phys.load(Ordering::Acquire)
    }

    pub(crate) fn set_phys(&self, phys: u64) {
        self.phys.store(phys, Ordering::Release);
    }

    #[inline]
    /// The virtual address the frame is mapped at, if any.
    pub fn va(&self) -> Option<usize> {
        match self.va.load(Ordering::Acquire) {
            0 => None,
            va => Some(va),
        }
    }

    pub(crate) fn store_va(&self, va: usize) {
        self.va.store(va, Ordering::Release);
    }

    pub(crate) fn take_va(&self) -> Option<usize> {
        match self.va.swap(0, Ordering::AcqRel) {
            0 => None,
            va => Some(va),
        }
    }

    /// The entry's virtual address, lazily copied from a mapped backing
    /// entry. Racing copies write the same value.
    pub(crate) fn resolve_va(&self) -> Option<usize> {
        if let Some(va) = self.va() {
            debug_assert!(
                self.backing().map_or(true, |backing| backing.va() == Some(va)),
                "non-owner VA diverged from its backing entry",
            );
            return Some(va);
        }

        let backing = self.backing()?;
        debug_assert!(!self.flags().is_page_owner() && !self.flags().is_mapped());
        let va = backing.va()?;
        self.store_va(va);
        Some(va)
    }

    #[inline]
    pub(crate) fn backing(&self) -> Option<Arc<PageCacheEntry>> {
        self.backing.load_full()
    }

    pub(crate) fn set_backing(&self, backing: Arc<PageCacheEntry>) {
        debug_assert!(self.backing.load().is_none());
        self.backing.store(Some(backing));
    }

    pub(crate) fn take_backing(&self) -> Option<Arc<PageCacheEntry>> {
        self.backing.swap(None)
    }

    /// The entry that owns the physical frame: the entry itself, or its
    /// backing entry when it is not the owner.
    pub(crate) fn owner_of(self: &Arc<Self>) -> Arc<PageCacheEntry> {
        if self.flags().is_page_owner() {
            return self.clone();
        }
        match self.backing() {
            Some(backing) => backing,
            None => self.clone(),
        }
    }

    #[inline]
    pub(crate) fn flags(&self) -> EntryFlags {
        self.flags.load()
    }

    #[inline]
    pub(crate) fn atomic_flags(&self) -> &AtomicEntryFlags {
        &self.flags
    }

    #[inline]
    /// Whether the page content still needs writing back.
    pub fn is_dirty(&self) -> bool {
        self.flags().is_dirty()
    }

    pub(crate) fn add_ref(&self) {
        let old = self.refcount.fetch_add(1, Ordering::AcqRel);
        assert!(old < REFERENCE_LIMIT, "cache entry reference count leak");
    }

    /// Decrement the reference count, returning the previous value. The
    /// caller owns the clean-list reinsertion rule for the 1→0 transition.
    pub(crate) fn dec_ref(&self) -> u32 {
        let old = self.refcount.fetch_sub(1, Ordering::AcqRel);
        assert!(old != 0 && old < REFERENCE_LIMIT);
        old
    }

    #[inline]
    pub(crate) fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_tree_linked(&self) -> bool {
        self.tree_linked.load(Ordering::Acquire)
    }

    pub(crate) fn set_tree_linked(&self, linked: bool) {
        self.tree_linked.store(linked, Ordering::Release);
    }

    #[inline]
    pub(crate) fn list_tag(&self) -> ListTag {
        ListTag::from_u8(self.list_tag.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn list_stamp(&self) -> u64 {
        self.list_stamp.load(Ordering::Acquire)
    }

    /// Claim list membership for `tag`, winning only from the detached
    /// state. Returns the stamp to record in the queued slot.
    pub(crate) fn try_assign_list(&self, tag: ListTag) -> Option<u64> {
        let result = self.list_tag.compare_exchange(
            ListTag::Detached as u8,
            tag as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if result.is_err() {
            return None;
        }
        Some(self.list_stamp.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Take the entry off the list it is tagged with, if it is still tagged
    /// with it.
    pub(crate) fn try_claim_list(&self, tag: ListTag) -> bool {
        self.list_tag
            .compare_exchange(
                tag as u8,
                ListTag::Detached as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Detach from whatever list the entry is on. Queued slots become stale
    /// through the stamp bump.
    pub(crate) fn detach_from_list(&self) -> ListTag {
        let old = self.list_tag.swap(ListTag::Detached as u8, Ordering::AcqRel);
        let old = ListTag::from_u8(old);
        if old != ListTag::Detached {
            self.list_stamp.fetch_add(1, Ordering::AcqRel);
        }
        old
    }
}

impl std::fmt::Debug for PageCacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PageCacheEntry(file={}, offset={:#x}, phys={:#x}, refs={}, {:?}, {:?})",
            self.file.id(),
            self.offset,
            self.phys(),
            self.refcount(),
            self.flags(),
            self.list_tag(),
        )
    }
}

/// A held protocol reference to a cache entry.
///
/// Dropping the reference applies the release rule: when the last reference
/// goes away and the entry is detached and clean, it is inserted at the tail
/// of the clean LRU.
pub struct EntryRef {
    pub(crate) inner: Arc<CacheInner>,
    pub(crate) entry: Arc<PageCacheEntry>,
}

impl EntryRef {
    /// Wrap an entry whose reference count was already incremented for this
    /// handle.
    pub(crate) fn adopt(inner: Arc<CacheInner>, entry: Arc<PageCacheEntry>) -> Self {
        Self { inner, entry }
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.entry.offset()
    }

    #[inline]
    pub fn phys(&self) -> u64 {
        self.entry.phys()
    }

    #[inline]
    /// The entry's virtual address without resolving through the backing
    /// entry.
    pub fn va(&self) -> Option<usize> {
        self.entry.va()
    }

    /// The entry's virtual address, adopted from a mapped backing entry when
    /// the entry has none of its own.
    pub fn get_va(&self) -> Option<usize> {
        self.entry.resolve_va()
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.entry.is_dirty()
    }

    #[inline]
    /// The id of the file object the entry caches content for.
    pub fn file_id(&self) -> u64 {
        self.entry.file().id()
    }

    #[inline]
    pub(crate) fn entry(&self) -> &Arc<PageCacheEntry> {
        &self.entry
    }
}

impl Clone for EntryRef {
    fn clone(&self) -> Self {
        self.entry.add_ref();
        Self {
            inner: self.inner.clone(),
            entry: self.entry.clone(),
        }
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        self.inner.release_entry_ref(&self.entry);
    }
}

impl std::fmt::Debug for EntryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.entry.fmt(f)
    }
}
