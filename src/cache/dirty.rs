use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::entry::PageCacheEntry;
use super::flags::ENTRY_DIRTY;
use super::lists::{self, ListTag};
use super::CacheInner;

impl CacheInner {
    /// Mark the entry dirty, redirecting to the backing owner of its frame.
    /// Returns `true` if this call performed the transition.
    pub(crate) fn mark_entry_dirty(&self, entry: &Arc<PageCacheEntry>) -> bool {
        let mut target = entry.owner_of();

        // Quick exit before taking any locks.
        if target.flags().is_dirty() {
            return false;
        }

        let mut file = target.file().clone();
        let mut guard = file.lock.write();

        // A backing link may have been established while the lock was being
        // acquired; the dirty bit belongs on the owner behind it.
        if let Some(backing) = target.backing() {
            debug_assert!(Arc::ptr_eq(&target, entry));
            drop(guard);
            target = backing;
            file = target.file().clone();
            guard = file.lock.write();
        }

        let marked = self.mark_dirty_with_lock(&target);
        drop(guard);
        marked
    }

    /// Mark an entry dirty while its file lock is already held in either
    /// mode. Redirects through a backing link that raced in, taking the
    /// backing's file lock (files are locked before block devices).
    pub(crate) fn mark_dirty_with_lock(&self, entry: &Arc<PageCacheEntry>) -> bool {
        if !entry.flags().is_page_owner() {
            if let Some(backing) = entry.backing() {
                debug_assert!(!entry.flags().is_dirty());
                let _guard = backing.file().lock.write();
                return self.mark_dirty_owner(&backing);
            }
        }
        self.mark_dirty_owner(entry)
    }

    fn mark_dirty_owner(&self, entry: &Arc<PageCacheEntry>) -> bool {
        if entry.flags().is_dirty() {
            return false;
        }

        let old = entry.atomic_flags().fetch_or(ENTRY_DIRTY);
        debug_assert!(old.is_page_owner());
        if old.is_dirty() {
            return false;
        }

        debug_assert!(entry.va().is_some() || !old.is_mapped());
        self.dirty_pages.fetch_add(1, Ordering::Relaxed);
        if old.is_mapped() {
            self.mapped_dirty_pages.fetch_add(1, Ordering::Relaxed);
        }

        // Off whatever clean list it was on and onto its file's dirty list.
        entry.detach_from_list();
        let file = entry.file().clone();
        {
            let mut dirty = file.dirty_pages.lock();
            lists::push_tail(&mut dirty, entry, ListTag::Dirty);
        }

        tracing::trace!(
            file = file.id(),
            offset = entry.offset(),
            "marked entry dirty",
        );
        self.mark_file_dirty(&file);
        true
    }

    /// Mark the entry clean, removing it from its file's dirty list and
    /// optionally placing it at the tail of the clean LRU.
    ///
    /// The caller must hold either a reference on the entry or the owner's
    /// file lock. Returning `true` is the token that the caller is the one
    /// actually writing the page.
    pub(crate) fn mark_entry_clean(
        &self,
        entry: &Arc<PageCacheEntry>,
        move_to_clean_list: bool,
    ) -> bool {
        if !entry.flags().is_dirty() {
            return false;
        }

        let old = entry.atomic_flags().fetch_clear(ENTRY_DIRTY);
        if !old.is_dirty() {
            return false;
        }
        debug_assert!(old.is_page_owner());

        self.dirty_pages.fetch_sub(1, Ordering::Relaxed);
        if old.is_mapped() {
            self.mapped_dirty_pages.fetch_sub(1, Ordering::Relaxed);
        }

        let detached_from = entry.detach_from_list();
        debug_assert_eq!(detached_from, ListTag::Dirty);

        // The page was dirty until a moment ago, so treat it as recently
        // used and queue it at the back of the LRU.
        if move_to_clean_list {
            let mut lists = self.lists.lock();
            lists::push_tail(&mut lists.clean, entry, ListTag::Clean);
        }

        tracing::trace!(
            file = entry.file().id(),
            offset = entry.offset(),
            "marked entry clean",
        );
        true
    }
}
