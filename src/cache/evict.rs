use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::entry::PageCacheEntry;
use super::flags::ENTRY_MAPPED;
use super::lists::{self, ListTag};
use super::CacheInner;
use crate::vfs::{FileObject, FileTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How aggressively [crate::PageCache::evict] tears entries down.
pub enum EvictMode {
    /// Skip entries with outside references.
    BestEffort,
    /// Remove every entry in range; referenced entries are queued for
    /// destruction once their references drop. For truncate paths, which
    /// may race with outstanding handles.
    Truncate,
    /// Remove every entry in range for a deleted file.
    Delete,
}

impl CacheInner {
    /// Drop the file's cache entries at or beyond `offset`.
    pub(crate) fn evict(&self, file: &Arc<FileObject>, offset: u64, mode: EvictMode) {
        if !file.io_type().is_cacheable() {
            return;
        }

        let mut tree = file.lock.write();
        if tree.entries.is_empty() {
            return;
        }

        tracing::debug!(
            file = file.id(),
            offset,
            mode = ?mode,
            "evicting cache entries",
        );

        let targets: Vec<Arc<PageCacheEntry>> = tree
            .entries
            .range(offset..)
            .map(|(_, entry)| entry.clone())
            .collect();

        let mut destroy_list = Vec::new();
        for entry in targets {
            debug_assert!(entry.offset() >= offset);

            if mode == EvictMode::BestEffort && entry.refcount() != 0 {
                tracing::trace!(entry = ?entry, "skipped referenced entry");
                continue;
            }

            // Clean the page for the accounting; it is evicted and will not
            // be written out.
            self.mark_entry_clean(&entry, false);
            self.remove_from_tree(&mut tree, &entry);

            debug_assert!(!entry.flags().is_dirty());
            entry.detach_from_list();
            if entry.refcount() == 0 {
                destroy_list.push(entry);
            } else {
                let mut global_lists = self.lists.lock();
                lists::push_tail(&mut global_lists.removal, &entry, ListTag::Removal);
            }
        }

        drop(tree);
        self.destroy_entries(destroy_list);
    }

    /// Take an entry out of its file's tree. The file lock is held
    /// exclusive through the borrow of the tree.
    pub(crate) fn remove_from_tree(
        &self,
        tree: &mut FileTree,
        entry: &Arc<PageCacheEntry>,
    ) {
        debug_assert!(entry.is_tree_linked());

        // The frame now answers to the backing entry, if there is one. It
        // may always have done so, but make sure.
        if let Some(backing) = entry.backing() {
            self.mm.set_frame_owner(entry.phys(), &backing);
        }

        let removed = tree.entries.remove(&entry.offset());
        debug_assert!(removed.is_some_and(|removed| Arc::ptr_eq(&removed, entry)));
        entry.set_tree_linked(false);
        self.entry_count.fetch_sub(1, Ordering::Relaxed);

        tracing::trace!(
            file = entry.file().id(),
            offset = entry.offset(),
            "removed entry from tree",
        );
    }

    /// Destroy entries that are out of their trees with no references left.
    pub(crate) fn destroy_entries(&self, entries: Vec<Arc<PageCacheEntry>>) {
        if entries.is_empty() {
            return;
        }

        let count = entries.len();
        for entry in entries {
            debug_assert_eq!(entry.refcount(), 0);
            debug_assert!(!entry.is_tree_linked());
            self.destroy_entry(entry);
        }
        tracing::debug!(count, "destroyed cache entries");
    }

    /// Release an entry's resources: its frame and mapping when it is the
    /// owner, its reference on the backing entry otherwise.
    fn destroy_entry(&self, entry: Arc<PageCacheEntry>) {
        let flags = entry.flags();
        debug_assert!(!flags.is_dirty());
        tracing::trace!(entry = ?entry, "destroying entry");

        if flags.is_page_owner() {
            if flags.is_mapped() {
                let va = entry.take_va().expect("mapped entry without a VA");
                self.mm.unmap_address(va, self.page_size);
                self.mapped_pages.fetch_sub(1, Ordering::Relaxed);
                entry.atomic_flags().fetch_clear(ENTRY_MAPPED);
            }

            self.mm.free_physical_page(entry.phys());
            self.physical_pages.fetch_sub(1, Ordering::Relaxed);
        } else if let Some(backing) = entry.take_backing() {
            debug_assert!(
                entry.va().is_none() || entry.va() == backing.va(),
                "non-owner VA diverged from its backing entry",
            );
            debug_assert_eq!(entry.phys(), backing.phys());
            self.release_entry_ref(&backing);
        }
    }
}
