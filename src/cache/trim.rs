use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::entry::PageCacheEntry;
use super::flags::ENTRY_MAPPED;
use super::lists::{self, ListTag};
use super::CacheInner;
use crate::error::CacheError;
use crate::mm::VirtualWarningLevel;

impl CacheInner {
    /// Evict clean entries in LRU order until the cache fits current
    /// physical memory conditions, then shed virtual mappings and, when the
    /// cache dipped below its working-set target, ask for paging out.
    pub(crate) fn trim(&self, timid: bool) {
        let mut target = 0usize;
        let mut free_physical = 0usize;

        if let Some(free) = self.is_too_big() {
            debug_assert!(free < self.thresholds.headroom_pages_retreat);
            free_physical = free;
            target = self.thresholds.headroom_pages_retreat - free;

            let physical = self.physical_pages.load(Ordering::Relaxed);
            target = target.min(physical);
            if physical - target < self.thresholds.minimum_pages {
                target = physical.saturating_sub(self.thresholds.minimum_pages);
            }

            tracing::debug!(remove_target = target, "trimming the page cache");

            // Unmapped entries are the coldest, so they go first.
            let mut destroy_list = Vec::new();
            self.remove_entries_from_list(
                ListTag::CleanUnmapped,
                &mut destroy_list,
                timid,
                &mut target,
            );
            if target != 0 {
                self.remove_entries_from_list(
                    ListTag::Clean,
                    &mut destroy_list,
                    timid,
                    &mut target,
                );
            }
            self.destroy_entries(destroy_list);
        }

        self.trim_virtual(timid);

        // If the cache fell below its working-set target, pull pageable
        // memory into the mix so the cache is not the only thing shrinking.
        if target != 0 {
            let physical = self.physical_pages.load(Ordering::Relaxed);
            if physical < self.thresholds.minimum_pages_target {
                let page_out_count = self.thresholds.minimum_pages_target - physical;
                tracing::debug!(page_out_count, "requesting paging out");
                self.mm.request_paging_out(free_physical + page_out_count);
            }
        }
    }

    /// Destroy the entries queued on the global removal list whose
    /// references have drained.
    pub(crate) fn drain_removal_list(&self) {
        if self.lists.lock().removal.is_empty() {
            return;
        }

        let mut destroy_list = Vec::new();
        let mut unbounded = usize::MAX;
        self.remove_entries_from_list(
            ListTag::Removal,
            &mut destroy_list,
            false,
            &mut unbounded,
        );
        self.destroy_entries(destroy_list);
    }

    /// Take removable entries off the given list, collecting them for
    /// destruction until `target` page owners have been taken down.
    ///
    /// Referenced or re-dirtied entries leave the list and are reinserted by
    /// whoever holds them. `timid` tries each file lock once and skips on
    /// failure, for threads that may already hold one further up the stack.
    fn remove_entries_from_list(
        &self,
        tag: ListTag,
        destroy_list: &mut Vec<Arc<PageCacheEntry>>,
        timid: bool,
        target: &mut usize,
    ) {
        let mut lists = self.lists.lock();
        let mut local = std::mem::take(lists.deque_mut(tag));

        while *target != 0 {
            let Some(slot) = local.pop_front() else {
                break;
            };
            let Some(entry) = lists::claim(slot, tag) else {
                continue;
            };

            // Referenced entries leave the list so they are not iterated
            // over and over; the release of the last reference reinserts.
            if entry.refcount() != 0 {
                if entry.refcount() == 0 {
                    lists::push_tail(&mut lists.clean, &entry, ListTag::Clean);
                }
                continue;
            }

            // A dirty entry here raced a dirty-marker that has already
            // queued it on its file's dirty list.
            if entry.flags().is_dirty() {
                continue;
            }

            // A single try-lock under the list lock cannot invert; a full
            // acquisition has to drop the list lock first.
            let timid_guard = if timid {
                match entry.file().lock.try_write() {
                    Some(guard) => Some(guard),
                    None => {
                        lists::push_tail(&mut lists.clean, &entry, ListTag::Clean);
                        continue;
                    },
                }
            } else {
                None
            };

            entry.add_ref();
            drop(lists);

            let mut guard = match timid_guard {
                Some(guard) => guard,
                None => entry.file().lock.write(),
            };

            let mut page_taken = false;
            if entry.refcount() == 1 {
                // The file lock holds off new mappings; tear down any image
                // sections still using the page. A mapping may report the
                // page dirty, in which case it stays for this pass.
                let unmapped = self.mm.unmap_image_sections(
                    entry.file().id(),
                    entry.offset(),
                    self.page_size,
                    true,
                );

                if let Ok(page_was_dirty) = unmapped {
                    if page_was_dirty {
                        self.mark_dirty_with_lock(&entry);
                    }

                    if !entry.flags().is_dirty() {
                        let was_owner = entry.flags().is_page_owner();
                        self.mark_entry_clean(&entry, false);
                        if entry.is_tree_linked() {
                            self.remove_from_tree(&mut guard, &entry);
                        }
                        page_taken = true;
                        if was_owner {
                            *target = target.saturating_sub(1);
                        }
                    }
                }
            }

            drop(guard);
            lists = self.lists.lock();

            if page_taken {
                debug_assert!(!entry.flags().is_dirty());
                entry.detach_from_list();
                destroy_list.push(entry.clone());
            } else if !entry.flags().is_dirty() {
                entry.detach_from_list();
                lists::push_tail(&mut lists.clean, &entry, ListTag::Clean);
            }

            self.release_entry_ref_locked(&mut lists, &entry);
        }

        // Put whatever was not reached back where it came from.
        let deque = lists.deque_mut(tag);
        deque.append(&mut local);
    }

    /// Unmap clean entries in LRU order until enough virtual address space
    /// is free, coalescing contiguous addresses into single unmap calls.
    pub(crate) fn trim_virtual(&self, timid: bool) {
        {
            let lists = self.lists.lock();
            if lists.clean.is_empty() {
                return;
            }
        }
        let Some(free_virtual) = self.is_too_mapped() else {
            return;
        };

        let mut target = self
            .thresholds
            .virtual_pages_retreat
            .saturating_sub(free_virtual);

        // The accounting may drift a little under concurrency, never more.
        let mapped = self.mapped_pages.load(Ordering::Relaxed);
        let mapped_dirty = self.mapped_dirty_pages.load(Ordering::Relaxed);
        debug_assert!(mapped_dirty <= mapped + 0x10);
        debug_assert!(mapped_dirty <= self.dirty_pages.load(Ordering::Relaxed) + 0x10);

        let mapped_clean = mapped.saturating_sub(mapped_dirty);
        target = target.min(mapped_clean);

        if target == 0 {
            if self.mm.virtual_warning_level() == VirtualWarningLevel::None {
                return;
            }

            // Unmap some minimum before trusting the warning level to clear;
            // this builds headroom when the address space is fragmented.
            target = self.thresholds.virtual_pages_retreat
                - self.thresholds.virtual_pages_trigger;
        }

        tracing::debug!(unmap_target = target, "unmapping page cache entries");

        let page_size = self.page_size;
        let mut run_start: Option<usize> = None;
        let mut run_len = 0usize;
        let mut unmap_count = 0usize;
        let mut skipped: Vec<Arc<PageCacheEntry>> = Vec::new();

        let mut lists = self.lists.lock();
        loop {
            if unmap_count >= target
                && self.mm.virtual_warning_level() == VirtualWarningLevel::None
            {
                break;
            }
            let Some(slot) = lists.clean.pop_front() else {
                break;
            };
            let Some(entry) = lists::claim(slot, ListTag::Clean) else {
                continue;
            };

            if entry.refcount() != 0 {
                if entry.refcount() == 0 {
                    lists::push_tail(&mut lists.clean, &entry, ListTag::Clean);
                }
                continue;
            }

            if entry.flags().is_dirty() {
                continue;
            }

            // Already unmapped entries move to the colder list so later
            // passes stop iterating over them.
            if entry.va().is_none() {
                lists::push_tail(&mut lists.clean_unmapped, &entry, ListTag::CleanUnmapped);
                continue;
            }

            let file = entry.file().clone();
            let timid_guard = if timid {
                match file.lock.try_write() {
                    Some(guard) => Some(guard),
                    None => {
                        skipped.push(entry);
                        continue;
                    },
                }
            } else {
                None
            };

            entry.add_ref();
            drop(lists);

            let guard = match timid_guard {
                Some(guard) => guard,
                None => file.lock.write(),
            };

            // A refused detach just leaves the entry mapped for this pass.
            let va = self.remove_entry_va(&entry).ok().flatten();
            if let Some(va) = va {
                unmap_count += 1;

                // Entries usually come off the LRU in the order they were
                // mapped; batch contiguous addresses into one unmap.
                if let Some(start) = run_start {
                    if va != start + run_len {
                        self.mm.unmap_address(start, run_len);
                        run_start = None;
                        run_len = 0;
                    }
                }
                if run_start.is_none() {
                    run_start = Some(va);
                }
                run_len += page_size;
            }

            drop(guard);
            lists = self.lists.lock();

            if !entry.flags().is_dirty() {
                entry.detach_from_list();
                lists::push_tail(&mut lists.clean_unmapped, &entry, ListTag::CleanUnmapped);
            }
            self.release_entry_ref_locked(&mut lists, &entry);
        }

        // Entries whose locks could not be tried land back on the clean
        // list for the next pass.
        for entry in skipped {
            lists::push_tail(&mut lists.clean, &entry, ListTag::Clean);
        }
        drop(lists);

        // The final run unmaps after the lock is gone; the entries already
        // reflect being unmapped.
        if let Some(start) = run_start {
            self.mm.unmap_address(start, run_len);
        }

        if unmap_count != 0 {
            self.mapped_pages.fetch_sub(unmap_count, Ordering::Relaxed);
        }
        tracing::debug!(unmap_count, "unmapped page cache entries");
    }

    /// Separate an entry from its virtual address, refusing when references
    /// or dirtiness make that unsafe. The caller holds the entry's file lock
    /// exclusive; the backing entry's lock is taken here when one exists.
    ///
    /// The mapped-page counter is left to the caller, which decrements in
    /// bulk.
    pub(crate) fn remove_entry_va(
        &self,
        entry: &Arc<PageCacheEntry>,
    ) -> Result<Option<usize>, CacheError> {
        if entry.refcount() != 1 || entry.flags().is_dirty() {
            return Err(CacheError::ResourceInUse);
        }

        let backing = if entry.flags().is_page_owner() {
            None
        } else {
            Some(entry.backing().expect("non-owner without a backing entry"))
        };

        let _backing_guard;
        let old = match &backing {
            // The owner has no references beyond the caller's, so it backs
            // nobody else and the address can go freely.
            None => entry.atomic_flags().fetch_clear(ENTRY_MAPPED),
            Some(backing) => {
                // Files are locked before block devices, so nesting the
                // backing's lock here is safe.
                _backing_guard = backing.file().lock.write();
                if backing.refcount() != 1 || backing.flags().is_dirty() {
                    return Err(CacheError::ResourceInUse);
                }

                debug_assert!(
                    entry.va().is_none() || entry.va() == backing.va(),
                    "non-owner VA diverged from its backing entry",
                );
                debug_assert!(!entry.flags().is_mapped());
                debug_assert!(!entry.flags().is_dirty());
                backing.atomic_flags().fetch_clear(ENTRY_MAPPED)
            },
        };

        if !old.is_mapped() {
            return Ok(None);
        }

        let va = match &backing {
            Some(backing) => {
                let va = backing.take_va();
                entry.take_va();
                va
            },
            None => entry.take_va(),
        };

        if old.is_dirty() {
            self.mapped_dirty_pages.fetch_sub(1, Ordering::Relaxed);
        }

        Ok(va)
    }
}
