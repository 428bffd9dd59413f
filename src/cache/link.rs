use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::entry::PageCacheEntry;
use super::flags::{ENTRY_MAPPED, ENTRY_PAGE_OWNER};
use super::CacheInner;
use crate::vfs::{FileObject, IoType};

impl CacheInner {
    /// Whether the entry could share a frame with an entry of the given
    /// file.
    pub(crate) fn can_link(&self, entry: &Arc<PageCacheEntry>, file: &FileObject) -> bool {
        debug_assert!(file.io_type().is_cacheable());

        let entry_type = entry.file().io_type();
        entry_type.is_linkable() && entry_type != file.io_type()
    }

    /// Collapse two independently-owned frames onto one.
    ///
    /// `lower` is the block-device entry whose frame is displaced; `upper`
    /// is the file entry whose frame both will share. Returns `true` when
    /// the pair is linked (or already was) and `false` when the entries must
    /// keep their own frames.
    pub(crate) fn link_entries(
        &self,
        lower: &Arc<PageCacheEntry>,
        upper: &Arc<PageCacheEntry>,
    ) -> bool {
        let lower_file = lower.file().clone();

        // Holding the device file lock exclusive stops new references from
        // being handed out while the frame swaps.
        let _guard = lower_file.lock.write();
        debug_assert!(lower.refcount() > 0);
        debug_assert!(upper.refcount() > 0);

        let lower_type = lower_file.io_type();
        let upper_type = upper.file().io_type();
        if lower_type == upper_type {
            return false;
        }

        if lower_type != IoType::BlockDevice || !upper_type.is_cacheable_file() {
            debug_assert!(false, "linking is file-over-device only");
            return false;
        }

        if let Some(backing) = upper.backing() {
            return Arc::ptr_eq(&backing, lower);
        }

        // Another holder of the lower entry would be left with a stale
        // frame address.
        if lower.refcount() != 1 {
            return false;
        }

        debug_assert!(lower.flags().is_page_owner());
        debug_assert!(upper.flags().is_page_owner());

        // Nobody may have the device frame mmapped; it is about to be freed.
        let unmap = self.mm.unmap_image_sections(
            lower_file.id(),
            lower.offset(),
            self.page_size,
            true,
        );
        if let Err(error) = unmap {
            tracing::debug!(
                error = %error,
                device = lower_file.id(),
                offset = lower.offset(),
                "link abandoned, device frame still mapped",
            );
            return false;
        }

        debug_assert!(
            !upper.flags().is_dirty(),
            "linking would make a non-owner dirty",
        );

        // Where the two entries disagree on mappedness the lower entry's
        // count is dropped now; the transfer below restores it if the upper
        // side was the mapped one.
        let mapped_differs = lower.flags().is_mapped() != upper.flags().is_mapped();
        if mapped_differs && lower.flags().is_mapped() {
            let old = lower.atomic_flags().fetch_clear(ENTRY_MAPPED);
            if old.is_mapped() {
                self.mapped_pages.fetch_sub(1, Ordering::Relaxed);
                if old.is_dirty() {
                    self.mapped_dirty_pages.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }

        // Swap the device entry onto the file entry's frame, remembering the
        // displaced frame.
        let displaced_phys = lower.phys();
        let displaced_va = lower.take_va();
        lower.set_phys(upper.phys());
        if let Some(va) = upper.va() {
            lower.store_va(va);
        }

        // The device entry owns the shared frame now.
        let old = upper.atomic_flags().fetch_clear(ENTRY_PAGE_OWNER | ENTRY_MAPPED);
        if old.is_mapped() {
            self.mapped_pages.fetch_sub(1, Ordering::Relaxed);
            if mapped_differs {
                let old_lower = lower.atomic_flags().fetch_or(ENTRY_MAPPED);
                if !old_lower.is_mapped() {
                    self.mapped_pages.fetch_add(1, Ordering::Relaxed);
                    if old_lower.is_dirty() {
                        self.mapped_dirty_pages.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        // Nothing can have linked them behind our backs; the caller holds
        // references on both.
        lower.add_ref();
        upper.set_backing(lower.clone());

        tracing::trace!(
            device = lower_file.id(),
            file = upper.file().id(),
            offset = upper.offset(),
            "linked entries onto one frame",
        );

        // The displaced frame leaves the cache.
        if let Some(va) = displaced_va {
            self.mm.unmap_address(va, self.page_size);
        }
        self.mm.free_physical_page(displaced_phys);
        self.physical_pages.fetch_sub(1, Ordering::Relaxed);

        true
    }
}
