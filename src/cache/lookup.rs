use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::entry::{EntryRef, PageCacheEntry};
use super::flags::{ENTRY_MAPPED, ENTRY_PAGE_OWNER};
use super::CacheInner;
use crate::buffer::IoBuffer;
use crate::utils::align_up;
use crate::vfs::{FileObject, FileTree, IoType};

impl CacheInner {
    /// Search the file's tree for an entry at `offset`, taking a reference
    /// on it and refreshing its list placement.
    pub(crate) fn lookup(
        &self,
        file: &Arc<FileObject>,
        offset: u64,
    ) -> Option<Arc<PageCacheEntry>> {
        let tree = file.lock.read();
        let found = tree.entries.get(&offset).cloned();

        match found {
            Some(entry) => {
                entry.add_ref();
                self.update_entry_list(&entry, false);
                tracing::trace!(
                    file = file.id(),
                    offset,
                    entry = ?entry,
                    "cache lookup hit",
                );
                Some(entry)
            },
            None => {
                tracing::trace!(file = file.id(), offset, "cache lookup miss");
                None
            },
        }
    }

    /// Insert a new entry for `(file, offset)`, or return the existing one
    /// if a racing insert won. Returns the entry with a reference held and
    /// whether this call created it.
    pub(crate) fn create_or_lookup(
        &self,
        file: &Arc<FileObject>,
        va: Option<usize>,
        phys: u64,
        offset: u64,
        link: Option<&Arc<PageCacheEntry>>,
    ) -> (Arc<PageCacheEntry>, bool) {
        let mut tree = file.lock.write();
        self.create_or_lookup_in_tree(&mut tree, file, va, phys, offset, link)
    }

    /// [CacheInner::create_or_lookup] with the file lock already held
    /// exclusive.
    pub(crate) fn create_or_lookup_in_tree(
        &self,
        tree: &mut FileTree,
        file: &Arc<FileObject>,
        va: Option<usize>,
        phys: u64,
        offset: u64,
        link: Option<&Arc<PageCacheEntry>>,
    ) -> (Arc<PageCacheEntry>, bool) {
        debug_assert!(link.is_none_or(|link| link.phys() == phys));

        if let Some(existing) = tree.entries.get(&offset).cloned() {
            existing.add_ref();
            self.update_entry_list(&existing, false);
            tracing::trace!(
                file = file.id(),
                offset,
                entry = ?existing,
                "insert found existing entry",
            );
            return (existing, false);
        }

        let entry = self.create_entry(file, va, phys, offset);
        self.insert_entry(tree, &entry, link);
        self.update_entry_list(&entry, true);
        tracing::trace!(file = file.id(), offset, entry = ?entry, "inserted new entry");
        (entry, true)
    }

    /// Insert a new entry the caller guarantees to be unique for
    /// `(file, offset)`.
    pub(crate) fn create_and_insert(
        &self,
        file: &Arc<FileObject>,
        va: Option<usize>,
        phys: u64,
        offset: u64,
        link: Option<&Arc<PageCacheEntry>>,
    ) -> Arc<PageCacheEntry> {
        debug_assert!(link.is_none_or(|link| link.phys() == phys));

        let mut tree = file.lock.write();
        debug_assert!(
            !tree.entries.contains_key(&offset),
            "entry already cached at this offset",
        );

        let entry = self.create_entry(file, va, phys, offset);
        self.insert_entry(&mut tree, &entry, link);
        self.update_entry_list(&entry, true);
        tracing::trace!(file = file.id(), offset, entry = ?entry, "inserted new entry");
        entry
    }

    fn create_entry(
        &self,
        file: &Arc<FileObject>,
        va: Option<usize>,
        phys: u64,
        offset: u64,
    ) -> Arc<PageCacheEntry> {
        debug_assert!(phys % self.page_size as u64 == 0);
        debug_assert!(
            file.io_type() != IoType::BlockDevice || offset < file.size(),
            "device entry beyond the device size",
        );

        let va = if self.config.disable_virtual_addresses {
            None
        } else {
            va
        };
        PageCacheEntry::new(file.clone(), va, phys, offset)
    }

    /// Wire a freshly created entry into the tree, the counters, and the
    /// frame-sharing protocol.
    fn insert_entry(
        &self,
        tree: &mut FileTree,
        entry: &Arc<PageCacheEntry>,
        link: Option<&Arc<PageCacheEntry>>,
    ) {
        debug_assert_eq!(entry.flags().bits(), 0);

        tree.entries.insert(entry.offset(), entry.clone());
        entry.set_tree_linked(true);
        self.entry_count.fetch_add(1, Ordering::Relaxed);

        let Some(link) = link else {
            // No frame sharing: the new entry owns its frame outright.
            if entry.va().is_some() {
                entry.atomic_flags().fetch_or(ENTRY_MAPPED);
                self.mapped_pages.fetch_add(1, Ordering::Relaxed);
            }
            self.physical_pages.fetch_add(1, Ordering::Relaxed);
            entry.atomic_flags().fetch_or(ENTRY_PAGE_OWNER);
            self.mm.set_frame_owner(entry.phys(), entry);
            return;
        };

        let link_type = link.file().io_type();
        let new_type = entry.file().io_type();
        debug_assert!(link_type != new_type);
        debug_assert!(link_type.is_linkable() && new_type.is_linkable());
        debug_assert!(link.flags().is_page_owner());
        debug_assert!(link.phys() == entry.phys());
        debug_assert!(link.va() == entry.va() || entry.va().is_none());

        if link_type == IoType::BlockDevice && new_type.is_cacheable_file() {
            // The device entry keeps the frame; the new file entry rides it.
            link.add_ref();
            entry.set_backing(link.clone());
        } else {
            debug_assert!(
                link_type.is_cacheable_file() && new_type == IoType::BlockDevice
            );

            // The new device entry adopts the frame from the file entry.
            entry.add_ref();
            link.set_backing(entry.clone());
            let old =
                link.atomic_flags().fetch_clear(ENTRY_PAGE_OWNER | ENTRY_MAPPED);
            debug_assert!(
                !old.is_dirty(),
                "linking would leave a dirty non-owner behind",
            );

            entry.atomic_flags().fetch_or(ENTRY_PAGE_OWNER);
            if old.is_mapped() {
                let va = link.va().expect("mapped entry without a VA");
                debug_assert!(entry.va().is_none_or(|entry_va| entry_va == va));
                entry.store_va(va);
                entry.atomic_flags().fetch_or(ENTRY_MAPPED);
            }
        }
    }

    /// Cache the source buffer's pages for the file and share up to
    /// `copy_size` bytes of them into the destination buffer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn copy_and_cache_io_buffer(
        self: &Arc<Self>,
        file: &Arc<FileObject>,
        file_offset: u64,
        dst: &mut IoBuffer,
        mut copy_size: usize,
        src: &mut IoBuffer,
        source_size: usize,
        source_copy_offset: usize,
    ) -> usize {
        let page_size = self.page_size;
        debug_assert!(source_size % page_size == 0);
        debug_assert!(copy_size % page_size == 0);
        debug_assert!(source_copy_offset % page_size == 0);

        let mut tree = file.lock.write();
        let mut bytes_copied = 0;
        let mut source_offset = 0;
        let mut copy_offset = source_copy_offset;
        let mut file_cursor = file_offset;

        while source_offset < source_size {
            let index = source_offset / page_size;
            let source_entry = src.entry_at(index).map(|entry| entry.entry().clone());
            let phys = src.phys_at(index);
            debug_assert!(
                source_entry
                    .as_ref()
                    .is_none_or(|source| source.phys() == phys),
            );

            // Prefer the source entry's address; fall back to the buffer's
            // mapping and hand ownership of it to the source entry.
            let mut va = source_entry.as_ref().and_then(|source| source.va());
            if va.is_none() {
                if let Some(buffer_va) = src.va_at(index) {
                    va = Some(buffer_va);
                    if let Some(source) = &source_entry {
                        self.set_entry_va(source, buffer_va);
                    }
                }
            }

            let (entry, created) = self.create_or_lookup_in_tree(
                &mut tree,
                file,
                va,
                phys,
                file_cursor,
                source_entry.as_ref(),
            );

            // A fresh entry for a frame the source buffer thought it owned:
            // the buffer must hold the entry or it would free the frame out
            // from under the cache.
            if created && source_entry.is_none() {
                entry.add_ref();
                src.set_entry(index, EntryRef::adopt(self.clone(), entry.clone()));
            }

            if source_offset == copy_offset && copy_size != 0 {
                entry.add_ref();
                dst.push_entry(EntryRef::adopt(self.clone(), entry.clone()));
                copy_offset += page_size;
                copy_size -= page_size;
                bytes_copied += page_size;
            }

            self.release_entry_ref(&entry);
            file_cursor += page_size as u64;
            source_offset += page_size;
        }

        bytes_copied
    }

    /// Whether the buffer's pages for `(file, offset)` are all backed by
    /// live entries of that file. A buffer whose first page is cache backed
    /// is expected to be cache backed throughout.
    pub(crate) fn is_io_buffer_cache_backed(
        &self,
        file: &FileObject,
        buffer: &IoBuffer,
        offset: u64,
        size: usize,
    ) -> bool {
        debug_assert!(buffer.page_count() != 0);

        let page_size = self.page_size;
        let backed = self.buffer_backed_range(file, buffer, offset, page_size);
        debug_assert!(
            !backed
                || self.buffer_backed_range(
                    file,
                    buffer,
                    offset,
                    align_up(size, page_size),
                ),
        );
        backed
    }

    fn buffer_backed_range(
        &self,
        file: &FileObject,
        buffer: &IoBuffer,
        offset: u64,
        size: usize,
    ) -> bool {
        let page_size = self.page_size;
        debug_assert!(size % page_size == 0);

        for index in 0..size / page_size {
            let Some(entry) = buffer.entry_at(index) else {
                return false;
            };
            let entry = entry.entry();
            if entry.file().id() != file.id()
                || !entry.is_tree_linked()
                || entry.offset() != offset + (index * page_size) as u64
            {
                return false;
            }
        }

        true
    }
}
