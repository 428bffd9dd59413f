use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use smallvec::SmallVec;

use super::entry::PageCacheEntry;
use super::lists::{ListSlot, ListTag};
use super::CacheInner;
use crate::config::{FLUSH_MAX_BYTES, FLUSH_MAX_CLEAN_STREAK};
use crate::error::CacheError;
use crate::utils::align_down;
use crate::vfs::{FileObject, FlushPage, IoType};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Behavior flags for [crate::PageCache::flush].
pub struct FlushFlags {
    /// The caller needs the data on stable storage when the flush returns:
    /// clean entries whose backing owner is still dirty are written too, and
    /// the device sync that normally follows a block-device flush is the
    /// caller's problem.
    pub synchronized: bool,
}

impl FlushFlags {
    /// Flags for a data-synchronized flush.
    pub fn synchronized() -> Self {
        Self { synchronized: true }
    }
}

impl CacheInner {
    /// Flush the file's dirty pages in `[offset, offset + size)` to the
    /// non-cached write path, coalescing contiguous pages into large writes.
    ///
    /// A whole-file flush iterates the file's dirty list, walking the tree
    /// from each dirty page to pick up contiguous neighbors instead of
    /// scanning every clean entry. A ranged flush walks the tree from the
    /// range's lower bound. Up to [FLUSH_MAX_CLEAN_STREAK] clean pages are
    /// tolerated inside a run to keep writes batched across small gaps.
    ///
    /// When called on the worker thread, the flush bails out with
    /// [CacheError::TryAgain] if memory pressure would be better served by
    /// evicting already-clean pages first.
    pub(crate) fn flush(
        &self,
        file: &Arc<FileObject>,
        offset: u64,
        size: Option<u64>,
        flags: FlushFlags,
        page_cap: Option<usize>,
    ) -> Result<(), CacheError> {
        debug_assert!(size.is_none_or(|size| offset.checked_add(size).is_some()));

        // Optimistically mark the file clean; failures re-mark it below.
        let whole_file = offset == 0 && size.is_none() && page_cap.is_none();
        if whole_file {
            file.clear_dirty_data();
        }

        if !file.io_type().is_cacheable() {
            return Ok(());
        }
        if file.dirty_pages.lock().is_empty() {
            return Ok(());
        }

        let worker = self.is_worker_thread();
        let page_size = self.page_size;
        let page_shift = self.page_shift;
        let max_pages = FLUSH_MAX_BYTES / page_size;

        let mut buffer: Vec<Arc<PageCacheEntry>> = Vec::with_capacity(max_pages);
        let mut flush_size = 0usize;
        let mut next_offset = offset;
        let mut clean_streak = 0usize;
        let mut pages_flushed = 0usize;
        let mut bytes_flushed = false;
        let mut try_again = false;
        let mut total_result: Result<(), CacheError> = Ok(());

        // Whole-file flushes drain the dirty list through a local queue so
        // clean entries are never rescanned; ranged flushes iterate the tree.
        let range_mode = offset != 0 || size.is_some();
        let mut local_list: VecDeque<ListSlot> = VecDeque::new();
        if !range_mode {
            let mut dirty = file.dirty_pages.lock();
            local_list = std::mem::take(&mut *dirty);
        }

        let mut guard = file.lock.read();
        let mut cursor: Option<u64> = None;
        let mut seeded = false;

        loop {
            let entry = match cursor {
                Some(position) => guard.next_after(position).cloned(),
                None if range_mode => {
                    if seeded {
                        None
                    } else {
                        seeded = true;
                        guard.lower_bound(offset).cloned()
                    }
                },
                None => peek_local_front(&mut local_list),
            };

            let Some(entry) = entry else {
                break;
            };
            cursor = Some(entry.offset());

            if let Some(size) = size {
                if entry.offset() >= offset + size {
                    break;
                }
            }
            debug_assert!(Arc::ptr_eq(entry.file(), file));

            let mut skip = false;
            if !entry.flags().is_dirty() {
                skip = true;

                // A synchronized flush owes the caller the backing owner's
                // content on stable storage too.
                if flags.synchronized {
                    if let Some(backing) = entry.backing() {
                        if backing.flags().is_dirty() {
                            skip = false;
                        }
                    }
                }

                // Tolerate a short streak of clean pages to batch up writes.
                if flush_size != 0
                    && entry.offset() == next_offset
                    && clean_streak < FLUSH_MAX_CLEAN_STREAK
                {
                    clean_streak += 1;
                    skip = false;
                }
            } else {
                clean_streak = 0;
            }

            if skip {
                if !range_mode {
                    cursor = None;
                }
                continue;
            }

            pages_flushed += 1;

            // Contiguous pages pile into the pending buffer until it fills.
            let mut pending = Some(entry.clone());
            if flush_size == 0 || entry.offset() == next_offset {
                entry.add_ref();
                buffer.push(entry.clone());
                flush_size += page_size;
                next_offset = entry.offset() + page_size as u64;
                if flush_size < FLUSH_MAX_BYTES {
                    continue;
                }
                pending = None;
            }

            // Trailing clean pages never justify a write on their own.
            debug_assert!(flush_size > clean_streak << page_shift);
            let write_size = flush_size - (clean_streak << page_shift);
            match self.flush_buffer(file, &buffer, write_size, flags) {
                Ok(()) => bytes_flushed = true,
                Err(error) => {
                    if total_result.is_ok() {
                        total_result = Err(error);
                    }
                },
            }

            for flushed in buffer.drain(..) {
                self.release_entry_ref(&flushed);
            }
            flush_size = 0;
            clean_streak = 0;

            if let Some(cap) = page_cap {
                if pages_flushed >= cap {
                    break;
                }
            }

            match pending {
                // The entry that broke the run seeds the next buffer.
                Some(entry) => {
                    entry.add_ref();
                    next_offset = entry.offset() + page_size as u64;
                    flush_size = page_size;
                    buffer.push(entry);
                },
                None => {
                    if !range_mode {
                        cursor = None;
                    }
                },
            }

            if worker {
                // Under memory pressure, eviction of already-clean pages
                // beats flushing more, once enough of them exist.
                if self.is_too_big().is_some() {
                    let physical = self.physical_pages.load(Ordering::Relaxed);
                    let dirty = self.dirty_pages.load(Ordering::Relaxed);
                    if physical.saturating_sub(dirty)
                        > self.thresholds.low_memory_clean_page_minimum
                    {
                        try_again = true;
                        break;
                    }
                }

                // If others are trying to get in, be polite.
                if file.lock.is_contended() {
                    drop(guard);
                    guard = file.lock.read();
                }
            }
        }

        if !try_again {
            debug_assert!(flush_size >= clean_streak << page_shift);
            let write_size = flush_size - (clean_streak << page_shift);
            if write_size != 0 {
                match self.flush_buffer(file, &buffer, write_size, flags) {
                    Ok(()) => bytes_flushed = true,
                    Err(error) => {
                        if total_result.is_ok() {
                            total_result = Err(error);
                        }
                    },
                }
            }
        }

        for flushed in buffer.drain(..) {
            self.release_entry_ref(&flushed);
        }
        drop(guard);

        // Anything not reached goes back on the dirty list.
        if !local_list.is_empty() {
            file.dirty_pages.lock().append(&mut local_list);
        }

        if try_again && total_result.is_ok() {
            total_result = Err(CacheError::TryAgain);
        }

        // The worker retries files that did not come fully clean.
        if total_result.is_err() {
            self.mark_file_dirty(file);
        }

        // Unsynchronized block-device writes still need to hit the platter.
        if bytes_flushed
            && file.io_type() == IoType::BlockDevice
            && !flags.synchronized
        {
            if let Err(error) = file.writer().synchronize_device(file) {
                if total_result.is_ok() {
                    total_result = Err(error.into());
                }
            }
        }

        total_result
    }

    /// Write one contiguous run of pages through the non-cached write path.
    ///
    /// Every page is first marked clean; if none of them made the
    /// dirty-to-clean transition here, another flusher owns the write and
    /// this one returns early (unless the flush is synchronized). On error
    /// or short write, the unwritten pages are re-marked dirty.
    fn flush_buffer(
        &self,
        file: &Arc<FileObject>,
        buffer: &[Arc<PageCacheEntry>],
        write_size: usize,
        flags: FlushFlags,
    ) -> Result<(), CacheError> {
        debug_assert!(write_size <= FLUSH_MAX_BYTES);

        let page_size = self.page_size;
        let page_count = write_size / page_size;
        debug_assert!(write_size % page_size == 0 && page_count <= buffer.len());

        let file_offset = buffer[0].offset();
        let file_size = file.size();

        // Pages evicted since they were buffered end the write early; the
        // file was truncated underneath them.
        let mut clean = true;
        let mut bytes_to_write = 0usize;
        for entry in &buffer[..page_count] {
            if !entry.is_tree_linked() {
                break;
            }
            if self.mark_entry_clean(entry, true) {
                clean = false;
            }
            bytes_to_write += page_size;
        }

        // Avoid writing beyond the end of the file.
        if file_offset + bytes_to_write as u64 > file_size {
            debug_assert!(file_offset <= file_size);
            bytes_to_write = file_size.saturating_sub(file_offset) as usize;
        }

        if bytes_to_write == 0 {
            return Ok(());
        }

        // All clean already means another flusher is writing these pages.
        // Synchronized flushes write anyway: the dirt may live in backing
        // entries this layer has no jurisdiction over.
        if clean && !flags.synchronized {
            return Ok(());
        }

        let pages: SmallVec<[FlushPage; 8]> = buffer
            [..bytes_to_write.div_ceil(page_size)]
            .iter()
            .map(|entry| FlushPage {
                phys: entry.phys(),
                va: entry.va(),
            })
            .collect();

        let result = file.writer().write_pages(
            file,
            file_offset,
            &pages,
            bytes_to_write,
            flags.synchronized,
        );

        let (bytes_completed, status) = match result {
            Ok(written) if written == bytes_to_write => {
                tracing::trace!(
                    file = file.id(),
                    offset = file_offset,
                    size = bytes_to_write,
                    "flushed pages",
                );
                return Ok(());
            },
            Ok(written) => (
                written,
                CacheError::DataLengthMismatch {
                    written,
                    expected: bytes_to_write,
                },
            ),
            Err(error) => (0, CacheError::Io(error)),
        };

        tracing::debug!(
            file = file.id(),
            offset = file_offset,
            size = bytes_to_write,
            bytes_completed,
            error = %status,
            "flush write failed",
        );

        // The pages that did not make it out are dirty again.
        let mut buffer_offset = align_down(bytes_completed, page_size);
        while buffer_offset < bytes_to_write {
            self.mark_dirty_with_lock(&buffer[buffer_offset / page_size]);
            buffer_offset += page_size;
        }
        self.mark_file_dirty(file);

        Err(status)
    }

    /// Flush every file object queued as dirty; the worker's cleaning pass.
    ///
    /// [CacheError::TryAgain] propagates immediately with the unprocessed
    /// remainder requeued; other failures are remembered while the pass
    /// keeps going (failed files requeue themselves through the dirty
    /// marking in [CacheInner::flush]).
    pub(crate) fn flush_dirty_file_objects(
        &self,
        flags: FlushFlags,
        page_cap: Option<usize>,
    ) -> Result<(), CacheError> {
        let files = std::mem::take(&mut *self.dirty_files.lock());
        let mut first_error: Result<(), CacheError> = Ok(());

        let mut pending = files.into_iter();
        while let Some(weak) = pending.next() {
            let Some(file) = weak.upgrade() else {
                continue;
            };
            if !file.has_dirty_data() {
                continue;
            }

            match self.flush(&file, 0, None, flags, page_cap) {
                Ok(()) => {},
                Err(CacheError::TryAgain) => {
                    // The flush already re-queued this file; keep the rest.
                    self.dirty_files.lock().extend(pending);
                    return Err(CacheError::TryAgain);
                },
                Err(error) => {
                    if first_error.is_ok() {
                        first_error = Err(error);
                    }
                },
            }
        }

        first_error
    }
}

/// The next still-dirty entry at the front of a drained dirty list. Slots
/// whose entries were cleaned or evicted in the meantime are discarded.
fn peek_local_front(local: &mut VecDeque<ListSlot>) -> Option<Arc<PageCacheEntry>> {
    while let Some(slot) = local.front() {
        if let Some(entry) = slot.peek(ListTag::Dirty) {
            return Some(entry);
        }
        local.pop_front();
    }
    None
}
