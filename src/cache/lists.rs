use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use super::PageCacheEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// Which list an entry currently belongs to.
pub(crate) enum ListTag {
    /// Not on any list.
    Detached = 0,
    /// The global clean LRU.
    Clean = 1,
    /// The global LRU of clean entries with no kernel virtual address.
    CleanUnmapped = 2,
    /// Evicted entries awaiting destruction once their references drop.
    Removal = 3,
    /// The owning file's dirty list.
    Dirty = 4,
}

impl ListTag {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ListTag::Detached,
            1 => ListTag::Clean,
            2 => ListTag::CleanUnmapped,
            3 => ListTag::Removal,
            4 => ListTag::Dirty,
            _ => unreachable!("invalid list tag"),
        }
    }
}

/// A queued position of an entry on a list.
///
/// Slots do not keep entries alive and do not guarantee membership: a slot is
/// honored only if the entry still exists, its stamp matches the stamp
/// recorded here, and the tag CAS from the expected list wins. Everything
/// else is a stale position left behind by a later transition and is skipped
/// when the list drains.
pub(crate) struct ListSlot {
    entry: Weak<PageCacheEntry>,
    stamp: u64,
}

impl ListSlot {
    /// Resolve the slot's entry without taking it off the list.
    pub(crate) fn peek(&self, tag: ListTag) -> Option<Arc<PageCacheEntry>> {
        let entry = self.entry.upgrade()?;
        (entry.list_stamp() == self.stamp && entry.list_tag() == tag).then_some(entry)
    }
}

/// Queue an entry at the tail of `deque`, claiming membership of `tag`.
///
/// Returns `false` if the entry was not detached, in which case someone else
/// owns its list placement and the push is dropped.
pub(crate) fn push_tail(
    deque: &mut VecDeque<ListSlot>,
    entry: &Arc<PageCacheEntry>,
    tag: ListTag,
) -> bool {
    let Some(stamp) = entry.try_assign_list(tag) else {
        return false;
    };
    deque.push_back(ListSlot {
        entry: Arc::downgrade(entry),
        stamp,
    });
    true
}

/// Resolve a popped slot into its entry, claiming it off the list.
///
/// Returns `None` for stale slots: destroyed entries, outdated stamps, and
/// entries another thread already moved elsewhere.
pub(crate) fn claim(slot: ListSlot, tag: ListTag) -> Option<Arc<PageCacheEntry>> {
    let entry = slot.entry.upgrade()?;
    if entry.list_stamp() != slot.stamp {
        return None;
    }
    if !entry.try_claim_list(tag) {
        return None;
    }
    Some(entry)
}

#[derive(Default)]
/// The global cache lists, all guarded by the one list lock.
///
/// The clean LRU runs least to most recently used front to back and mostly
/// holds clean entries, though a racing dirty-marker may leave one briefly.
/// The clean-unmapped LRU holds entries the unmap loop has already stripped
/// of virtual addresses; they are colder than the clean list and evicted
/// first. The removal list holds entries that are out of their trees but
/// still referenced.
pub(crate) struct GlobalLists {
    pub(crate) clean: VecDeque<ListSlot>,
    pub(crate) clean_unmapped: VecDeque<ListSlot>,
    pub(crate) removal: VecDeque<ListSlot>,
}

impl GlobalLists {
    pub(crate) fn deque_mut(&mut self, tag: ListTag) -> &mut VecDeque<ListSlot> {
        match tag {
            ListTag::Clean => &mut self.clean,
            ListTag::CleanUnmapped => &mut self.clean_unmapped,
            ListTag::Removal => &mut self.removal,
            ListTag::Detached | ListTag::Dirty => {
                unreachable!("not a global list")
            },
        }
    }
}
