use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};

/// The entry's page content differs from the backing device.
pub(crate) const ENTRY_DIRTY: u32 = 0b001;
/// The entry owns the physical frame it uses and will free it.
pub(crate) const ENTRY_PAGE_OWNER: u32 = 0b010;
/// The entry's frame is mapped at a kernel virtual address.
///
/// Tracked as a flag, not a check of the stored address, so it can be
/// transitioned atomically together with the dirty flag and keep the mapped
/// and mapped-dirty counters consistent. Only page owners carry it.
pub(crate) const ENTRY_MAPPED: u32 = 0b100;

#[derive(Default)]
/// A set of [EntryFlags] stored within an [AtomicU32].
///
/// Every transition with accounting side effects goes through the fetch
/// operations and applies counter deltas based on the observed previous
/// value, so a racing transition is only counted once.
pub(crate) struct AtomicEntryFlags(AtomicU32);

impl AtomicEntryFlags {
    #[inline]
    pub(crate) fn load(&self) -> EntryFlags {
        EntryFlags(self.0.load(Ordering::Relaxed))
    }

    /// Set the given bits, returning the previous flags.
    pub(crate) fn fetch_or(&self, bits: u32) -> EntryFlags {
        EntryFlags(self.0.fetch_or(bits, Ordering::AcqRel))
    }

    /// Clear the given bits, returning the previous flags.
    pub(crate) fn fetch_clear(&self, bits: u32) -> EntryFlags {
        EntryFlags(self.0.fetch_and(!bits, Ordering::AcqRel))
    }
}

impl Debug for AtomicEntryFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.load().fmt(f)
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
/// A snapshot of an entry's flag word.
pub(crate) struct EntryFlags(u32);

impl EntryFlags {
    #[inline]
    pub(crate) fn is_dirty(self) -> bool {
        self.0 & ENTRY_DIRTY != 0
    }

    #[inline]
    pub(crate) fn is_page_owner(self) -> bool {
        self.0 & ENTRY_PAGE_OWNER != 0
    }

    #[inline]
    pub(crate) fn is_mapped(self) -> bool {
        self.0 & ENTRY_MAPPED != 0
    }

    #[inline]
    pub(crate) fn bits(self) -> u32 {
        self.0
    }
}

impl Debug for EntryFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EntryFlags(dirty={}, page_owner={}, mapped={})",
            self.is_dirty(),
            self.is_page_owner(),
            self.is_mapped(),
        )
    }
}
