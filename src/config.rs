use std::time::Duration;

use crate::mm::MemoryProvider;

/// Percentage of total physical pages the cache tries to keep free before
/// eviction starts.
pub const MEMORY_HEADROOM_PERCENT_TRIGGER: usize = 10;
/// Percentage of total physical pages eviction shoots for once it starts.
pub const MEMORY_HEADROOM_PERCENT_RETREAT: usize = 15;
/// Below this share of physical memory the cache asks for paging out in
/// addition to shrinking itself.
pub const MINIMUM_MEMORY_TARGET_PERCENT: usize = 33;
/// The share of physical memory the cache keeps even when memory is tight.
pub const MINIMUM_MEMORY_PERCENT: usize = 7;
/// Percentage of physical pages that must be clean before the worker's flush
/// pass gives up in favor of evicting entries.
pub const LOW_MEMORY_CLEAN_PAGE_MINIMUM_PERCENT: usize = 10;
/// Upper bound on the low-memory clean-page minimum, in pages.
pub const LOW_MEMORY_CLEAN_PAGE_MAXIMUM: usize = 256;

/// Virtual-address headroom for systems with less than 4 GiB of virtual
/// memory, in bytes.
pub const SMALL_VIRTUAL_HEADROOM_TRIGGER_BYTES: u64 = 512 << 20;
pub const SMALL_VIRTUAL_HEADROOM_RETREAT_BYTES: u64 = 896 << 20;
/// Virtual-address headroom for larger systems, in bytes.
pub const LARGE_VIRTUAL_HEADROOM_TRIGGER_BYTES: u64 = 1 << 30;
pub const LARGE_VIRTUAL_HEADROOM_RETREAT_BYTES: u64 = 3 << 30;

/// The boundary between the small and large virtual headroom profiles.
const SMALL_VIRTUAL_MEMORY_BYTES: u64 = 4 << 30;

/// Maximum number of bytes a single flush write may span.
pub const FLUSH_MAX_BYTES: usize = 128 << 10;
/// Maximum streak of clean pages tolerated inside one flush write before the
/// write is broken up.
pub const FLUSH_MAX_CLEAN_STREAK: usize = 4;
/// The portion of the cache allowed to be dirty, as a shift.
pub const MAX_DIRTY_SHIFT: u32 = 1;

/// Delay between scheduling the worker and the cleaning pass, letting writes
/// pool.
pub const CLEAN_DELAY: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, serde_derive::Serialize, serde_derive::Deserialize)]
/// Configuration options for a [crate::PageCache].
pub struct CacheConfig {
    /// Disable the background worker thread. Trimming and flushing then only
    /// happen when driven explicitly.
    pub disable_worker: bool,
    /// Refuse to attach virtual addresses to cache entries.
    pub disable_virtual_addresses: bool,
    /// Delay between scheduling the worker and the cleaning pass.
    #[serde(default = "default_clean_delay_ms")]
    pub clean_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            disable_worker: false,
            disable_virtual_addresses: false,
            clean_delay_ms: CLEAN_DELAY.as_millis() as u64,
        }
    }
}

fn default_clean_delay_ms() -> u64 {
    CLEAN_DELAY.as_millis() as u64
}

#[derive(Debug, Clone)]
/// Sizing thresholds derived from the memory provider at construction time.
///
/// All counts are in pages unless stated otherwise.
pub(crate) struct Thresholds {
    /// Free physical pages at (or below) which eviction starts.
    pub headroom_pages_trigger: usize,
    /// Free physical pages eviction shoots for once it starts.
    pub headroom_pages_retreat: usize,
    /// Cache size below which paging out is requested to restore headroom.
    pub minimum_pages_target: usize,
    /// Cache size the cache will not shrink below.
    pub minimum_pages: usize,
    /// Clean pages required before the worker's flush pass yields to
    /// eviction in a low memory situation.
    pub low_memory_clean_page_minimum: usize,
    /// Free virtual pages at (or below) which unmapping starts.
    pub virtual_pages_trigger: usize,
    /// Free virtual pages unmapping shoots for once it starts.
    pub virtual_pages_retreat: usize,
    /// Delay before a scheduled cleaning pass runs.
    pub clean_delay: Duration,
}

impl Thresholds {
    pub(crate) fn compute(mm: &dyn MemoryProvider, config: &CacheConfig) -> Self {
        let total_physical = mm.total_physical_pages();
        let page_shift = mm.page_shift();

        let low_memory_clean_page_minimum = usize::min(
            total_physical * LOW_MEMORY_CLEAN_PAGE_MINIMUM_PERCENT / 100,
            LOW_MEMORY_CLEAN_PAGE_MAXIMUM,
        );

        let total_virtual = mm.total_virtual_bytes();
        let (virtual_trigger_bytes, virtual_retreat_bytes) =
            if total_virtual < SMALL_VIRTUAL_MEMORY_BYTES {
                (
                    SMALL_VIRTUAL_HEADROOM_TRIGGER_BYTES,
                    SMALL_VIRTUAL_HEADROOM_RETREAT_BYTES,
                )
            } else {
                (
                    LARGE_VIRTUAL_HEADROOM_TRIGGER_BYTES,
                    LARGE_VIRTUAL_HEADROOM_RETREAT_BYTES,
                )
            };

        Self {
            headroom_pages_trigger: total_physical * MEMORY_HEADROOM_PERCENT_TRIGGER
                / 100,
            headroom_pages_retreat: total_physical * MEMORY_HEADROOM_PERCENT_RETREAT
                / 100,
            minimum_pages_target: total_physical * MINIMUM_MEMORY_TARGET_PERCENT / 100,
            minimum_pages: total_physical * MINIMUM_MEMORY_PERCENT / 100,
            low_memory_clean_page_minimum,
            virtual_pages_trigger: (virtual_trigger_bytes >> page_shift) as usize,
            virtual_pages_retreat: (virtual_retreat_bytes >> page_shift) as usize,
            clean_delay: Duration::from_millis(config.clean_delay_ms),
        }
    }
}
