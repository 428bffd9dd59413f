use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use foldhash::{HashMap, HashMapExt};
use parking_lot::Mutex;

use crate::cache::PageCacheEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A warning raised by the memory provider when a resource runs low.
pub enum MemoryWarning {
    /// Free physical pages are running low.
    Physical,
    /// Free virtual address space is running low.
    Virtual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// The memory provider's current virtual address space warning level.
pub enum VirtualWarningLevel {
    #[default]
    /// Virtual address space is plentiful.
    None,
    /// Virtual address space is constrained and consumers should shed
    /// mappings.
    Elevated,
}

/// The memory-management interface the page cache consumes.
///
/// The cache holds exactly one owner reference per physical frame in use;
/// frames and virtual mappings remain the provider's property. Implementations
/// must be safe to call from the cache worker thread concurrently with
/// foreground operations.
pub trait MemoryProvider: Send + Sync + 'static {
    /// The size of one page in bytes. Must be a power of two.
    fn page_size(&self) -> usize;

    /// log2 of the page size.
    fn page_shift(&self) -> u32 {
        self.page_size().trailing_zeros()
    }

    /// Total physical pages in the system.
    fn total_physical_pages(&self) -> usize;

    /// Physical pages currently free.
    fn free_physical_pages(&self) -> usize;

    /// Total virtual address space in bytes.
    fn total_virtual_bytes(&self) -> u64;

    /// Free virtual address space in bytes.
    fn free_virtual_bytes(&self) -> u64;

    /// The current virtual address space warning level.
    fn virtual_warning_level(&self) -> VirtualWarningLevel;

    /// Ask the provider to page out enough memory to reach the given number
    /// of free physical pages.
    fn request_paging_out(&self, free_page_target: usize);

    /// Release a physical frame back to the provider.
    fn free_physical_page(&self, phys: u64);

    /// Unmap a contiguous virtual address range.
    fn unmap_address(&self, va: usize, len: usize);

    /// Record which cache entry owns the given physical frame.
    fn set_frame_owner(&self, phys: u64, entry: &Arc<PageCacheEntry>);

    /// Unmap the given file range from any image sections mapping it.
    ///
    /// Returns whether one of the unmapped mappings had dirtied the page.
    fn unmap_image_sections(
        &self,
        file_id: u64,
        offset: u64,
        len: usize,
        page_cache_only: bool,
    ) -> io::Result<bool>;

    /// The channel on which the provider publishes memory warnings.
    fn warning_events(&self) -> Receiver<MemoryWarning>;
}

/// An in-memory [MemoryProvider] for tests and embedders' harnesses.
///
/// Frames are plain heap buffers addressed by synthetic physical addresses;
/// free-page counts, virtual memory figures and warning levels are knobs the
/// test sets explicitly rather than values derived from the frame table.
pub struct SyntheticMemory {
    page_size: usize,
    total_physical: usize,
    free_physical: AtomicUsize,
    total_virtual: AtomicU64,
    free_virtual: AtomicU64,
    virtual_warning: Mutex<VirtualWarningLevel>,
    next_phys: AtomicU64,
    frames: Mutex<HashMap<u64, Vec<u8>>>,
    freed_frames: Mutex<Vec<u64>>,
    unmapped_ranges: Mutex<Vec<(usize, usize)>>,
    paging_out_requests: Mutex<Vec<usize>>,
    frame_owners: Mutex<HashMap<u64, std::sync::Weak<PageCacheEntry>>>,
    dirty_image_sections: Mutex<HashMap<(u64, u64), bool>>,
    failing_image_section_files: Mutex<Vec<u64>>,
    warning_tx: Sender<MemoryWarning>,
    warning_rx: Receiver<MemoryWarning>,
}

impl SyntheticMemory {
    /// Create a provider with the given page size and total physical pages.
    ///
    /// Free physical pages start at the total; virtual memory defaults to a
    /// large (64 GiB) address space with everything free.
    pub fn new(page_size: usize, total_physical_pages: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");

        let (warning_tx, warning_rx) = crossbeam_channel::unbounded();
        Self {
            page_size,
            total_physical: total_physical_pages,
            free_physical: AtomicUsize::new(total_physical_pages),
            total_virtual: AtomicU64::new(64 << 30),
            free_virtual: AtomicU64::new(64 << 30),
            virtual_warning: Mutex::new(VirtualWarningLevel::None),
            next_phys: AtomicU64::new(page_size as u64),
            frames: Mutex::new(HashMap::new()),
            freed_frames: Mutex::new(Vec::new()),
            unmapped_ranges: Mutex::new(Vec::new()),
            paging_out_requests: Mutex::new(Vec::new()),
            frame_owners: Mutex::new(HashMap::new()),
            dirty_image_sections: Mutex::new(HashMap::new()),
            failing_image_section_files: Mutex::new(Vec::new()),
            warning_tx,
            warning_rx,
        }
    }

    /// Override the total (and free) virtual memory size in bytes.
    pub fn with_virtual_memory(self, total_virtual: u64) -> Self {
        self.total_virtual.store(total_virtual, Ordering::Relaxed);
        self.free_virtual.store(total_virtual, Ordering::Relaxed);
        self
    }

    /// Allocate a zeroed frame and return its physical address.
    pub fn allocate_frame(&self) -> u64 {
        let phys = self
            .next_phys
            .fetch_add(self.page_size as u64, Ordering::Relaxed);
        self.frames.lock().insert(phys, vec![0; self.page_size]);
        phys
    }

    /// Write bytes into a frame at the given offset.
    pub fn write_frame(&self, phys: u64, offset: usize, bytes: &[u8]) {
        let mut frames = self.frames.lock();
        let frame = frames.get_mut(&phys).expect("frame not allocated");
        frame[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Read a full copy of the frame's contents.
    pub fn frame_bytes(&self, phys: u64) -> Vec<u8> {
        self.frames.lock().get(&phys).expect("frame not allocated").clone()
    }

    /// Returns `true` if the frame is still allocated.
    pub fn frame_is_live(&self, phys: u64) -> bool {
        self.frames.lock().contains_key(&phys)
    }

    /// Set the number of free physical pages reported to the cache.
    pub fn set_free_physical_pages(&self, free: usize) {
        self.free_physical.store(free, Ordering::Relaxed);
    }

    /// Set the free virtual memory reported to the cache, in bytes.
    pub fn set_free_virtual_bytes(&self, free: u64) {
        self.free_virtual.store(free, Ordering::Relaxed);
    }

    /// Set the virtual warning level reported to the cache.
    pub fn set_virtual_warning(&self, level: VirtualWarningLevel) {
        *self.virtual_warning.lock() = level;
    }

    /// Publish a memory warning to the cache worker.
    pub fn raise_warning(&self, warning: MemoryWarning) {
        let _ = self.warning_tx.send(warning);
    }

    /// Frames released via [MemoryProvider::free_physical_page], in order.
    pub fn freed_frames(&self) -> Vec<u64> {
        self.freed_frames.lock().clone()
    }

    /// Virtual ranges released via [MemoryProvider::unmap_address], in order.
    pub fn unmapped_ranges(&self) -> Vec<(usize, usize)> {
        self.unmapped_ranges.lock().clone()
    }

    /// Free-page targets passed to [MemoryProvider::request_paging_out].
    pub fn paging_out_requests(&self) -> Vec<usize> {
        self.paging_out_requests.lock().clone()
    }

    /// The entry registered as owner of the given frame, if it is still
    /// alive.
    pub fn frame_owner(&self, phys: u64) -> Option<Arc<PageCacheEntry>> {
        self.frame_owners.lock().get(&phys).and_then(|weak| weak.upgrade())
    }

    /// Report that an image section has dirtied the page at the given file
    /// offset. The next image-section unmap covering it returns dirty once.
    pub fn set_image_section_dirty(&self, file_id: u64, offset: u64) {
        self.dirty_image_sections.lock().insert((file_id, offset), true);
    }

    /// Make image-section unmaps for the given file fail.
    pub fn fail_image_section_unmaps(&self, file_id: u64) {
        self.failing_image_section_files.lock().push(file_id);
    }
}

impl MemoryProvider for SyntheticMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn total_physical_pages(&self) -> usize {
        self.total_physical
    }

    fn free_physical_pages(&self) -> usize {
        self.free_physical.load(Ordering::Relaxed)
    }

    fn total_virtual_bytes(&self) -> u64 {
        self.total_virtual.load(Ordering::Relaxed)
    }

    fn free_virtual_bytes(&self) -> u64 {
        self.free_virtual.load(Ordering::Relaxed)
    }

    fn virtual_warning_level(&self) -> VirtualWarningLevel {
        *self.virtual_warning.lock()
    }

    fn request_paging_out(&self, free_page_target: usize) {
        self.paging_out_requests.lock().push(free_page_target);
    }

    fn free_physical_page(&self, phys: u64) {
        let removed = self.frames.lock().remove(&phys);
        assert!(removed.is_some(), "freeing a frame that was never allocated");
        self.freed_frames.lock().push(phys);
    }

    fn unmap_address(&self, va: usize, len: usize) {
        self.unmapped_ranges.lock().push((va, len));
    }

    fn set_frame_owner(&self, phys: u64, entry: &Arc<PageCacheEntry>) {
        self.frame_owners.lock().insert(phys, Arc::downgrade(entry));
    }

    fn unmap_image_sections(
        &self,
        file_id: u64,
        offset: u64,
        len: usize,
        _page_cache_only: bool,
    ) -> io::Result<bool> {
        if self.failing_image_section_files.lock().contains(&file_id) {
            return Err(io::Error::other("image section unmap refused"));
        }

        let mut sections = self.dirty_image_sections.lock();
        let mut was_dirty = false;
        let mut cursor = offset;
        while cursor < offset + len as u64 {
            if sections.remove(&(file_id, cursor)).is_some() {
                was_dirty = true;
            }
            cursor += self.page_size as u64;
        }

        Ok(was_dirty)
    }

    fn warning_events(&self) -> Receiver<MemoryWarning> {
        self.warning_rx.clone()
    }
}
