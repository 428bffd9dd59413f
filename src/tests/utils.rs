use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::mm::SyntheticMemory;
use crate::vfs::{FileObject, FlushPage, IoType, PageWriter};
use crate::{CacheConfig, EntryRef, PageCache};

pub(crate) const PAGE: usize = 4096;

/// A writer for tests that never look at the written data.
pub(crate) fn null_writer() -> Arc<dyn PageWriter> {
    struct NullWriter;

    impl PageWriter for NullWriter {
        fn write_pages(
            &self,
            _file: &FileObject,
            _offset: u64,
            _pages: &[FlushPage],
            len: usize,
            _synchronized: bool,
        ) -> io::Result<usize> {
            Ok(len)
        }

        fn synchronize_device(&self, _file: &FileObject) -> io::Result<()> {
            Ok(())
        }
    }

    Arc::new(NullWriter)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WriteRecord {
    pub offset: u64,
    pub len: usize,
    pub bytes: Vec<u8>,
    pub synchronized: bool,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum WriterFailure {
    /// Refuse the next write outright.
    Error,
    /// Complete only this many bytes of the next write.
    Short(usize),
}

/// A writer that records every write, reading page content out of the
/// synthetic memory provider's frames.
pub(crate) struct RecordingWriter {
    mm: Arc<SyntheticMemory>,
    writes: Mutex<Vec<WriteRecord>>,
    syncs: AtomicUsize,
    queued_failures: Mutex<Vec<WriterFailure>>,
}

impl RecordingWriter {
    pub(crate) fn new(mm: Arc<SyntheticMemory>) -> Arc<Self> {
        Arc::new(Self {
            mm,
            writes: Mutex::new(Vec::new()),
            syncs: AtomicUsize::new(0),
            queued_failures: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().clone()
    }

    pub(crate) fn sync_count(&self) -> usize {
        self.syncs.load(Ordering::Relaxed)
    }

    /// Fail the next write with the given outcome. Queued failures apply in
    /// order, one per write.
    pub(crate) fn fail_next(&self, failure: WriterFailure) {
        self.queued_failures.lock().push(failure);
    }
}

impl PageWriter for RecordingWriter {
    fn write_pages(
        &self,
        _file: &FileObject,
        offset: u64,
        pages: &[FlushPage],
        len: usize,
        synchronized: bool,
    ) -> io::Result<usize> {
        let next_failure = {
            let mut queued = self.queued_failures.lock();
            if queued.is_empty() {
                None
            } else {
                Some(queued.remove(0))
            }
        };
        match next_failure {
            Some(WriterFailure::Error) => {
                return Err(io::Error::other("injected write failure"));
            },
            Some(WriterFailure::Short(completed)) => {
                return Ok(completed);
            },
            None => {},
        }

        let mut bytes = Vec::with_capacity(len);
        for page in pages {
            let frame = self.mm.frame_bytes(page.phys);
            let take = usize::min(PAGE, len - bytes.len());
            bytes.extend_from_slice(&frame[..take]);
            if bytes.len() == len {
                break;
            }
        }

        self.writes.lock().push(WriteRecord {
            offset,
            len,
            bytes,
            synchronized,
        });
        Ok(len)
    }

    fn synchronize_device(&self, _file: &FileObject) -> io::Result<()> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A cache over synthetic memory with a recording writer, the usual test
/// rig. The background worker stays disabled unless asked for.
pub(crate) struct TestCache {
    pub cache: PageCache,
    pub mm: Arc<SyntheticMemory>,
    pub writer: Arc<RecordingWriter>,
}

impl TestCache {
    pub(crate) fn new(total_physical_pages: usize) -> Self {
        Self::with_config(
            total_physical_pages,
            CacheConfig {
                disable_worker: true,
                ..CacheConfig::default()
            },
        )
    }

    pub(crate) fn with_config(total_physical_pages: usize, config: CacheConfig) -> Self {
        let mm = Arc::new(SyntheticMemory::new(PAGE, total_physical_pages));
        let writer = RecordingWriter::new(mm.clone());
        let cache = PageCache::new(mm.clone(), config).expect("create page cache");
        Self { cache, mm, writer }
    }

    pub(crate) fn file(&self, id: u64, io_type: IoType, size: u64) -> Arc<FileObject> {
        FileObject::new(id, io_type, size, self.writer.clone())
    }

    /// Allocate a frame and cache it for the file at `offset`.
    pub(crate) fn cache_page(
        &self,
        file: &Arc<FileObject>,
        offset: u64,
        contents: &[u8],
    ) -> EntryRef {
        let phys = self.mm.allocate_frame();
        self.mm.write_frame(phys, 0, contents);
        let (entry, created) = self.cache.create_or_lookup(file, None, phys, offset, None);
        assert!(created);
        entry
    }
}
