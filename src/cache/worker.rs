use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{never, Receiver, RecvError};

use super::flush::FlushFlags;
use super::CacheInner;
use crate::error::CacheError;
use crate::mm::MemoryWarning;

/// No cleaning pass is pending.
pub(crate) const STATE_CLEAN: u32 = 0;
/// A cleaning pass is scheduled or running.
pub(crate) const STATE_DIRTY: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerSignal {
    /// Arm the clean-delay timer for a cleaning pass.
    Schedule,
    /// The cache is going away.
    Shutdown,
}

impl CacheInner {
    /// Schedule a cleaning pass for after the clean delay, so writes pool
    /// before the worker runs. Only the transition from clean arms the
    /// timer.
    pub(crate) fn schedule_worker(&self) {
        // Quick exit without the atomic first.
        if self.worker_state.load(Ordering::Relaxed) == STATE_DIRTY {
            return;
        }

        let won = self
            .worker_state
            .compare_exchange(
                STATE_CLEAN,
                STATE_DIRTY,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            let _ = self.worker_tx.send(WorkerSignal::Schedule);
        }
    }

    /// Whether the calling thread is the cache's background worker.
    pub(crate) fn is_worker_thread(&self) -> bool {
        self.worker_thread.get() == Some(&std::thread::current().id())
    }

    fn record_clean_time(&self) {
        let elapsed = self.created_at.elapsed().as_millis() as u64;
        self.last_clean_millis.store(elapsed, Ordering::Relaxed);
    }
}

enum Wake {
    /// Run a cleaning pass.
    Run,
    /// Exit the worker thread.
    Exit,
}

/// The single background task of the cache.
///
/// It sleeps on the schedule timer and the memory provider's warning events,
/// and on every wake runs the removal-drain, trim, flush loop until the
/// flush engine stops asking for re-trims.
pub(crate) struct CacheWorker {
    inner: Weak<CacheInner>,
    signals: Receiver<WorkerSignal>,
    warnings: Receiver<MemoryWarning>,
    clean_delay: Duration,
    deadline: Option<Instant>,
}

impl CacheWorker {
    pub(crate) fn spawn(
        inner: &Arc<CacheInner>,
        signals: Receiver<WorkerSignal>,
    ) -> io::Result<JoinHandle<()>> {
        let worker = CacheWorker {
            inner: Arc::downgrade(inner),
            signals,
            warnings: inner.mm.warning_events(),
            clean_delay: inner.thresholds.clean_delay,
            deadline: None,
        };

        std::thread::Builder::new()
            .name("page_cache_worker".to_string())
            .spawn(move || worker.run())
    }

    fn run(mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let _ = inner.worker_thread.set(std::thread::current().id());
        }
        tracing::debug!("page cache worker is starting...");

        loop {
            match self.wait_for_wake() {
                Wake::Exit => break,
                Wake::Run => {},
            }

            let Some(inner) = self.inner.upgrade() else {
                break;
            };
            self.run_cleaning_pass(&inner);
        }

        tracing::debug!("page cache worker is exiting");
    }

    /// Sleep until the armed deadline passes or a warning arrives. Schedule
    /// signals arm the deadline without waking the cleaning pass.
    fn wait_for_wake(&mut self) -> Wake {
        enum Event {
            Signal(Result<WorkerSignal, RecvError>),
            Warning(Result<MemoryWarning, RecvError>),
            Timer,
        }

        loop {
            let event = if let Some(deadline) = self.deadline {
                let timeout = deadline.saturating_duration_since(Instant::now());
                crossbeam_channel::select! {
                    recv(self.signals) -> msg => Event::Signal(msg),
                    recv(self.warnings) -> msg => Event::Warning(msg),
                    default(timeout) => Event::Timer,
                }
            } else {
                crossbeam_channel::select! {
                    recv(self.signals) -> msg => Event::Signal(msg),
                    recv(self.warnings) -> msg => Event::Warning(msg),
                }
            };

            match event {
                Event::Signal(Ok(WorkerSignal::Schedule)) => {
                    self.deadline = Some(Instant::now() + self.clean_delay);
                },
                Event::Signal(Ok(WorkerSignal::Shutdown)) | Event::Signal(Err(_)) => {
                    return Wake::Exit;
                },
                Event::Warning(Ok(warning)) => {
                    tracing::debug!(warning = ?warning, "memory warning");
                    return Wake::Run;
                },
                Event::Warning(Err(_)) => {
                    // The provider dropped its warning channel; run off the
                    // timer alone from here on.
                    self.warnings = never();
                },
                Event::Timer => return Wake::Run,
            }
        }
    }

    /// One wake of the worker: loop over removal draining, trimming, and
    /// flushing until the flush pass stops yielding to eviction, then go
    /// dormant unless dirt snuck in meanwhile.
    fn run_cleaning_pass(&mut self, inner: &Arc<CacheInner>) {
        inner.record_clean_time();

        loop {
            inner.drain_removal_list();

            // This is the root of the worker, no file locks are held higher
            // up the stack, so a full-effort trim is safe.
            inner.trim(false);

            let result = inner.flush_dirty_file_objects(FlushFlags::default(), None);
            match result {
                Err(CacheError::TryAgain) => continue,
                Err(error) => {
                    tracing::warn!(error = %error, "cleaning pass failed; will retry");
                },
                Ok(()) => {},
            }

            self.log_status(inner);

            // Kill the timer and go clean, then re-check whether dirtiness
            // snuck in while that happened; if so, race everyone else to
            // re-schedule.
            self.deadline = None;
            inner.worker_state.store(STATE_CLEAN, Ordering::SeqCst);
            let files_dirty = !inner.dirty_files.lock().is_empty();
            if files_dirty || inner.dirty_pages.load(Ordering::Relaxed) != 0 {
                inner.schedule_worker();
            }
            break;
        }
    }

    fn log_status(&self, inner: &Arc<CacheInner>) {
        let statistics = inner.statistics();
        tracing::debug!(
            entries = statistics.entry_count,
            cached = %humansize::format_size(
                (statistics.physical_pages * inner.page_size()) as u64,
                humansize::BINARY,
            ),
            dirty = %humansize::format_size(
                (statistics.dirty_pages * inner.page_size()) as u64,
                humansize::BINARY,
            ),
            "cleaning pass finished",
        );
    }
}
