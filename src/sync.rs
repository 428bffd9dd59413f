use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A shared/exclusive lock that can report whether writers are waiting.
///
/// The flush engine holds file locks shared for long stretches while it walks
/// a file's pages; it periodically checks [SharedExclusiveLock::is_contended]
/// and yields the lock so writers make progress.
pub struct SharedExclusiveLock<T> {
    waiting_writers: AtomicUsize,
    inner: RwLock<T>,
}

impl<T> SharedExclusiveLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            waiting_writers: AtomicUsize::new(0),
            inner: RwLock::new(value),
        }
    }

    /// Acquire the lock shared.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    /// Acquire the lock exclusive, blocking while other holders drain.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        if let Some(guard) = self.inner.try_write() {
            return guard;
        }

        self.waiting_writers.fetch_add(1, Ordering::Relaxed);
        let guard = self.inner.write();
        self.waiting_writers.fetch_sub(1, Ordering::Relaxed);
        guard
    }

    /// Attempt to acquire the lock exclusive without blocking.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.inner.try_write()
    }

    /// Returns `true` if a writer is currently blocked on the lock.
    pub fn is_contended(&self) -> bool {
        self.waiting_writers.load(Ordering::Relaxed) != 0
    }
}

impl<T: Default> Default for SharedExclusiveLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_uncontended_lock_reports_quiet() {
        let lock = SharedExclusiveLock::new(0u32);
        let guard = lock.read();
        assert!(!lock.is_contended());
        drop(guard);

        let guard = lock.write();
        assert!(!lock.is_contended());
        drop(guard);
    }

    #[test]
    fn test_blocked_writer_reports_contended() {
        let lock = Arc::new(SharedExclusiveLock::new(0u32));
        let guard = lock.read();

        let waiter = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                let _guard = lock.write();
            })
        };

        while !lock.is_contended() {
            std::thread::sleep(Duration::from_millis(1));
        }

        drop(guard);
        waiter.join().unwrap();
        assert!(!lock.is_contended());
    }
}
