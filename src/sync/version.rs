//! Single-word versioned lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Spin-then-yield backoff used by every lock acquisition loop.
#[inline]
pub(crate) fn backoff(attempt: u32) {
    if attempt < 6 {
        for _ in 0..(1 << attempt) {
            std::hint::spin_loop();
        }
    } else {
        std::thread::yield_now();
    }
}

/// A one-word lock whose version counter is bumped on both acquire and
/// release. Odd versions mean "locked": an optimistic reader that observed an
/// odd version, or whose version changed across its read, must retry.
#[derive(Debug)]
pub(crate) struct VersionLock(AtomicU64);

impl VersionLock {
    pub(crate) const fn new() -> Self {
        VersionLock(AtomicU64::new(0))
    }

    #[inline]
    pub(crate) fn version(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.version() & 1 == 1
    }

    /// Attempt a single acquire. Fails if the lock is held.
    pub(crate) fn try_lock(&self) -> bool {
        let v = self.0.load(Ordering::Relaxed);
        if v & 1 == 1 {
            return false;
        }
        self.0
            .compare_exchange(v, v + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn lock(&self) {
        let mut attempt = 0;
        while !self.try_lock() {
            backoff(attempt);
            attempt += 1;
        }
    }

    pub(crate) fn unlock(&self) {
        debug_assert!(self.is_locked());
        self.0.fetch_add(1, Ordering::Release);
    }

    /// Begin an optimistic read. Returns the pre-read version once the lock
    /// is observed free.
    #[inline]
    pub(crate) fn read_begin(&self) -> u64 {
        let mut attempt = 0;
        loop {
            let v = self.version();
            if v & 1 == 0 {
                return v;
            }
            backoff(attempt);
            attempt += 1;
        }
    }

    /// Finish an optimistic read; true iff no writer interleaved.
    #[inline]
    pub(crate) fn read_validate(&self, begin: u64) -> bool {
        std::sync::atomic::fence(Ordering::Acquire);
        self.0.load(Ordering::Acquire) == begin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn versions_advance_by_two_per_cycle() {
        let lock = VersionLock::new();
        assert_eq!(lock.version(), 0);
        lock.lock();
        assert!(lock.is_locked());
        assert_eq!(lock.version(), 1);
        lock.unlock();
        assert_eq!(lock.version(), 2);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = VersionLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn reader_detects_interleaved_writer() {
        let lock = VersionLock::new();
        let begin = lock.read_begin();
        lock.lock();
        lock.unlock();
        assert!(!lock.read_validate(begin));
        let begin = lock.read_begin();
        assert!(lock.read_validate(begin));
    }

    #[test]
    fn exclusion_under_contention() {
        let lock = Arc::new(VersionLock::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    lock.lock();
                    let v = counter.load(std::sync::atomic::Ordering::Relaxed);
                    counter.store(v + 1, std::sync::atomic::Ordering::Relaxed);
                    lock.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 40_000);
    }
}
