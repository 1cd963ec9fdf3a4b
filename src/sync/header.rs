//! Reader/writer lock over a node header, with a version for optimistic
//! snapshots.
//!
//! Writers (split and morph header swaps) are exclusive and announce intent
//! so readers cannot starve them. Shared holders (in-place mutators that must
//! not run concurrently with a swap) proceed in parallel. Pure readers take
//! nothing: they sample [`HeaderLock::version`] before and after copying the
//! header words and retry on mismatch or an odd version.

use super::version::backoff;
use std::sync::atomic::{AtomicU64, Ordering};

const INTENT: u64 = 1 << 63;
const READER: u64 = 1 << 32;
const READER_MASK: u64 = ((1 << 31) - 1) << 32;
const VERSION_MASK: u64 = (1 << 32) - 1;

#[derive(Debug)]
pub(crate) struct HeaderLock(AtomicU64);

impl HeaderLock {
    pub(crate) const fn new() -> Self {
        HeaderLock(AtomicU64::new(0))
    }

    /// Snapshot version; odd means a writer holds the header.
    #[inline]
    pub(crate) fn version(&self) -> u64 {
        self.0.load(Ordering::Acquire) & VERSION_MASK
    }

    /// Begin an optimistic header read; spins past writers.
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

    #[inline]
    pub(crate) fn read_validate(&self, begin: u64) -> bool {
        std::sync::atomic::fence(Ordering::Acquire);
        self.version() == begin
    }

    /// Shared acquisition. Waits out writers and writer intent.
    pub(crate) fn lock_shared(&self) {
        let mut attempt = 0;
        loop {
            let v = self.0.load(Ordering::Relaxed);
            if v & INTENT == 0 && v & VERSION_MASK & 1 == 0 {
                if self
                    .0
                    .compare_exchange_weak(v, v + READER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }
            backoff(attempt);
            attempt += 1;
        }
    }

    pub(crate) fn unlock_shared(&self) {
        debug_assert!(self.0.load(Ordering::Relaxed) & READER_MASK != 0);
        self.0.fetch_sub(READER, Ordering::Release);
    }

    /// Exclusive acquisition; bumps the version to odd. Intent is
    /// re-asserted every round because a competing writer clears it when it
    /// acquires.
    pub(crate) fn lock_exclusive(&self) {
        let mut attempt = 0;
        loop {
            let v = self.0.fetch_or(INTENT, Ordering::Acquire);
            if v & READER_MASK == 0 && v & VERSION_MASK & 1 == 0 {
                // clears intent, sets the odd version
                let next = (v & VERSION_MASK) + 1;
                if self
                    .0
                    .compare_exchange(v | INTENT, next, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
            }
            backoff(attempt);
            attempt += 1;
        }
    }

    /// Releases the exclusive hold; the version becomes even again.
    pub(crate) fn unlock_exclusive(&self) {
        debug_assert!(self.version() & 1 == 1);
        self.0.fetch_add(1, Ordering::Release);
    }
}
