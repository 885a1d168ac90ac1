//! Writer-biased reader/writer spin lock.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crossbeam_utils::Backoff;

use crate::{RawLock, RawRwLock};

/// A reader/writer spin lock that prioritizes writers.
///
/// A thread that wants the exclusive lock first claims the writer flag,
/// then waits for the reader count to drain; new readers refuse to enter
/// while the flag is up. Readers register optimistically and back out if a
/// writer claimed the flag mid-registration, so the reader fast path is a
/// single `fetch_add` plus one load.
///
/// With a steady stream of writers, readers can starve. That is the
/// intended trade-off: use it where updates must not wait.
pub struct RwSpinLock {
    readers: AtomicU32,
    writer: AtomicBool,
}

impl RwSpinLock {
    /// Creates an unlocked lock.
    #[inline]
    pub const fn new() -> Self {
        Self {
            readers: AtomicU32::new(0),
            writer: AtomicBool::new(false),
        }
    }

    /// Spins until the exclusive lock is acquired.
    pub fn lock(&self) {
        let backoff = Backoff::new();
        while self.writer.swap(true, Ordering::Acquire) {
            while self.writer.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
        // Writer flag is up: no new readers. Wait for the rest to leave.
        while self.readers.load(Ordering::Acquire) != 0 {
            backoff.snooze();
        }
    }

    /// Attempts to acquire the exclusive lock without spinning.
    pub fn try_lock(&self) -> bool {
        // Fast fail while readers are inside.
        if self.readers.load(Ordering::Acquire) != 0 {
            return false;
        }
        if self.writer.swap(true, Ordering::Acquire) {
            return false;
        }
        if self.readers.load(Ordering::Acquire) == 0 {
            true
        } else {
            // A reader slipped in between the two checks.
            self.unlock();
            false
        }
    }

    /// Releases the exclusive lock.
    #[inline]
    pub fn unlock(&self) {
        self.writer.store(false, Ordering::Release);
    }

    /// Spins until a shared lock is acquired.
    pub fn lock_shared(&self) {
        let backoff = Backoff::new();
        loop {
            while self.writer.load(Ordering::Acquire) {
                backoff.snooze();
            }
            self.readers.fetch_add(1, Ordering::Acquire);
            if !self.writer.load(Ordering::Acquire) {
                return;
            }
            // A writer claimed the flag mid-registration; back out and
            // let it through.
            self.readers.fetch_sub(1, Ordering::Release);
        }
    }

    /// Attempts to acquire a shared lock without spinning.
    pub fn try_lock_shared(&self) -> bool {
        if self.writer.load(Ordering::Acquire) {
            return false;
        }
        self.readers.fetch_add(1, Ordering::Acquire);
        if !self.writer.load(Ordering::Acquire) {
            true
        } else {
            self.readers.fetch_sub(1, Ordering::Release);
            false
        }
    }

    /// Releases one shared lock.
    #[inline]
    pub fn unlock_shared(&self) {
        self.readers.fetch_sub(1, Ordering::Release);
    }
}

impl Default for RwSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RwSpinLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwSpinLock")
            .field("readers", &self.readers.load(Ordering::Relaxed))
            .field("writer", &self.writer.load(Ordering::Relaxed))
            .finish()
    }
}

impl RawLock for RwSpinLock {
    #[inline]
    fn lock(&self) {
        RwSpinLock::lock(self);
    }

    #[inline]
    fn try_lock(&self) -> bool {
        RwSpinLock::try_lock(self)
    }

    #[inline]
    fn unlock(&self) {
        RwSpinLock::unlock(self);
    }
}

impl RawRwLock for RwSpinLock {
    #[inline]
    fn lock_shared(&self) {
        RwSpinLock::lock_shared(self);
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        RwSpinLock::try_lock_shared(self)
    }

    #[inline]
    fn unlock_shared(&self) {
        RwSpinLock::unlock_shared(self);
    }
}
