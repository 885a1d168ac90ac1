//! Plain exclusive spin lock.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_utils::Backoff;

use crate::RawLock;

/// A test-and-set spin lock.
///
/// `lock` spins on a relaxed read between acquisition attempts so the
/// waiters hammer a shared cache line instead of bouncing it, and backs
/// off to a scheduler yield under sustained contention.
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Creates an unlocked lock.
    #[inline]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Attempts to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    /// Spins until the lock is acquired.
    #[inline]
    pub fn lock(&self) {
        let backoff = Backoff::new();
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                backoff.snooze();
            }
        }
    }

    /// Releases the lock.
    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Returns whether the lock is currently held by someone.
    ///
    /// Racy by nature; useful for assertions, not for control flow.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Runs `f` with the lock held.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let result = f();
        self.unlock();
        result
    }

    /// Locks two distinct locks in ascending address order.
    ///
    /// All callers that ever hold two locks of the same rank must go
    /// through this, which is what makes the pair acquisition
    /// deadlock-free.
    pub fn lock_pair(a: &SpinLock, b: &SpinLock) {
        debug_assert!(!std::ptr::eq(a, b), "lock_pair requires distinct locks");
        if (a as *const SpinLock) < (b as *const SpinLock) {
            a.lock();
            b.lock();
        } else {
            b.lock();
            a.lock();
        }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SpinLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl RawLock for SpinLock {
    #[inline]
    fn lock(&self) {
        SpinLock::lock(self);
    }

    #[inline]
    fn try_lock(&self) -> bool {
        SpinLock::try_lock(self)
    }

    #[inline]
    fn unlock(&self) {
        SpinLock::unlock(self);
    }
}
