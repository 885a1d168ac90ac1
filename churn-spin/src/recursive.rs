//! Re-entrancy and depth-counting wrappers over a raw lock.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{RawLock, RawRwLock};

/// A stable, nonzero identifier for the calling thread.
///
/// The address of a thread-local is unique among live threads and cheaper
/// to obtain than `thread::current().id()`.
#[inline]
fn current_thread() -> usize {
    thread_local! {
        static MARKER: u8 = const { 0 };
    }
    MARKER.with(|marker| marker as *const u8 as usize)
}

/// Makes the exclusive side of a lock re-entrant per thread.
///
/// The first acquisition takes the underlying lock; further acquisitions
/// by the same thread only bump a depth counter, and the underlying lock
/// is released when the depth returns to zero. Re-entrancy is tracked per
/// lock instance: holding one `Recursive` lock says nothing about any
/// other.
///
/// The shared side (when the underlying lock has one) passes straight
/// through and is not re-entrant.
pub struct Recursive<L> {
    raw: L,
    /// Id of the thread holding the exclusive side, or 0.
    owner: AtomicUsize,
    /// Re-entry depth. Written only by the owner.
    depth: AtomicUsize,
}

impl<L> Recursive<L> {
    /// Wraps a raw lock.
    #[inline]
    pub const fn new(raw: L) -> Self {
        Self {
            raw,
            owner: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
        }
    }

    /// Returns whether the calling thread holds the exclusive side.
    #[inline]
    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Relaxed) == current_thread()
    }
}

impl<L: std::fmt::Debug> std::fmt::Debug for Recursive<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recursive")
            .field("raw", &self.raw)
            .field("depth", &self.depth.load(Ordering::Relaxed))
            .finish()
    }
}

impl<L: RawLock> RawLock for Recursive<L> {
    fn lock(&self) {
        let me = current_thread();
        if self.owner.load(Ordering::Relaxed) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
        } else {
            self.raw.lock();
            self.owner.store(me, Ordering::Relaxed);
            self.depth.store(1, Ordering::Relaxed);
        }
    }

    fn try_lock(&self) -> bool {
        let me = current_thread();
        if self.owner.load(Ordering::Relaxed) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            true
        } else if self.raw.try_lock() {
            self.owner.store(me, Ordering::Relaxed);
            self.depth.store(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn unlock(&self) {
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            // Clear the owner before releasing: the next holder writes it.
            self.owner.store(0, Ordering::Relaxed);
            self.raw.unlock();
        }
    }
}

impl<L: RawRwLock> RawRwLock for Recursive<L> {
    #[inline]
    fn lock_shared(&self) {
        self.raw.lock_shared();
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        self.raw.try_lock_shared()
    }

    #[inline]
    fn unlock_shared(&self) {
        self.raw.unlock_shared();
    }
}

/// Tracks the exclusive acquisition depth of a lock, visible to the holder.
///
/// Stack this over [`Recursive`] to let the holder ask "am I the outermost
/// acquisition?", which is what the container's maintenance gate needs.
pub struct LevelCounted<L> {
    raw: L,
    /// Exclusive depth. Written only under the exclusive lock.
    level: AtomicUsize,
}

impl<L> LevelCounted<L> {
    /// Wraps a raw lock.
    #[inline]
    pub const fn new(raw: L) -> Self {
        Self {
            raw,
            level: AtomicUsize::new(0),
        }
    }

    /// Current exclusive depth.
    ///
    /// Meaningful only to the thread holding the exclusive side; any other
    /// reader sees a number that may change underneath it.
    #[inline]
    pub fn level(&self) -> usize {
        self.level.load(Ordering::Relaxed)
    }
}

impl<L: std::fmt::Debug> std::fmt::Debug for LevelCounted<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelCounted")
            .field("raw", &self.raw)
            .field("level", &self.level())
            .finish()
    }
}

impl<L: RawLock> RawLock for LevelCounted<L> {
    fn lock(&self) {
        self.raw.lock();
        self.level.fetch_add(1, Ordering::Relaxed);
    }

    fn try_lock(&self) -> bool {
        if self.raw.try_lock() {
            self.level.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn unlock(&self) {
        // Drop the level before the raw unlock hands the lock away.
        self.level.fetch_sub(1, Ordering::Relaxed);
        self.raw.unlock();
    }
}

impl<L: RawRwLock> RawRwLock for LevelCounted<L> {
    #[inline]
    fn lock_shared(&self) {
        self.raw.lock_shared();
    }

    #[inline]
    fn try_lock_shared(&self) -> bool {
        self.raw.try_lock_shared()
    }

    #[inline]
    fn unlock_shared(&self) {
        self.raw.unlock_shared();
    }
}
