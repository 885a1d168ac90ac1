//! Spin locks for short, bounded critical sections.
//!
//! `churn-spin` provides the locking primitives used by the `churn`
//! container: a plain exclusive spin lock, a writer-biased reader/writer
//! spin lock, and two stackable wrappers that add per-thread re-entrancy
//! and a holder-visible depth counter to the exclusive side of any lock.
//!
//! All locks spin with adaptive back-off (busy-wait first, then yield to
//! the scheduler). They are intended for critical sections whose length is
//! bounded by a small constant amount of work; parking on a kernel
//! primitive would cost more than the work being guarded.
//!
//! # Quick Start
//!
//! ```
//! use churn_spin::{RawLock, RawRwLock, LevelCounted, Recursive, RwSpinLock};
//!
//! let lock = LevelCounted::new(Recursive::new(RwSpinLock::new()));
//!
//! lock.lock();
//! assert_eq!(lock.level(), 1);
//!
//! // Same thread may re-enter the exclusive side.
//! assert!(lock.try_lock());
//! assert_eq!(lock.level(), 2);
//!
//! lock.unlock();
//! lock.unlock();
//!
//! // The shared side passes straight through to the raw lock.
//! lock.lock_shared();
//! lock.unlock_shared();
//! ```

mod recursive;
mod rw;
mod spin;

pub use recursive::{LevelCounted, Recursive};
pub use rw::RwSpinLock;
pub use spin::SpinLock;

/// An exclusive lock, manually unlocked.
///
/// Implementors guarantee that `lock`/`try_lock` establish the usual
/// acquire/release synchronization with the matching `unlock`.
///
/// Unlocking a lock the calling thread does not hold is a logic error:
/// it can wake another waiter spuriously but cannot cause memory
/// unsafety on its own.
pub trait RawLock {
    /// Blocks (spinning) until the exclusive lock is acquired.
    fn lock(&self);

    /// Attempts to acquire the exclusive lock without spinning.
    fn try_lock(&self) -> bool;

    /// Releases the exclusive lock.
    fn unlock(&self);
}

/// A reader/writer lock: `RawLock`'s exclusive side plus a shared side.
pub trait RawRwLock: RawLock {
    /// Blocks (spinning) until a shared lock is acquired.
    fn lock_shared(&self);

    /// Attempts to acquire a shared lock without spinning.
    fn try_lock_shared(&self) -> bool;

    /// Releases one shared lock.
    fn unlock_shared(&self);
}
