//! Trackable handles: long-lived weak references to individual elements
//! that survive compaction and merge.
//!
//! Each handle owns a heap-allocated node linked into the handle list of
//! the slot it names, so maintenance can retarget every outstanding handle
//! when it moves the element. A node's list links are guarded by the
//! slot's lock; its target by the node's own lock, the leaf of the whole
//! lock order.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;

use churn_spin::{RawLock, RawRwLock, SpinLock};

use crate::bag::{maintain_and_unlock_exclusive, maintain_and_unlock_shared};
use crate::chunk::Chunk;

/// Where a handle points. `index` is rewritten by maintenance; the weak
/// chunk reference goes dead with the chunk itself.
pub(crate) struct Target<T, const CAP: usize> {
    pub(crate) chunk: Weak<Chunk<T, CAP>>,
    pub(crate) index: usize,
}

pub(crate) struct HandleNode<T, const CAP: usize> {
    pub(crate) lock: SpinLock,
    /// Guarded by `lock`. `None` means the handle is dead.
    pub(crate) target: UnsafeCell<Option<Target<T, CAP>>>,
    /// Neighbors in the slot's handle list. Guarded by the slot's lock.
    pub(crate) prev: UnsafeCell<*mut HandleNode<T, CAP>>,
    pub(crate) next: UnsafeCell<*mut HandleNode<T, CAP>>,
}

/// Creates a handle registered at `(chunk, index)`.
///
/// The caller must be pinning the slot, via the chunk's maintenance
/// lock (insert) or its ownership lock (a visitor's cursor), so the slot
/// cannot move or die between publication and registration.
pub(crate) fn register<T, const CAP: usize, const CHECK_ALIVENESS: bool>(
    chunk: &Chunk<T, CAP>,
    index: usize,
) -> Handle<T, CAP, CHECK_ALIVENESS> {
    let node = Box::into_raw(Box::new(HandleNode {
        lock: SpinLock::new(),
        target: UnsafeCell::new(Some(Target {
            chunk: chunk.weak(),
            index,
        })),
        prev: UnsafeCell::new(ptr::null_mut()),
        next: UnsafeCell::new(ptr::null_mut()),
    }));
    let slot = chunk.track(index);
    slot.lock.with(|| {
        // Safety: list links are guarded by the slot lock; the node is not
        // yet shared, so its own fields are still ours.
        unsafe {
            let head = *slot.head.get();
            *(*node).next.get() = head;
            if !head.is_null() {
                (*(*head).prev.get()) = node;
            }
            *slot.head.get() = node;
        }
        slot.have.store(true, Ordering::Release);
    });
    Handle {
        // Safety: `Box::into_raw` never returns null.
        node: unsafe { NonNull::new_unchecked(node) },
        _marker: PhantomData,
    }
}

/// A trackable handle to one element of a [`Bag`](crate::Bag).
///
/// The handle stays valid across compaction and merge: maintenance
/// rewrites it in place when it moves the element. It is weak with respect
/// to erasure: once the element is gone, [`lock`](Self::lock) and
/// [`lock_mut`](Self::lock_mut) return `None`.
///
/// Locking a handle takes the chunk's ownership lock and holds it for the
/// lifetime of the returned access guard, which excludes any
/// reorganization of the element's neighborhood. The exclusive side is
/// re-entrant, so a visitor may lock a handle into the chunk it is
/// currently iterating. Don't hold an [`AccessMut`] to the slot a live
/// `CursorMut` points at while using both; that aliases the element.
pub struct Handle<T, const CAP: usize = 32, const CHECK_ALIVENESS: bool = false> {
    node: NonNull<HandleNode<T, CAP>>,
    _marker: PhantomData<HandleNode<T, CAP>>,
}

// Safety: the node is only touched under its spin lock, and the element
// only through the chunk's ownership lock; `T: Send + Sync` because a
// handle lets any thread it reaches read (shared access) or take (move
// out via `&mut`) the element.
unsafe impl<T: Send + Sync, const CAP: usize, const CHECK_ALIVENESS: bool> Send
    for Handle<T, CAP, CHECK_ALIVENESS>
{
}
unsafe impl<T: Send + Sync, const CAP: usize, const CHECK_ALIVENESS: bool> Sync
    for Handle<T, CAP, CHECK_ALIVENESS>
{
}

impl<T, const CAP: usize, const CHECK_ALIVENESS: bool> Handle<T, CAP, CHECK_ALIVENESS> {
    /// Locks the element for exclusive access.
    ///
    /// Returns `None` if the handle is dead: the element was erased and
    /// reclaimed, or the container is gone. Spins while the chunk is
    /// exclusively held elsewhere; re-enters if held by this thread.
    pub fn lock_mut(&self) -> Option<AccessMut<T, CAP>> {
        loop {
            // Safety: the node outlives the handle.
            let node = unsafe { self.node.as_ref() };
            node.lock.lock();
            // Safety: target is guarded by the node lock.
            let target = unsafe { &*node.target.get() };
            let Some(t) = target else {
                node.lock.unlock();
                return None;
            };
            let Some(chunk) = t.chunk.upgrade() else {
                node.lock.unlock();
                return None;
            };
            if chunk.lock.try_lock() {
                // Ownership acquired under the node lock: the target can
                // no longer be rewritten, so the index is stable.
                let index = t.index;
                node.lock.unlock();
                if CHECK_ALIVENESS && !chunk.is_alive(index) {
                    maintain_and_unlock_exclusive(&chunk, None);
                    return None;
                }
                return Some(AccessMut { chunk, index });
            }
            node.lock.unlock();
            thread::yield_now();
        }
    }

    /// Locks the element for shared access.
    ///
    /// As [`lock_mut`](Self::lock_mut), but takes the ownership lock
    /// shared, so concurrent shared iteration and other shared accesses
    /// proceed. The shared side is not re-entrant over an exclusive hold.
    pub fn lock(&self) -> Option<Access<T, CAP>> {
        loop {
            // Safety: the node outlives the handle.
            let node = unsafe { self.node.as_ref() };
            node.lock.lock();
            // Safety: target is guarded by the node lock.
            let target = unsafe { &*node.target.get() };
            let Some(t) = target else {
                node.lock.unlock();
                return None;
            };
            let Some(chunk) = t.chunk.upgrade() else {
                node.lock.unlock();
                return None;
            };
            if chunk.lock.try_lock_shared() {
                let index = t.index;
                node.lock.unlock();
                if CHECK_ALIVENESS && !chunk.is_alive(index) {
                    maintain_and_unlock_shared(&chunk, None);
                    return None;
                }
                return Some(Access { chunk, index });
            }
            node.lock.unlock();
            thread::yield_now();
        }
    }
}

impl<T, const CAP: usize, const CHECK_ALIVENESS: bool> Drop for Handle<T, CAP, CHECK_ALIVENESS> {
    fn drop(&mut self) {
        let node_ptr = self.node.as_ptr();
        loop {
            // Safety: the node is alive until we reclaim it below.
            let node = unsafe { &*node_ptr };
            node.lock.lock();
            // Safety: target is guarded by the node lock.
            let target = unsafe { &*node.target.get() };
            let Some(t) = target else {
                // Dead handles are not in any list.
                node.lock.unlock();
                break;
            };
            match t.chunk.upgrade() {
                None => {
                    // The chunk is tearing down and will null this node
                    // once it reaches our slot; wait for that.
                    node.lock.unlock();
                    thread::yield_now();
                }
                Some(chunk) => {
                    let slot = chunk.track(t.index);
                    // Handle lock before slot lock is the required order,
                    // so the slot lock must be a try: maintenance walks
                    // the list the other way around.
                    if slot.lock.try_lock() {
                        // Safety: list links are guarded by the slot lock.
                        unsafe {
                            let prev = *node.prev.get();
                            let next = *node.next.get();
                            if prev.is_null() {
                                *slot.head.get() = next;
                            } else {
                                *(*prev).next.get() = next;
                            }
                            if !next.is_null() {
                                *(*next).prev.get() = prev;
                            }
                            if (*slot.head.get()).is_null() {
                                slot.have.store(false, Ordering::Release);
                            }
                        }
                        slot.lock.unlock();
                        node.lock.unlock();
                        break;
                    }
                    node.lock.unlock();
                    thread::yield_now();
                }
            }
        }
        // Safety: unlinked (or never linked again) and unreachable; this
        // was the owning pointer.
        drop(unsafe { Box::from_raw(node_ptr) });
    }
}

impl<T, const CAP: usize, const CHECK_ALIVENESS: bool> fmt::Debug
    for Handle<T, CAP, CHECK_ALIVENESS>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").finish_non_exhaustive()
    }
}

/// Exclusive access to an element through a [`Handle`].
///
/// Holds the chunk's ownership lock exclusively; dropping it releases the
/// lock through the maintenance seam, so a top-level unlock may compact,
/// merge, or delete the chunk.
pub struct AccessMut<T, const CAP: usize> {
    chunk: Arc<Chunk<T, CAP>>,
    index: usize,
}

impl<T, const CAP: usize> AccessMut<T, CAP> {
    pub(crate) fn erase(self) {
        self.chunk.erase(self.index);
        // Drop runs maintenance, which reclaims the slot.
    }
}

impl<T, const CAP: usize> Deref for AccessMut<T, CAP> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: exclusive ownership is held; the slot was alive (or, if
        // aliveness checking is off, at least initialized) when acquired
        // and cannot be reclaimed under the lock.
        unsafe { &*self.chunk.value_ptr(self.index) }
    }
}

impl<T, const CAP: usize> DerefMut for AccessMut<T, CAP> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as in `deref`, and access is exclusive.
        unsafe { &mut *self.chunk.value_ptr(self.index) }
    }
}

impl<T, const CAP: usize> Drop for AccessMut<T, CAP> {
    fn drop(&mut self) {
        maintain_and_unlock_exclusive(&self.chunk, None);
    }
}

impl<T: fmt::Debug, const CAP: usize> fmt::Debug for AccessMut<T, CAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AccessMut").field(&**self).finish()
    }
}

/// Shared access to an element through a [`Handle`].
pub struct Access<T, const CAP: usize> {
    chunk: Arc<Chunk<T, CAP>>,
    index: usize,
}

impl<T, const CAP: usize> Deref for Access<T, CAP> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: shared ownership is held; shared holders exclude any
        // reorganization or exclusive mutation of the slot.
        unsafe { &*self.chunk.value_ptr(self.index) }
    }
}

impl<T, const CAP: usize> Drop for Access<T, CAP> {
    fn drop(&mut self) {
        maintain_and_unlock_shared(&self.chunk, None);
    }
}

impl<T: fmt::Debug, const CAP: usize> fmt::Debug for Access<T, CAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Access").field(&**self).finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::Bag;

    // ========================================================================
    // Liveness
    // ========================================================================

    #[test]
    fn handle_reads_and_mutates_the_element() {
        let bag: Bag<u64, 4> = Bag::new();
        let h = bag.insert(41).handle();

        *h.lock_mut().unwrap() += 1;
        assert_eq!(*h.lock().unwrap(), 42);
        assert_eq!(*h.lock_mut().unwrap(), 42);
    }

    #[test]
    fn handle_goes_dead_on_erase() {
        let bag: Bag<u64, 4> = Bag::new();
        let h = bag.insert(1).handle();
        bag.insert(2);

        bag.erase(&h);
        assert!(h.lock().is_none());
        assert!(h.lock_mut().is_none());

        // Erasing through a dead handle is a no-op.
        bag.erase(&h);

        let mut remaining = Vec::new();
        bag.iterate(|item| remaining.push(*item));
        assert_eq!(remaining, vec![2]);
    }

    #[test]
    fn several_handles_track_one_slot() {
        let bag: Bag<u64, 4> = Bag::new();
        let a = bag.insert(9).handle();
        let mut b = None;
        bag.iterate(|item| {
            if *item == 9 {
                b = Some(item.handle());
            }
        });
        let b = b.unwrap();

        *a.lock_mut().unwrap() = 10;
        assert_eq!(*b.lock().unwrap(), 10);

        bag.erase(&b);
        assert!(a.lock().is_none());
        assert!(b.lock().is_none());
    }

    #[test]
    fn dropping_a_handle_leaves_the_element_in_place() {
        let bag: Bag<u64, 4> = Bag::new();
        let h = bag.insert(5).handle();
        drop(h);

        let mut values = Vec::new();
        bag.iterate(|item| values.push(*item));
        assert_eq!(values, vec![5]);
    }

    #[test]
    fn handle_outliving_the_bag_is_dead() {
        let bag: Bag<u64, 4> = Bag::new();
        let h = bag.insert(3).handle();
        drop(bag);
        assert!(h.lock().is_none());
        assert!(h.lock_mut().is_none());
    }

    // ========================================================================
    // Stability under maintenance
    // ========================================================================

    #[test]
    fn handle_survives_compaction() {
        let bag: Bag<u64, 8> = Bag::new();
        let mut handles = Vec::new();
        for v in 0..8 {
            handles.push(bag.insert(v).handle());
        }
        // Erase everything but the last element; its slot will be moved
        // down to index 0 by compaction.
        for h in &handles[..7] {
            bag.erase(h);
        }
        assert_eq!(*handles[7].lock().unwrap(), 7);
        for h in &handles[..7] {
            assert!(h.lock().is_none());
        }
    }

    #[test]
    fn handle_survives_merge() {
        let bag: Bag<u64, 8> = Bag::new();
        let mut handles = Vec::new();
        for v in 0..24 {
            handles.push(bag.insert(v).handle());
        }
        // Thin out two non-anchor chunks below the merge threshold, then
        // iterate to trigger the merge.
        for (v, h) in handles.iter().enumerate() {
            if v != 1 && v != 9 && v < 16 {
                bag.erase(h);
            }
        }
        bag.iterate(|_| {});

        assert_eq!(*handles[1].lock().unwrap(), 1);
        assert_eq!(*handles[9].lock().unwrap(), 9);
    }

    // ========================================================================
    // Cross-thread
    // ========================================================================

    #[test]
    fn handle_moves_across_threads() {
        let bag: Bag<u64, 8> = Bag::new();
        let h = bag.insert(77).handle();

        std::thread::scope(|s| {
            s.spawn(|| {
                *h.lock_mut().unwrap() += 1;
            });
        });

        assert_eq!(*h.lock().unwrap(), 78);
    }

    #[test]
    fn shared_accesses_overlap() {
        let bag: Bag<u64, 8> = Bag::new();
        let h = bag.insert(1).handle();

        let a = h.lock().unwrap();
        let b = h.lock().unwrap();
        assert_eq!(*a + *b, 2);
    }
}
