//! The free-chunk registry: an intrusive list of non-full, non-anchor
//! chunks that insertions can be steered into.
//!
//! Lock order: a chunk's maintenance lock always comes before the registry
//! lock: `add` and `remove` require the caller to already hold the
//! chunk's maintenance lock. The one sanctioned exception is the candidate
//! scan, which holds the registry lock and only *tries* the head's
//! maintenance lock, releasing everything and retrying on failure.

use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::cell::UnsafeCell;

use churn_spin::SpinLock;
use crossbeam_utils::Backoff;

use crate::chunk::Chunk;

pub(crate) struct FreeList<T, const CAP: usize> {
    lock: SpinLock,
    /// Mirrors `head.is_null()`; readable without the lock.
    is_empty: AtomicBool,
    /// Guarded by `lock`.
    head: UnsafeCell<*const Chunk<T, CAP>>,
}

// Safety: `head` and the chunks' intrusive links are only touched under
// the registry lock; membership entries are chunks kept alive by the
// chain.
unsafe impl<T: Send, const CAP: usize> Send for FreeList<T, CAP> {}
unsafe impl<T: Send, const CAP: usize> Sync for FreeList<T, CAP> {}

impl<T, const CAP: usize> FreeList<T, CAP> {
    pub(crate) fn new() -> Self {
        Self {
            lock: SpinLock::new(),
            is_empty: AtomicBool::new(true),
            head: UnsafeCell::new(ptr::null()),
        }
    }

    /// Picks an insertion candidate, returning it with its maintenance
    /// lock held, or `None` if the registry is empty.
    ///
    /// Nothing is popped: the candidate stays registered until the
    /// insertion fills it up. Retries while the head's maintenance lock is
    /// held elsewhere; those holders are short-lived by contract.
    pub(crate) fn acquire(&self) -> Option<Arc<Chunk<T, CAP>>> {
        let backoff = Backoff::new();
        loop {
            if self.is_empty.load(Ordering::Acquire) {
                return None;
            }
            self.lock.lock();
            // Safety: guarded by the registry lock.
            let head = unsafe { *self.head.get() };
            if head.is_null() {
                // Racing removal emptied the registry; the flag store it
                // made under the lock is visible on the next round.
                self.lock.unlock();
                continue;
            }
            // Safety: registry members are linked into the chain, which
            // keeps them strongly referenced while we hold the lock.
            let chunk = unsafe { &*head };
            if chunk.maintenance.try_lock() {
                let arc = chunk.arc();
                self.lock.unlock();
                match arc {
                    Some(arc) => return Some(arc),
                    None => chunk.maintenance.unlock(),
                }
            } else {
                self.lock.unlock();
                backoff.snooze();
            }
        }
    }

    /// Registers a chunk. Caller holds the chunk's maintenance lock.
    /// Idempotent.
    pub(crate) fn add(&self, chunk: &Chunk<T, CAP>) {
        debug_assert!(chunk.maintenance.is_locked());
        if chunk.in_free_list() {
            return;
        }
        self.lock.with(|| {
            // Safety: head and all intrusive links are guarded by the
            // registry lock, which we hold.
            unsafe {
                let head = *self.head.get();
                let links = &mut *chunk.free_links.get();
                links.prev = ptr::null();
                links.next = head;
                if !head.is_null() {
                    (*(*head).free_links.get()).prev = chunk as *const _;
                }
                *self.head.get() = chunk as *const _;
            }
            self.is_empty.store(false, Ordering::Release);
        });
        chunk.set_in_free_list(true);
    }

    /// Unregisters a chunk. Caller holds the chunk's maintenance lock.
    /// Idempotent.
    pub(crate) fn remove(&self, chunk: &Chunk<T, CAP>) {
        debug_assert!(chunk.maintenance.is_locked());
        if !chunk.in_free_list() {
            return;
        }
        self.lock.with(|| {
            // Safety: as in `add`.
            unsafe {
                let links = &mut *chunk.free_links.get();
                if !links.prev.is_null() {
                    (*(*links.prev).free_links.get()).next = links.next;
                }
                if !links.next.is_null() {
                    (*(*links.next).free_links.get()).prev = links.prev;
                }
                if *self.head.get() == chunk as *const _ {
                    *self.head.get() = links.next;
                }
                links.prev = ptr::null();
                links.next = ptr::null();
                if (*self.head.get()).is_null() {
                    self.is_empty.store(true, Ordering::Release);
                }
            }
        });
        chunk.set_in_free_list(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    fn chunk() -> Arc<Chunk<u64, 4>> {
        Chunk::new(Weak::new())
    }

    #[test]
    fn empty_registry_yields_no_candidate() {
        let list = FreeList::<u64, 4>::new();
        assert!(list.acquire().is_none());
    }

    #[test]
    fn acquire_returns_candidate_with_maintenance_held() {
        let list = FreeList::new();
        let c = chunk();
        c.maintenance.lock();
        list.add(&c);
        c.maintenance.unlock();

        let got = list.acquire().unwrap();
        assert!(Arc::ptr_eq(&got, &c));
        assert!(got.maintenance.is_locked());
        assert!(!got.maintenance.try_lock());
        got.maintenance.unlock();
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let list = FreeList::new();
        let c = chunk();
        c.maintenance.lock();

        list.add(&c);
        list.add(&c);
        assert!(c.in_free_list());

        list.remove(&c);
        list.remove(&c);
        assert!(!c.in_free_list());
        c.maintenance.unlock();

        assert!(list.acquire().is_none());
    }

    #[test]
    fn removal_from_the_middle_keeps_the_list_intact() {
        let list = FreeList::new();
        let chunks: Vec<_> = (0..3).map(|_| chunk()).collect();
        for c in &chunks {
            c.maintenance.lock();
            list.add(c);
            c.maintenance.unlock();
        }

        // chunks[1] sits in the middle (LIFO registration order).
        chunks[1].maintenance.lock();
        list.remove(&chunks[1]);
        chunks[1].maintenance.unlock();

        // Both remaining chunks are still reachable.
        for _ in 0..2 {
            let got = list.acquire().unwrap();
            assert!(!Arc::ptr_eq(&got, &chunks[1]));
            list.remove(&got);
            got.maintenance.unlock();
        }
        assert!(list.acquire().is_none());
    }
}
