//! The chunk: a fixed-capacity block of element slots, the unit of locking
//! and of chain membership.
//!
//! Memory layout (one allocation per chunk, behind an `Arc`):
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ size / deleted counters (cache-line padded)             │
//! ├─────────────────────────────────────────────────────────┤
//! │ ownership lock (rw, re-entrant, depth-counted)          │
//! │ maintenance lock                                        │
//! │ chain links (prev/next Arc, behind a leaf spin lock)    │
//! │ free-list links + membership flag                       │
//! ├─────────────────────────────────────────────────────────┤
//! │ alive:  [AtomicBool; CAP]   (separate from values so a  │
//! │                              dead slot is skipped from  │
//! │                              its own cache line)        │
//! │ tracks: [TrackSlot; CAP]    per-slot handle registry    │
//! │ slots:  [MaybeUninit<T>; CAP]                           │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! The central storage invariant: every slot in `[0, size)` holds an
//! initialized `T` (alive, or erased but not yet reclaimed) and every
//! slot in `[size, CAP)` is uninitialized. Erase only clears the alive
//! flag; the value itself is reclaimed by compaction, merge, or chunk
//! teardown, exactly once.

use std::cell::UnsafeCell;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use churn_spin::{LevelCounted, Recursive, RwSpinLock, SpinLock};
use crossbeam_utils::CachePadded;

use crate::bag::Inner;
use crate::handle::{HandleNode, Target};

/// The per-chunk ownership lock: reader/writer, re-entrant per thread on
/// the exclusive side, with an acquisition depth visible to the holder.
pub(crate) type OwnershipLock = LevelCounted<Recursive<RwSpinLock>>;

/// Chain links. Guarded by `Chunk::links_lock`.
struct Links<T, const CAP: usize> {
    prev: Option<Arc<Chunk<T, CAP>>>,
    next: Option<Arc<Chunk<T, CAP>>>,
}

/// Free-list intrusive links. Guarded by the registry lock.
pub(crate) struct FreeLinks<T, const CAP: usize> {
    pub(crate) prev: *const Chunk<T, CAP>,
    pub(crate) next: *const Chunk<T, CAP>,
}

/// Per-slot trackable-handle registry entry: the head of a doubly-linked
/// list of handle nodes naming this slot.
///
/// `have` is a fast-path mirror of `!head.is_null()`: false means no
/// handles, checked without the lock. The list links (`head`, and each
/// node's `prev`/`next`) are guarded by `lock`; each node's target is
/// guarded by the node's own lock.
pub(crate) struct TrackSlot<T, const CAP: usize> {
    pub(crate) have: AtomicBool,
    pub(crate) lock: SpinLock,
    pub(crate) head: UnsafeCell<*mut HandleNode<T, CAP>>,
}

impl<T, const CAP: usize> TrackSlot<T, CAP> {
    fn new() -> Self {
        Self {
            have: AtomicBool::new(false),
            lock: SpinLock::new(),
            head: UnsafeCell::new(ptr::null_mut()),
        }
    }
}

pub(crate) struct Chunk<T, const CAP: usize> {
    /// One-past-last ever-occupied slot. Grows only under the maintenance
    /// lock (append); shrinks only under exclusive ownership plus the
    /// maintenance lock.
    size: CachePadded<AtomicUsize>,
    /// Number of dead slots in `[0, size)`. Grows under shared ownership
    /// (concurrent erases); reset by maintenance.
    deleted: CachePadded<AtomicUsize>,

    /// Gates slot access. Exclusive for mutating iteration and
    /// maintenance, shared for read-only iteration and concurrent erase.
    pub(crate) lock: OwnershipLock,
    /// Gates structural change: append, compact, merge, delete, free-list
    /// membership. Never held without the holder also preventing
    /// reorganization races (exclusive ownership, or the registry scan).
    pub(crate) maintenance: SpinLock,

    pub(crate) is_first: AtomicBool,

    /// Leaf lock for `links`: nothing else is acquired while holding it.
    links_lock: SpinLock,
    links: UnsafeCell<Links<T, CAP>>,

    /// Guarded by the maintenance lock.
    in_free_list: UnsafeCell<bool>,
    pub(crate) free_links: UnsafeCell<FreeLinks<T, CAP>>,

    /// The owning container, while it is alive. Consulted by maintenance
    /// that runs from a handle-access drop after the container may already
    /// be gone.
    pub(crate) container: Weak<Inner<T, CAP>>,
    self_weak: Weak<Chunk<T, CAP>>,

    alive: [AtomicBool; CAP],
    tracks: [TrackSlot<T, CAP>; CAP],
    slots: [UnsafeCell<MaybeUninit<T>>; CAP],
}

// Safety: the chunk owns its values and every interior-mutable field is
// guarded by one of its locks (documented per field); raw free-list
// pointers are only followed under the registry lock.
unsafe impl<T: Send, const CAP: usize> Send for Chunk<T, CAP> {}
unsafe impl<T: Send + Sync, const CAP: usize> Sync for Chunk<T, CAP> {}

impl<T, const CAP: usize> Chunk<T, CAP> {
    /// Merge is attempted only below this occupancy; it exists for the
    /// pathological many-near-empty-chunks shape, not as a packing
    /// strategy.
    pub(crate) const MERGE_THRESHOLD: usize = CAP / 4;

    pub(crate) fn new(container: Weak<Inner<T, CAP>>) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            size: CachePadded::new(AtomicUsize::new(0)),
            deleted: CachePadded::new(AtomicUsize::new(0)),
            lock: LevelCounted::new(Recursive::new(RwSpinLock::new())),
            maintenance: SpinLock::new(),
            is_first: AtomicBool::new(false),
            links_lock: SpinLock::new(),
            links: UnsafeCell::new(Links {
                prev: None,
                next: None,
            }),
            in_free_list: UnsafeCell::new(false),
            free_links: UnsafeCell::new(FreeLinks {
                prev: ptr::null(),
                next: ptr::null(),
            }),
            container,
            self_weak: self_weak.clone(),
            alive: std::array::from_fn(|_| AtomicBool::new(false)),
            tracks: std::array::from_fn(|_| TrackSlot::new()),
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
        })
    }

    // === Counters ===

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn deleted_count(&self) -> usize {
        self.deleted.load(Ordering::Relaxed)
    }

    /// Live slot count. The two loads are not a snapshot; treat the result
    /// as advisory outside the maintenance lock.
    #[inline]
    pub(crate) fn alive_size(&self) -> usize {
        self.size().saturating_sub(self.deleted_count())
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.size() == CAP
    }

    #[inline]
    pub(crate) fn is_first(&self) -> bool {
        self.is_first.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_alive(&self, index: usize) -> bool {
        self.alive[index].load(Ordering::Acquire)
    }

    // === Identity ===

    #[inline]
    pub(crate) fn weak(&self) -> Weak<Self> {
        self.self_weak.clone()
    }

    #[inline]
    pub(crate) fn arc(&self) -> Option<Arc<Self>> {
        self.self_weak.upgrade()
    }

    #[inline]
    pub(crate) fn track(&self, index: usize) -> &TrackSlot<T, CAP> {
        &self.tracks[index]
    }

    /// Raw pointer to the slot's value storage. Dereferencing is only
    /// valid for initialized slots under the appropriate lock.
    #[inline]
    pub(crate) fn value_ptr(&self, index: usize) -> *mut T {
        self.slots[index].get().cast()
    }

    // === Free-list state ===

    /// Caller must hold the maintenance lock.
    #[inline]
    pub(crate) fn in_free_list(&self) -> bool {
        debug_assert!(self.maintenance.is_locked());
        // Safety: guarded by the maintenance lock, which the caller holds.
        unsafe { *self.in_free_list.get() }
    }

    /// Caller must hold the maintenance lock.
    #[inline]
    pub(crate) fn set_in_free_list(&self, value: bool) {
        debug_assert!(self.maintenance.is_locked());
        // Safety: guarded by the maintenance lock, which the caller holds.
        unsafe { *self.in_free_list.get() = value }
    }

    // === Chain links ===

    pub(crate) fn next(&self) -> Option<Arc<Self>> {
        self.links_lock
            // Safety: guarded by `links_lock`.
            .with(|| unsafe { (*self.links.get()).next.clone() })
    }

    pub(crate) fn prev(&self) -> Option<Arc<Self>> {
        self.links_lock
            // Safety: guarded by `links_lock`.
            .with(|| unsafe { (*self.links.get()).prev.clone() })
    }

    pub(crate) fn set_next(&self, next: Option<Arc<Self>>) {
        // Drop the displaced Arc outside the leaf lock: its drop may run
        // a chunk teardown that takes other locks.
        let old = self
            .links_lock
            // Safety: guarded by `links_lock`.
            .with(|| unsafe { mem::replace(&mut (*self.links.get()).next, next) });
        drop(old);
    }

    pub(crate) fn set_prev(&self, prev: Option<Arc<Self>>) {
        let old = self
            .links_lock
            // Safety: guarded by `links_lock`.
            .with(|| unsafe { mem::replace(&mut (*self.links.get()).prev, prev) });
        drop(old);
    }

    /// Replaces `next` with `new` only if it currently points at
    /// `expected`. Idempotent under racing unlinks of neighbors.
    fn cas_next(&self, expected: *const Self, new: &Option<Arc<Self>>) {
        let old = self.links_lock.with(|| {
            // Safety: guarded by `links_lock`.
            let links = unsafe { &mut *self.links.get() };
            if links.next.as_ref().map(Arc::as_ptr) == Some(expected) {
                mem::replace(&mut links.next, new.clone())
            } else {
                None
            }
        });
        drop(old);
    }

    fn cas_prev(&self, expected: *const Self, new: &Option<Arc<Self>>) {
        let old = self.links_lock.with(|| {
            // Safety: guarded by `links_lock`.
            let links = unsafe { &mut *self.links.get() };
            if links.prev.as_ref().map(Arc::as_ptr) == Some(expected) {
                mem::replace(&mut links.prev, new.clone())
            } else {
                None
            }
        });
        drop(old);
    }

    /// Unlinks this chunk from the chain. Caller holds exclusive ownership
    /// and the maintenance lock, and keeps the chunk referenced for the
    /// duration of the call.
    ///
    /// `next` is deliberately left in place: a walker parked on this chunk
    /// still reaches the rest of the chain through it. `prev` is cleared so
    /// no stale back-edge survives the unlink.
    pub(crate) fn unlink(&self) {
        let prev = self.prev();
        let next = self.next();
        let me = self as *const Self;
        if let Some(p) = &prev {
            p.cas_next(me, &next);
        }
        if let Some(n) = &next {
            n.cas_prev(me, &prev);
        }
        self.set_prev(None);
    }

    // === Slot storage ===

    /// Drops the value in an initialized slot.
    ///
    /// # Safety
    ///
    /// The slot must be initialized and unobservable by other threads
    /// (exclusive ownership + maintenance lock, or teardown).
    unsafe fn drop_slot(&self, index: usize) {
        ptr::drop_in_place(self.value_ptr(index));
    }

    /// Moves the value out of an initialized slot, leaving it uninitialized.
    ///
    /// # Safety
    ///
    /// As for [`drop_slot`](Self::drop_slot).
    unsafe fn take_slot(&self, index: usize) -> T {
        self.value_ptr(index).read()
    }

    /// Writes a value into an uninitialized slot.
    ///
    /// # Safety
    ///
    /// The slot must be uninitialized and unobservable by other threads.
    unsafe fn write_slot(&self, index: usize, value: T) {
        self.value_ptr(index).write(value);
    }

    /// Constructs `value` in the slot at `size` and publishes it.
    ///
    /// Caller holds the maintenance lock, which excludes reorganization
    /// and other appends; concurrent iterators are safe against the append
    /// because the alive flag is released before the new `size`, so a
    /// reader that acquires the new `size` observes a fully constructed
    /// value behind the flag.
    pub(crate) fn emplace_at_tail(&self, value: T) -> usize {
        debug_assert!(self.maintenance.is_locked());
        let index = self.size.load(Ordering::Relaxed);
        debug_assert!(index < CAP);
        // Safety: `[size, CAP)` is uninitialized, and the maintenance lock
        // keeps `size` from moving under us.
        unsafe { self.write_slot(index, value) };
        self.alive[index].store(true, Ordering::Release);
        self.size.store(index + 1, Ordering::Release);
        index
    }

    /// Marks a slot dead. Callable under shared ownership; the value is
    /// reclaimed later by maintenance or teardown.
    ///
    /// Counts only a true alive-to-dead transition, so racing erases of
    /// the same slot cannot corrupt `deleted`.
    pub(crate) fn erase(&self, index: usize) {
        debug_assert!(index < CAP);
        if self.alive[index].swap(false, Ordering::Release) {
            self.deleted.fetch_add(1, Ordering::Relaxed);
        }
    }

    // === Maintenance ===

    /// Closes every hole in `[0, size)`, moving tail elements down and
    /// reclaiming dead values. On return `deleted == 0` and `[0, size)` is
    /// all alive.
    ///
    /// Caller holds exclusive ownership and the maintenance lock, so the
    /// relaxed flag loads below cannot race with erases or readers.
    pub(crate) fn compact(&self) {
        debug_assert!(self.maintenance.is_locked());
        let mut size = self.size.load(Ordering::Relaxed);
        let mut deleted_left = self.deleted.load(Ordering::Relaxed);
        let mut i = 0;
        while i < size {
            if self.alive[i].load(Ordering::Relaxed) {
                i += 1;
                continue;
            }
            // Trim trailing dead slots first; they still hold values.
            while !self.alive[size - 1].load(Ordering::Relaxed) {
                Self::notify_deleted(self, size - 1);
                // Safety: initialized (dead slots keep their value until
                // reclaimed here) and unobservable under our locks.
                unsafe { self.drop_slot(size - 1) };
                deleted_left -= 1;
                size -= 1;
                if size == 0 {
                    break;
                }
            }
            if i >= size {
                break;
            }
            // The tail element is alive; move it into the hole at `i`.
            Self::notify_moved(self, size - 1, self, i);
            // Safety: both slots are in `[0, size)` and unobservable;
            // the hole's dead value is dropped before being overwritten,
            // and the donor is left uninitialized past the new size.
            unsafe {
                self.drop_slot(i);
                let value = self.take_slot(size - 1);
                self.write_slot(i, value);
            }
            self.alive[i].store(true, Ordering::Release);
            self.alive[size - 1].store(false, Ordering::Release);
            size -= 1;
            deleted_left -= 1;
            if deleted_left == 0 {
                break;
            }
            i += 1;
        }
        self.deleted.store(0, Ordering::Relaxed);
        self.size.store(size, Ordering::Release);
    }

    /// Moves every live element of `from` to this chunk's tail and empties
    /// `from`. Caller holds exclusive ownership of both chunks and both
    /// maintenance locks; combined occupancy must fit.
    pub(crate) fn merge_from(&self, from: &Chunk<T, CAP>) {
        debug_assert!(self.maintenance.is_locked() && from.maintenance.is_locked());
        if self.deleted_count() > 0 {
            self.compact();
        }
        let from_size = from.size.load(Ordering::Relaxed);
        for i in 0..from_size {
            if !from.alive[i].load(Ordering::Relaxed) {
                // Dead slots still hold a value and may still have handles.
                Self::notify_deleted(from, i);
                // Safety: initialized, unobservable under both locks.
                unsafe { from.drop_slot(i) };
                continue;
            }
            let to_index = self.size.load(Ordering::Relaxed);
            debug_assert!(to_index < CAP);
            Self::notify_moved(from, i, self, to_index);
            // Safety: source is initialized, destination slot is past
            // `size` and therefore uninitialized; both unobservable.
            unsafe {
                let value = from.take_slot(i);
                self.write_slot(to_index, value);
            }
            self.alive[to_index].store(true, Ordering::Release);
            self.size.store(to_index + 1, Ordering::Release);
            from.alive[i].store(false, Ordering::Release);
        }
        from.size.store(0, Ordering::Release);
        from.deleted.store(0, Ordering::Relaxed);
    }

    // === Trackable-handle registry ===

    /// Kills every handle registered at `(chunk, index)`.
    pub(crate) fn notify_deleted(chunk: &Chunk<T, CAP>, index: usize) {
        let slot = &chunk.tracks[index];
        if !slot.have.load(Ordering::Acquire) {
            return;
        }
        slot.lock.with(|| {
            // Safety: list links are guarded by the slot lock; each node's
            // target by the node's lock, taken below.
            unsafe {
                let mut node = *slot.head.get();
                while !node.is_null() {
                    let n = &*node;
                    node = n.lock.with(|| {
                        *n.target.get() = None;
                        *n.next.get()
                    });
                }
                *slot.head.get() = ptr::null_mut();
            }
            slot.have.store(false, Ordering::Release);
        });
    }

    /// Retargets every handle registered at the source slot to the
    /// destination slot, splicing the list across.
    ///
    /// A destination that already has handles has lost its identity (its
    /// element was dead or is being overwritten): those handles are killed
    /// first. Reachable from compaction (a hole whose erased handles were
    /// never notified) as well as from merge.
    pub(crate) fn notify_moved(
        from: &Chunk<T, CAP>,
        from_index: usize,
        to: &Chunk<T, CAP>,
        to_index: usize,
    ) {
        if ptr::eq(from, to) && from_index == to_index {
            return;
        }
        let src = &from.tracks[from_index];
        let dst = &to.tracks[to_index];
        let have_src = src.have.load(Ordering::Acquire);
        let have_dst = dst.have.load(Ordering::Acquire);
        if !have_src && !have_dst {
            return;
        }
        SpinLock::lock_pair(&src.lock, &dst.lock);
        // Safety: both slot locks are held; node targets are rewritten
        // under each node's own lock.
        unsafe {
            let mut node = *dst.head.get();
            while !node.is_null() {
                let n = &*node;
                node = n.lock.with(|| {
                    *n.target.get() = None;
                    *n.next.get()
                });
            }
            let head = *src.head.get();
            let mut node = head;
            while !node.is_null() {
                let n = &*node;
                node = n.lock.with(|| {
                    *n.target.get() = Some(Target {
                        chunk: to.weak(),
                        index: to_index,
                    });
                    *n.next.get()
                });
            }
            *dst.head.get() = head;
            *src.head.get() = ptr::null_mut();
        }
        src.have.store(false, Ordering::Release);
        dst.have.store(have_src, Ordering::Release);
        dst.lock.unlock();
        src.lock.unlock();
    }
}

impl<T, const CAP: usize> Drop for Chunk<T, CAP> {
    fn drop(&mut self) {
        let size = self.size.load(Ordering::Relaxed);
        for i in 0..size {
            // Handles go dead whether their slot was alive or
            // erased-but-unreclaimed.
            Self::notify_deleted(self, i);
            // Safety: `[0, size)` is initialized and nothing else can
            // reach the chunk once its strong count is zero.
            unsafe { self.drop_slot(i) };
        }
    }
}
