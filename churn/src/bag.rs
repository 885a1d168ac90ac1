//! The container front-end: head-chunk management, insert, erase,
//! visitor-driven iteration, and the online maintenance driver.
//!
//! Maintenance (deletion, merge, compaction) is piggybacked on the unlock
//! path of every exclusive hold of a chunk: iteration runs it after
//! visiting, erase tries to run it immediately, and a handle access runs
//! it when the access guard drops. It only fires at ownership depth one,
//! so re-entrant holds never reorganize a chunk out from under an outer
//! cursor.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use churn_spin::{RawLock, RawRwLock, SpinLock};

use crate::chunk::Chunk;
use crate::free_list::FreeList;
use crate::handle::{register, Handle};

/// A concurrent unordered container with dense chunked storage.
///
/// Elements live in fixed-capacity chunks (`CAP` slots each) strung on a
/// doubly-linked chain. Iteration visits chunk by chunk under the chunk's
/// own lock, insertion fills non-full chunks found through a free-chunk
/// registry, and erasure marks slots dead for the next maintenance pass to
/// reclaim. Any number of threads may insert, erase, iterate, and lock
/// [`Handle`]s at once, including from inside a visitor on the same
/// container.
///
/// The container is an unordered multiset: no insertion order, no indexed
/// access, no external iterator. Iteration is always visitor-driven so the
/// chunk lock brackets each visit exactly.
///
/// Compile-time knobs:
///
/// - `CAP`: slots per chunk, see [`chunk_capacity`](crate::chunk_capacity)
///   for the sizing rule behind the default.
/// - `EAGER_ERASE`: when true (default), erasing through a cursor tries to
///   reclaim the slot immediately; when false, reclamation waits for the
///   next iteration over the chunk.
/// - `CHECK_ALIVENESS`: when true, locking a handle re-checks the slot's
///   alive flag and reports dead for an erased-but-unreclaimed slot.
///   Defaults to false: maintenance kills handles when it reclaims slots.
pub struct Bag<
    T,
    const CAP: usize = 32,
    const EAGER_ERASE: bool = true,
    const CHECK_ALIVENESS: bool = false,
> {
    inner: Arc<Inner<T, CAP>>,
}

pub(crate) struct Inner<T, const CAP: usize> {
    first_lock: SpinLock,
    /// Head of the chunk chain. Guarded by `first_lock`.
    first: UnsafeCell<Option<Arc<Chunk<T, CAP>>>>,
    pub(crate) free_list: FreeList<T, CAP>,
}

// Safety: `first` is only touched under `first_lock`; everything else is
// synchronized by the chunk and registry locks.
unsafe impl<T: Send, const CAP: usize> Send for Inner<T, CAP> {}
unsafe impl<T: Send + Sync, const CAP: usize> Sync for Inner<T, CAP> {}

impl<T, const CAP: usize, const EAGER_ERASE: bool, const CHECK_ALIVENESS: bool>
    Bag<T, CAP, EAGER_ERASE, CHECK_ALIVENESS>
{
    /// Creates an empty container. Does not allocate until the first
    /// insertion.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                first_lock: SpinLock::new(),
                first: UnsafeCell::new(None),
                free_list: FreeList::new(),
            }),
        }
    }

    /// Inserts a value and returns a deferred handle factory.
    ///
    /// Call [`Inserted::handle`] to get a trackable [`Handle`] to the new
    /// element; just dropping the [`Inserted`] leaves the element in place
    /// with no handle. The factory holds the chunk's maintenance lock, so
    /// the new slot cannot move or die before you decide.
    pub fn insert(&self, value: T) -> Inserted<T, CAP, CHECK_ALIVENESS> {
        let chunk = match self.inner.free_list.acquire() {
            Some(chunk) => chunk,
            None => self.grow_head(),
        };
        // The maintenance lock is held from acquisition to `Inserted`'s
        // drop.
        let index = chunk.emplace_at_tail(value);
        if chunk.is_full() {
            self.inner.free_list.remove(&chunk);
        }
        Inserted { chunk, index }
    }

    /// Takes the head chunk, creating or growing the chain as needed,
    /// with its maintenance lock held.
    fn grow_head(&self) -> Arc<Chunk<T, CAP>> {
        self.inner.first_lock.lock();
        // Safety: guarded by `first_lock`.
        let first = unsafe { &mut *self.inner.first.get() };
        let head = match first {
            Some(head) => head.clone(),
            None => {
                let head = Chunk::new(Arc::downgrade(&self.inner));
                head.is_first.store(true, Ordering::Release);
                *first = Some(head.clone());
                head
            }
        };
        head.maintenance.lock();
        let chunk = if head.is_full() {
            let fresh = Chunk::new(Arc::downgrade(&self.inner));
            fresh.set_next(Some(head.clone()));
            head.set_prev(Some(fresh.clone()));
            fresh.is_first.store(true, Ordering::Release);
            head.is_first.store(false, Ordering::Release);
            *first = Some(fresh.clone());
            // Take the fresh lock before releasing the old one so the
            // demoted head cannot be restructured mid-splice.
            fresh.maintenance.lock();
            head.maintenance.unlock();
            fresh
        } else {
            head
        };
        self.inner.first_lock.unlock();
        chunk
    }

    /// Erases the element a handle points to. No-op when the handle is
    /// dead.
    pub fn erase(&self, handle: &Handle<T, CAP, CHECK_ALIVENESS>) {
        if let Some(access) = handle.lock_mut() {
            access.erase();
        }
    }

    /// Visits every element under exclusive chunk locks.
    ///
    /// The visitor receives a [`CursorMut`] per live slot and may mutate
    /// the element, [`erase`](CursorMut::erase) it, take a
    /// [`handle`](CursorMut::handle) to it, and insert into this same
    /// container. Chunks whose lock is contended are revisited until the
    /// whole chain has been seen exactly once.
    pub fn iterate(
        &self,
        mut visitor: impl FnMut(CursorMut<'_, T, CAP, EAGER_ERASE, CHECK_ALIVENESS>),
    ) {
        self.walk(
            |chunk| chunk.lock.try_lock(),
            |chunk| {
                let size = chunk.size();
                for index in 0..size {
                    if chunk.is_alive(index) {
                        visitor(CursorMut {
                            bag: self,
                            chunk,
                            index,
                        });
                    }
                }
                maintain_and_unlock_exclusive(chunk, Some(&self.inner));
            },
        );
    }

    /// Visits every element under shared chunk locks.
    ///
    /// Multiple shared iterations proceed in parallel over the same
    /// chunks. The visitor gets read access only; it may still erase
    /// through the cursor (reclamation is deferred) and take handles.
    pub fn iterate_shared(
        &self,
        mut visitor: impl FnMut(Cursor<'_, T, CAP, EAGER_ERASE, CHECK_ALIVENESS>),
    ) {
        self.walk(
            |chunk| chunk.lock.try_lock_shared(),
            |chunk| {
                let size = chunk.size();
                for index in 0..size {
                    if chunk.is_alive(index) {
                        visitor(Cursor {
                            bag: self,
                            chunk,
                            index,
                        });
                    }
                }
                maintain_and_unlock_shared(chunk, Some(&self.inner));
            },
        );
    }

    /// Walks the chain, visiting each chunk exactly once: skipped
    /// (contended) chunks are retried until acquired, yielding between
    /// passes. `visit` must release the lock `try_lock` took.
    fn walk(
        &self,
        mut try_lock: impl FnMut(&Chunk<T, CAP>) -> bool,
        mut visit: impl FnMut(&Chunk<T, CAP>),
    ) {
        let mut skipped = Vec::new();

        let mut cursor = self.snapshot_head();
        while let Some(chunk) = cursor {
            if try_lock(&chunk) {
                visit(&chunk);
            } else {
                skipped.push(chunk.clone());
            }
            // A concurrently deleted chunk keeps its forward link, so the
            // walk cannot fall off the chain mid-way.
            cursor = chunk.next();
        }

        while !skipped.is_empty() {
            let mut i = 0;
            while i < skipped.len() {
                if try_lock(&skipped[i]) {
                    let chunk = skipped.swap_remove(i);
                    visit(&chunk);
                } else {
                    i += 1;
                }
            }
            thread::yield_now();
        }
    }

    fn snapshot_head(&self) -> Option<Arc<Chunk<T, CAP>>> {
        self.inner
            .first_lock
            // Safety: guarded by `first_lock`.
            .with(|| unsafe { (*self.inner.first.get()).clone() })
    }

    /// Number of chunks in the chain. Best-effort: concurrent growth,
    /// merges and deletions make this an estimate.
    pub fn chunk_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.snapshot_head();
        while let Some(chunk) = cursor {
            count += 1;
            cursor = chunk.next();
        }
        count
    }
}

impl<T, const CAP: usize, const EAGER_ERASE: bool, const CHECK_ALIVENESS: bool> Default
    for Bag<T, CAP, EAGER_ERASE, CHECK_ALIVENESS>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const CAP: usize, const EAGER_ERASE: bool, const CHECK_ALIVENESS: bool> fmt::Debug
    for Bag<T, CAP, EAGER_ERASE, CHECK_ALIVENESS>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bag")
            .field("chunk_count", &self.chunk_count())
            .finish_non_exhaustive()
    }
}

impl<T, const CAP: usize, const EAGER_ERASE: bool, const CHECK_ALIVENESS: bool> Drop
    for Bag<T, CAP, EAGER_ERASE, CHECK_ALIVENESS>
{
    fn drop(&mut self) {
        // Sever the chain chunk by chunk. Locking each chunk first makes
        // teardown block until in-flight iterations and handle accesses
        // release it; each severed chunk then tears down (and kills its
        // handles) as the last strong reference drops.
        //
        // Teardown runs here, not in a `Drop` for `Inner`: maintenance
        // briefly upgrades the chunks' weak container reference, and an
        // `Inner` teardown triggered by that upgrade expiring would run on
        // the maintainer's thread, under the very chunk locks it needs.
        let mut cursor = self
            .inner
            .first_lock
            // Safety: guarded by `first_lock`.
            .with(|| unsafe { (*self.inner.first.get()).take() });
        while let Some(chunk) = cursor {
            chunk.lock.lock();
            chunk.maintenance.lock();
            let next = chunk.next();
            chunk.set_next(None);
            chunk.set_prev(None);
            chunk.maintenance.unlock();
            chunk.lock.unlock();
            cursor = next;
        }
    }
}

/// A freshly inserted element whose chunk maintenance lock is still held:
/// the slot cannot move or die until this value is dropped.
///
/// Produced by [`Bag::insert`]; call [`handle`](Self::handle) to register
/// a trackable handle, or drop it to keep the element without one.
pub struct Inserted<T, const CAP: usize, const CHECK_ALIVENESS: bool = false> {
    chunk: Arc<Chunk<T, CAP>>,
    index: usize,
}

impl<T, const CAP: usize, const CHECK_ALIVENESS: bool> Inserted<T, CAP, CHECK_ALIVENESS> {
    /// Registers and returns a trackable handle to the element.
    pub fn handle(self) -> Handle<T, CAP, CHECK_ALIVENESS> {
        // Registration happens while the maintenance lock is still held,
        // so the slot cannot have moved since publication.
        register(&self.chunk, self.index)
    }
}

impl<T, const CAP: usize, const CHECK_ALIVENESS: bool> Drop for Inserted<T, CAP, CHECK_ALIVENESS> {
    fn drop(&mut self) {
        self.chunk.maintenance.unlock();
    }
}

impl<T, const CAP: usize, const CHECK_ALIVENESS: bool> fmt::Debug
    for Inserted<T, CAP, CHECK_ALIVENESS>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inserted")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

/// A live slot visited by [`Bag::iterate`]. Dereferences to the element.
pub struct CursorMut<
    'a,
    T,
    const CAP: usize,
    const EAGER_ERASE: bool,
    const CHECK_ALIVENESS: bool,
> {
    bag: &'a Bag<T, CAP, EAGER_ERASE, CHECK_ALIVENESS>,
    chunk: &'a Chunk<T, CAP>,
    index: usize,
}

impl<T, const CAP: usize, const EAGER_ERASE: bool, const CHECK_ALIVENESS: bool>
    CursorMut<'_, T, CAP, EAGER_ERASE, CHECK_ALIVENESS>
{
    /// Erases the visited element. With `EAGER_ERASE`, tries to reclaim
    /// the slot right away; a failed try is benign, since the next
    /// iteration over this chunk reclaims it.
    pub fn erase(self) {
        self.chunk.erase(self.index);
        if EAGER_ERASE && self.chunk.lock.try_lock() {
            maintain_and_unlock_exclusive(self.chunk, Some(&self.bag.inner));
        }
    }

    /// Registers and returns a trackable handle to the visited element.
    pub fn handle(&self) -> Handle<T, CAP, CHECK_ALIVENESS> {
        register(self.chunk, self.index)
    }
}

impl<T, const CAP: usize, const EAGER_ERASE: bool, const CHECK_ALIVENESS: bool> Deref
    for CursorMut<'_, T, CAP, EAGER_ERASE, CHECK_ALIVENESS>
{
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the visiting thread holds the chunk exclusively and the
        // slot was alive when the cursor was produced.
        unsafe { &*self.chunk.value_ptr(self.index) }
    }
}

impl<T, const CAP: usize, const EAGER_ERASE: bool, const CHECK_ALIVENESS: bool> DerefMut
    for CursorMut<'_, T, CAP, EAGER_ERASE, CHECK_ALIVENESS>
{
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as in `deref`, and the hold is exclusive.
        unsafe { &mut *self.chunk.value_ptr(self.index) }
    }
}

/// A live slot visited by [`Bag::iterate_shared`]. Dereferences to the
/// element; no mutable access.
pub struct Cursor<'a, T, const CAP: usize, const EAGER_ERASE: bool, const CHECK_ALIVENESS: bool> {
    bag: &'a Bag<T, CAP, EAGER_ERASE, CHECK_ALIVENESS>,
    chunk: &'a Chunk<T, CAP>,
    index: usize,
}

impl<T, const CAP: usize, const EAGER_ERASE: bool, const CHECK_ALIVENESS: bool>
    Cursor<'_, T, CAP, EAGER_ERASE, CHECK_ALIVENESS>
{
    /// Erases the visited element. Under a shared hold the immediate
    /// reclamation try always fails; the slot is reclaimed by the next
    /// exclusive pass.
    pub fn erase(self) {
        self.chunk.erase(self.index);
        if EAGER_ERASE && self.chunk.lock.try_lock() {
            maintain_and_unlock_exclusive(self.chunk, Some(&self.bag.inner));
        }
    }

    /// Registers and returns a trackable handle to the visited element.
    pub fn handle(&self) -> Handle<T, CAP, CHECK_ALIVENESS> {
        register(self.chunk, self.index)
    }
}

impl<T, const CAP: usize, const EAGER_ERASE: bool, const CHECK_ALIVENESS: bool> Deref
    for Cursor<'_, T, CAP, EAGER_ERASE, CHECK_ALIVENESS>
{
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the visiting thread holds the chunk shared; shared
        // holders exclude reorganization and exclusive mutation.
        unsafe { &*self.chunk.value_ptr(self.index) }
    }
}

// === Maintenance driver ===

/// Releases an exclusive hold, running maintenance first when the chunk
/// needs it and this is the outermost hold.
pub(crate) fn maintain_and_unlock_exclusive<T, const CAP: usize>(
    chunk: &Chunk<T, CAP>,
    inner: Option<&Inner<T, CAP>>,
) {
    let need_merge = !chunk.is_first() && chunk.alive_size() <= Chunk::<T, CAP>::MERGE_THRESHOLD;
    let need_compact = chunk.deleted_count() > 0;
    if need_merge || need_compact {
        try_maintain(chunk, need_merge, inner);
    }
    chunk.lock.unlock();
}

/// Releases a shared hold; if the chunk needs maintenance, tries to
/// upgrade to an exclusive hold to run it.
pub(crate) fn maintain_and_unlock_shared<T, const CAP: usize>(
    chunk: &Chunk<T, CAP>,
    inner: Option<&Inner<T, CAP>>,
) {
    let need_merge = !chunk.is_first() && chunk.alive_size() <= Chunk::<T, CAP>::MERGE_THRESHOLD;
    let need_compact = chunk.deleted_count() > 0;
    chunk.lock.unlock_shared();
    if (need_merge || need_compact) && chunk.lock.try_lock() {
        try_maintain(chunk, need_merge, inner);
        chunk.lock.unlock();
    }
}

fn try_maintain<T, const CAP: usize>(
    chunk: &Chunk<T, CAP>,
    need_merge: bool,
    inner: Option<&Inner<T, CAP>>,
) {
    // Only the outermost hold may reorganize: a re-entered hold means a
    // cursor somewhere up the stack is pointing into this chunk.
    if chunk.lock.level() != 1 {
        return;
    }

    if try_delete(chunk, inner) {
        return;
    }

    if need_merge {
        let merged = match chunk.prev() {
            Some(prev) => try_merge_with(chunk, &prev, inner),
            None => false,
        };
        if !merged {
            if let Some(next) = chunk.next() {
                try_merge_with(chunk, &next, inner);
            }
        }
    }

    // Still holes after the merge attempt (or no merge was needed)?
    if chunk.deleted_count() > 0 {
        chunk.maintenance.lock();
        chunk.compact();
        try_add_to_free_list(chunk, inner);
        chunk.maintenance.unlock();
    }
}

/// Deletes an empty non-anchor chunk from the chain. The chunk's memory is
/// reclaimed when its last external reference drops.
fn try_delete<T, const CAP: usize>(chunk: &Chunk<T, CAP>, inner: Option<&Inner<T, CAP>>) -> bool {
    if chunk.alive_size() > 0 || chunk.is_first() {
        return false;
    }
    chunk.maintenance.lock();
    if chunk.alive_size() > 0 || chunk.is_first() {
        chunk.maintenance.unlock();
        return false;
    }
    try_remove_from_free_list(chunk, inner);
    chunk.unlink();
    chunk.maintenance.unlock();
    true
}

fn can_merge<T, const CAP: usize>(a: &Chunk<T, CAP>, b: &Chunk<T, CAP>) -> bool {
    !a.is_first()
        && !b.is_first()
        && a.alive_size() + b.alive_size() <= Chunk::<T, CAP>::MERGE_THRESHOLD
}

/// Attempts to merge `chunk` (exclusively held by the caller) with a
/// neighbor. The neighbor's ownership is only tried, never waited on; the
/// two maintenance locks are taken in address order.
fn try_merge_with<T, const CAP: usize>(
    chunk: &Chunk<T, CAP>,
    other: &Arc<Chunk<T, CAP>>,
    inner: Option<&Inner<T, CAP>>,
) -> bool {
    if !can_merge(chunk, other) {
        return false;
    }
    if !other.lock.try_lock() {
        return false;
    }
    if other.lock.level() != 1 {
        // This thread already holds the neighbor further up its stack;
        // a cursor may be parked inside it.
        other.lock.unlock();
        return false;
    }
    SpinLock::lock_pair(&chunk.maintenance, &other.maintenance);
    // Re-check under the locks; occupancy may have moved.
    let merged = can_merge(chunk, other);
    if merged {
        // Move into the larger side; ties go to the neighbor.
        let (to, from): (&Chunk<T, CAP>, &Chunk<T, CAP>) =
            if chunk.alive_size() > other.alive_size() {
                (chunk, other)
            } else {
                (other, chunk)
            };
        to.merge_from(from);
        try_remove_from_free_list(from, inner);
        try_add_to_free_list(to, inner);
        from.unlink();
    }
    chunk.maintenance.unlock();
    other.maintenance.unlock();
    other.lock.unlock();
    merged
}

/// Runs `f` against the owning container, if it is still alive. Callers
/// inside a container operation pass it directly; maintenance reached from
/// a handle-access drop resolves it through the chunk's back-reference.
fn with_inner<T, const CAP: usize>(
    chunk: &Chunk<T, CAP>,
    inner: Option<&Inner<T, CAP>>,
    f: impl FnOnce(&Inner<T, CAP>),
) {
    match inner {
        Some(inner) => f(inner),
        None => {
            if let Some(inner) = chunk.container.upgrade() {
                f(&inner);
            }
        }
    }
}

fn try_add_to_free_list<T, const CAP: usize>(chunk: &Chunk<T, CAP>, inner: Option<&Inner<T, CAP>>) {
    if chunk.in_free_list() || chunk.is_full() || chunk.is_first() {
        return;
    }
    with_inner(chunk, inner, |inner| inner.free_list.add(chunk));
}

fn try_remove_from_free_list<T, const CAP: usize>(
    chunk: &Chunk<T, CAP>,
    inner: Option<&Inner<T, CAP>>,
) {
    if !chunk.in_free_list() {
        return;
    }
    with_inner(chunk, inner, |inner| inner.free_list.remove(chunk));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn chunks<const CAP: usize>(bag: &Bag<u64, CAP>) -> Vec<Arc<Chunk<u64, CAP>>> {
        let mut out = Vec::new();
        let mut cursor = bag.snapshot_head();
        while let Some(chunk) = cursor {
            cursor = chunk.next();
            out.push(chunk);
        }
        out
    }

    /// Per-chunk counter coherence, checked at quiescent points.
    fn assert_chunk_invariants<const CAP: usize>(bag: &Bag<u64, CAP>) {
        for chunk in chunks(bag) {
            let size = chunk.size();
            let deleted = chunk.deleted_count();
            assert!(deleted <= size, "deleted {deleted} > size {size}");
            assert!(size <= CAP, "size {size} > capacity {CAP}");
            let alive = (0..size).filter(|&i| chunk.is_alive(i)).count();
            assert_eq!(alive, size - deleted);
        }
    }

    fn collect<const CAP: usize>(bag: &Bag<u64, CAP>) -> Vec<u64> {
        let mut values = Vec::new();
        bag.iterate(|item| values.push(*item));
        values.sort_unstable();
        values
    }

    // ========================================================================
    // Multiset laws
    // ========================================================================

    #[test]
    fn insert_then_iterate_yields_the_multiset() {
        let bag: Bag<u64, 4> = Bag::new();
        for v in 0..13 {
            bag.insert(v);
        }
        bag.insert(7);

        let mut expected: Vec<u64> = (0..13).collect();
        expected.push(7);
        expected.sort_unstable();
        assert_eq!(collect(&bag), expected);
        assert_chunk_invariants(&bag);
    }

    #[test]
    fn erased_values_disappear_from_iteration() {
        let bag: Bag<u64, 4> = Bag::new();
        for v in 0..10 {
            bag.insert(v);
        }
        bag.iterate(|item| {
            if *item % 3 == 0 {
                item.erase();
            }
        });

        assert_eq!(collect(&bag), vec![1, 2, 4, 5, 7, 8]);
        assert_chunk_invariants(&bag);
    }

    #[test]
    fn empty_bag_iterates_nothing() {
        let bag: Bag<u64, 4> = Bag::new();
        let mut visited = 0;
        bag.iterate(|_| visited += 1);
        assert_eq!(visited, 0);
        assert_eq!(bag.chunk_count(), 0);
    }

    #[test]
    fn discarding_the_factory_keeps_the_element() {
        let bag: Bag<u64, 4> = Bag::new();
        // Each drop must release the maintenance lock, or the next insert
        // into the same chunk would hang.
        bag.insert(1);
        bag.insert(2);
        bag.insert(3);
        assert_eq!(collect(&bag), vec![1, 2, 3]);
    }

    #[test]
    fn shared_iteration_reads_everything() {
        let bag: Bag<u64, 8> = Bag::new();
        for v in 0..20 {
            bag.insert(v);
        }
        let mut sum = 0;
        bag.iterate_shared(|item| sum += *item);
        assert_eq!(sum, (0..20).sum::<u64>());
    }

    #[test]
    fn erase_through_a_shared_cursor_defers_reclamation() {
        let bag: Bag<u64, 4> = Bag::new();
        for v in 0..8 {
            bag.insert(v);
        }
        bag.iterate_shared(|item| {
            if *item < 4 {
                item.erase();
            }
        });
        // The slots are dead either way; the next exclusive pass reclaims.
        assert_eq!(collect(&bag), vec![4, 5, 6, 7]);
        for chunk in chunks(&bag) {
            assert_eq!(chunk.deleted_count(), 0);
        }
    }

    #[test]
    fn visitor_may_insert_into_the_same_bag() {
        let bag: Bag<u64, 4> = Bag::new();
        for v in 0..4 {
            bag.insert(v);
        }
        let mut inserted = false;
        bag.iterate(|item| {
            if *item == 0 && !inserted {
                inserted = true;
                bag.insert(100);
            }
        });
        let values = collect(&bag);
        assert!(values.contains(&100));
        assert_eq!(values.len(), 5);
    }

    // ========================================================================
    // Chunk lifecycle
    // ========================================================================

    #[test]
    fn drain_through_iteration_leaves_only_the_anchor() {
        let bag: Bag<u64, 4> = Bag::new();
        for v in 0..16 {
            bag.insert(v);
        }
        assert_eq!(bag.chunk_count(), 4);

        bag.iterate(|item| item.erase());

        assert_eq!(bag.chunk_count(), 1);
        assert_eq!(collect(&bag), Vec::<u64>::new());
        assert_chunk_invariants(&bag);
    }

    #[test]
    fn maintenance_compacts_every_dirty_chunk() {
        let bag: Bag<u64, 4> = Bag::new();
        for v in 0..8 {
            bag.insert(v);
        }
        bag.iterate(|item| {
            if *item == 1 || *item == 2 || *item == 5 {
                item.erase();
            }
        });

        let mut alive_total = 0;
        for chunk in chunks(&bag) {
            assert_eq!(chunk.deleted_count(), 0);
            alive_total += chunk.alive_size();
        }
        assert_eq!(alive_total, 5);
        assert_eq!(collect(&bag), vec![0, 3, 4, 6, 7]);
    }

    #[test]
    fn demoted_head_is_deleted_once_empty() {
        let bag: Bag<u64, 4> = Bag::new();
        let handles: Vec<_> = (0..4).map(|v| bag.insert(v).handle()).collect();
        assert_eq!(bag.chunk_count(), 1);

        // Fifth insert splices a fresh anchor; the old head is demoted.
        bag.insert(4);
        assert_eq!(bag.chunk_count(), 2);

        for h in &handles {
            bag.erase(h);
        }
        bag.iterate(|_| {});

        assert_eq!(bag.chunk_count(), 1);
        assert_eq!(collect(&bag), vec![4]);
    }

    #[test]
    fn emptied_chunks_feed_the_free_list() {
        let bag: Bag<u64, 4> = Bag::new();
        for v in 0..8 {
            bag.insert(v);
        }
        // Empty out the demoted chunk except one element: it becomes
        // non-full and must absorb subsequent inserts instead of growing
        // the chain.
        bag.iterate(|item| {
            if *item < 3 {
                item.erase();
            }
        });
        assert_eq!(bag.chunk_count(), 2);

        for v in 100..103 {
            bag.insert(v);
        }
        assert_eq!(bag.chunk_count(), 2);
        assert_eq!(collect(&bag), vec![3, 4, 5, 6, 7, 100, 101, 102]);
        assert_chunk_invariants(&bag);
    }

    #[test]
    fn clustered_erasure_collapses_the_chain() {
        let bag: Bag<u64, 32> = Bag::new();
        for v in 0..1000 {
            bag.insert(v);
        }
        bag.iterate(|item| {
            if *item >= 300 {
                item.erase();
            }
        });

        // Nine full chunks, one straddling chunk, plus the anchor.
        assert!(bag.chunk_count() <= 12, "count {}", bag.chunk_count());
        assert_eq!(collect(&bag), (0..300).collect::<Vec<_>>());
        assert_chunk_invariants(&bag);
    }

    #[test]
    fn random_erasure_preserves_the_survivor_multiset() {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let mut rng = rand::rngs::SmallRng::seed_from_u64(0xC0FFEE);
        let bag: Bag<u64, 32> = Bag::new();
        let handles: Vec<_> = (0..1000).map(|v| bag.insert(v).handle()).collect();

        let mut order: Vec<usize> = (0..1000).collect();
        order.shuffle(&mut rng);
        for &i in &order[..700] {
            bag.erase(&handles[i]);
        }
        bag.iterate(|_| {});

        let mut expected: Vec<u64> = order[700..].iter().map(|&i| i as u64).collect();
        expected.sort_unstable();
        assert_eq!(collect(&bag), expected);
        assert!(bag.chunk_count() <= 32);
        assert_chunk_invariants(&bag);
    }

    // ========================================================================
    // Re-entrancy
    // ========================================================================

    #[test]
    fn visitor_can_lock_a_handle_into_the_visited_chunk() {
        let bag: Bag<u64, 4> = Bag::new();
        let mut handles = BTreeMap::new();
        for v in 0..4 {
            handles.insert(v, bag.insert(v).handle());
        }

        let mut visited = Vec::new();
        bag.iterate(|item| {
            let value = *item;
            if value == 0 {
                // Dirty the chunk, then take a re-entrant hold on it. The
                // nested unlock must not compact: later slots of this very
                // pass would move under the cursor.
                item.erase();
                let access = handles[&2].lock_mut().unwrap();
                assert_eq!(*access, 2);
            } else {
                visited.push(value);
            }
        });

        visited.sort_unstable();
        assert_eq!(visited, vec![1, 2, 3]);
        assert_eq!(collect(&bag), vec![1, 2, 3]);
        assert_chunk_invariants(&bag);
    }

    #[test]
    fn visitor_can_lock_a_handle_into_another_chunk() {
        let bag: Bag<u64, 4> = Bag::new();
        for v in 0..4 {
            bag.insert(v);
        }
        let h = bag.insert(50).handle();

        bag.iterate(|item| {
            if *item < 4 {
                if let Some(mut access) = h.lock_mut() {
                    *access += 1;
                }
            }
        });

        assert_eq!(*h.lock().unwrap(), 54);
    }

    // ========================================================================
    // Concurrency
    // ========================================================================

    #[test]
    fn concurrent_readers_leave_elements_intact() {
        let bag: Bag<u64, 8> = Bag::new();
        for v in 0..100 {
            bag.insert(v);
        }
        let h = bag.insert(999).handle();

        std::thread::scope(|s| {
            for _ in 0..20 {
                s.spawn(|| {
                    bag.iterate(|mut item| {
                        *item += 0;
                    });
                });
            }
        });

        assert_eq!(*h.lock().unwrap(), 999);
        assert_eq!(collect(&bag).len(), 101);
    }

    #[test]
    fn concurrent_erase_and_increment_passes() {
        let bag: Bag<u64, 4> = Bag::new();
        for v in 0..40 {
            bag.insert(v);
        }
        let h = bag.insert(2).handle();

        std::thread::scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    bag.iterate(|mut item| {
                        if *item > 5 {
                            item.erase();
                        } else {
                            *item += 1;
                        }
                    });
                });
            }
        });

        // The tracked element sits in the anchor, which neither merges nor
        // dies: each pass visits it exactly once. 2 + 1 + 1.
        assert_eq!(*h.lock().unwrap(), 4);
        assert_chunk_invariants(&bag);
    }

    #[test]
    fn concurrent_inserts_preserve_every_element() {
        let bag: Bag<u64, 8> = Bag::new();

        std::thread::scope(|s| {
            for t in 0..4u64 {
                let bag = &bag;
                s.spawn(move || {
                    for v in t * 1000..(t + 1) * 1000 {
                        bag.insert(v);
                    }
                });
            }
        });

        assert_eq!(collect(&bag), (0..4000).collect::<Vec<_>>());
        assert_chunk_invariants(&bag);
    }

    #[test]
    fn concurrent_churn_loses_nothing() {
        use std::sync::Mutex;

        let bag: Bag<u64, 8> = Bag::new();
        let erased = Mutex::new(Vec::new());

        std::thread::scope(|s| {
            for t in 0..2u64 {
                let bag = &bag;
                s.spawn(move || {
                    for v in t * 2000..(t + 1) * 2000 {
                        bag.insert(v);
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..50 {
                    let mut batch = Vec::new();
                    bag.iterate(|item| {
                        if *item % 2 == 1 {
                            batch.push(*item);
                            item.erase();
                        }
                    });
                    erased.lock().unwrap().extend(batch);
                    std::thread::yield_now();
                }
            });
        });

        let mut all = collect(&bag);
        all.extend(erased.into_inner().unwrap());
        all.sort_unstable();
        assert_eq!(all, (0..4000).collect::<Vec<_>>());
        assert_chunk_invariants(&bag);
    }

    #[test]
    fn teardown_waits_for_handle_accesses() {
        let bag: Bag<u64, 8> = Bag::new();
        let h = bag.insert(5).handle();

        std::thread::scope(|s| {
            let access = h.lock_mut().unwrap();
            let dropper = s.spawn(move || drop(bag));
            // Teardown cannot finish while the access guard pins the chunk.
            std::thread::sleep(std::time::Duration::from_millis(10));
            assert!(!dropper.is_finished());
            drop(access);
            dropper.join().unwrap();
        });

        assert!(h.lock().is_none());
    }
}
