//! Tracking of free, pending, and allocated pages for the write path.
//!
//! Every write transaction allocates contiguous runs of pages through the
//! freelist and hands back the pages it supersedes via copy-on-write. Freed
//! pages are not immediately reusable: a reader pinned at an older
//! transaction id may still observe them, so they sit in a per-transaction
//! *pending* ledger until [`FreeList::release`] (driven by the oldest live
//! reader) promotes them into the free store.
//!
//! The freelist is mutated only by the single active write transaction;
//! exclusion is provided by the enclosing transaction lock, so no locking
//! happens here. Every operation is synchronous and bounded by the current
//! freelist size.

mod array;
mod hashmap;
mod serde;

use std::borrow::Cow;

use foldhash::{HashMap, HashMapExt, HashSet, HashSetExt};
use smallvec::SmallVec;

use crate::page::{PageId, PageRef, TxId};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
/// Selects the data structure backing the free store.
///
/// Both variants satisfy the same contract; they trade allocation cost
/// against memory footprint and serialization locality.
pub enum FreeListKind {
    /// A single sorted vector of free page ids. Compact, allocation is a
    /// linear scan over the free set.
    #[default]
    Array,
    /// Hash indices over maximal runs of contiguous pages. Allocation is
    /// near constant time even under heavy fragmentation.
    HashMap,
}

#[derive(Default)]
/// Per-transaction record of pages freed but not yet releasable.
struct TxPending {
    /// Freed page ids, in the order the `free` calls happened.
    ids: Vec<PageId>,
    /// For each freed id, the tx that originally allocated it. `TxId(0)`
    /// when unknown, i.e. the page came out of an older freelist image.
    alloc_txs: Vec<TxId>,
    /// `begin` of the most recent `release_range` that swept this entry,
    /// memoized so an identical sweep skips the rescan.
    last_release_begin: TxId,
}

enum Store {
    Array(array::ArrayStore),
    HashMap(hashmap::HashMapStore),
}

impl Store {
    fn init(&mut self, ids: Vec<PageId>) {
        match self {
            Store::Array(store) => store.init(ids),
            Store::HashMap(store) => store.init(ids),
        }
    }

    fn allocate(&mut self, n: u64) -> Option<PageId> {
        match self {
            Store::Array(store) => store.allocate(n),
            Store::HashMap(store) => store.allocate(n),
        }
    }

    fn merge_spans(&mut self, ids: SmallVec<[PageId; 16]>) {
        match self {
            Store::Array(store) => store.merge_spans(ids),
            Store::HashMap(store) => store.merge_spans(ids),
        }
    }

    fn free_count(&self) -> usize {
        match self {
            Store::Array(store) => store.free_count(),
            Store::HashMap(store) => store.free_count(),
        }
    }

    fn free_page_ids(&self) -> Cow<'_, [PageId]> {
        match self {
            Store::Array(store) => store.free_page_ids(),
            Store::HashMap(store) => store.free_page_ids(),
        }
    }
}

/// Tracks which pages of the data file are free, which are pending release
/// by in-flight transactions, and which are allocated to a specific
/// transaction.
///
/// One freelist exists per database. See the module docs for the
/// concurrency model.
pub struct FreeList {
    store: Store,
    /// Tx that allocated each outstanding page. Only the head page of a
    /// multi-page allocation is recorded.
    allocs: HashMap<PageId, TxId>,
    /// Every id that is currently free or pending, for O(1) double-free
    /// detection.
    cache: HashSet<PageId>,
    /// Soon-to-be-free page ids, keyed by the tx that freed them (not the
    /// tx that allocated them).
    pending: HashMap<TxId, TxPending>,
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new(FreeListKind::default())
    }
}

impl FreeList {
    /// Create an empty freelist backed by the given store kind.
    pub fn new(kind: FreeListKind) -> Self {
        let store = match kind {
            FreeListKind::Array => Store::Array(array::ArrayStore::default()),
            FreeListKind::HashMap => Store::HashMap(hashmap::HashMapStore::default()),
        };
        Self {
            store,
            allocs: HashMap::new(),
            cache: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    /// Adopt `ids` as the set of free pages.
    ///
    /// The list must be sorted ascending with no duplicates. The
    /// free-or-pending cache is rebuilt from the new free set plus any
    /// pending entries that survive the reset.
    pub fn init(&mut self, ids: Vec<PageId>) {
        #[cfg(any(test, feature = "verify"))]
        assert!(
            ids.windows(2).all(|pair| pair[0] < pair[1]),
            "BUG: freelist init requires sorted, deduplicated page ids"
        );

        self.store.init(ids);
        self.reindex();
    }

    /// Allocate a contiguous run of `n` pages for `txid` and return the
    /// run's starting page id.
    ///
    /// `None` means no contiguous run of `n` free pages exists; the caller
    /// is expected to grow the file instead. `n == 0` always returns `None`
    /// without side effects.
    pub fn allocate(&mut self, txid: TxId, n: u64) -> Option<PageId> {
        if n == 0 {
            return None;
        }

        let start = self.store.allocate(n)?;
        for offset in 0..n {
            self.cache.remove(&PageId(start.0 + offset));
        }
        self.allocs.insert(start, txid);
        Some(start)
    }

    /// Record `page` and its overflow run as freed by `txid`.
    ///
    /// The pages become pending until a later release covers `txid`.
    /// Panics if the page is one of the reserved meta pages, or if any id
    /// in the run is already free or pending.
    pub fn free(&mut self, txid: TxId, page: PageRef<'_>) {
        let head = page.id();
        if head.0 <= 1 {
            panic!("BUG: cannot free page 0 or 1: {}", head.0);
        }

        let alloc_tx = match self.allocs.remove(&head) {
            Some(tx) => tx,
            // A freelist page is always allocated by the immediately
            // prior tx.
            None if page.is_freelist() => TxId(txid.0 - 1),
            None => TxId(0),
        };

        let txp = self.pending.entry(txid).or_default();
        for id in head.0..=head.0 + u64::from(page.overflow()) {
            let id = PageId(id);
            if !self.cache.insert(id) {
                panic!("BUG: page {} already freed", id.0);
            }
            txp.ids.push(id);
            txp.alloc_txs.push(alloc_tx);
        }
    }

    /// Undo every `free` recorded against `txid`.
    ///
    /// Pages that some other live transaction allocated go back to the
    /// alloc table; pages `txid` allocated itself become free again. Pages
    /// whose allocating tx is unknown are dropped from both pending and
    /// cache: they came out of an older freelist image and that image still
    /// accounts for them.
    pub fn rollback(&mut self, txid: TxId) {
        let Some(txp) = self.pending.remove(&txid) else {
            return;
        };

        let mut merge = SmallVec::new();
        for (id, alloc_tx) in txp.ids.into_iter().zip(txp.alloc_txs) {
            self.cache.remove(&id);
            if alloc_tx == TxId(0) {
                continue;
            }
            if alloc_tx != txid {
                // Pending free aborted; the allocating tx keeps the page.
                self.allocs.insert(id, alloc_tx);
            } else {
                merge.push(id);
            }
        }
        self.store.merge_spans(merge);
    }

    /// Promote all pending pages freed at or before `txid` into the free
    /// store.
    ///
    /// Cache entries are untouched: the pages stay free, they merely stop
    /// being pending.
    pub fn release(&mut self, txid: TxId) {
        let mut merge: SmallVec<[PageId; 16]> = SmallVec::new();
        self.pending.retain(|tid, txp| {
            if *tid <= txid {
                merge.extend(txp.ids.drain(..));
                false
            } else {
                true
            }
        });

        if !merge.is_empty() {
            tracing::trace!(
                released = merge.len(),
                up_to = txid.0,
                "released pending pages"
            );
        }
        self.store.merge_spans(merge);
    }

    /// Promote pending pages whose freeing and allocating tx both lie
    /// within `[begin, end]`.
    ///
    /// A reversed range is a silent no-op; adjacent reader gaps are
    /// expressed that way by the transaction manager. Sweeping the same
    /// range twice is skipped per entry via the memoized range begin.
    pub fn release_range(&mut self, begin: TxId, end: TxId) {
        if begin > end {
            return;
        }

        let mut merge: SmallVec<[PageId; 16]> = SmallVec::new();
        self.pending.retain(|tid, txp| {
            if *tid < begin || *tid > end {
                return true;
            }
            // Don't recompute freed pages if the range hasn't moved.
            if txp.last_release_begin == begin {
                return true;
            }

            let mut i = 0;
            while i < txp.ids.len() {
                let alloc_tx = txp.alloc_txs[i];
                if alloc_tx < begin || alloc_tx > end {
                    i += 1;
                    continue;
                }
                merge.push(txp.ids.swap_remove(i));
                txp.alloc_txs.swap_remove(i);
            }
            txp.last_release_begin = begin;
            !txp.ids.is_empty()
        });

        if !merge.is_empty() {
            tracing::trace!(
                released = merge.len(),
                begin = begin.0,
                end = end.0,
                "released pending pages in range"
            );
        }
        self.store.merge_spans(merge);
    }

    /// Returns if `id` is currently free or pending.
    pub fn freed(&self, id: PageId) -> bool {
        self.cache.contains(&id)
    }

    /// Number of free plus pending pages.
    pub fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    /// Number of pages available for reallocation.
    pub fn free_count(&self) -> usize {
        self.store.free_count()
    }

    /// Number of pages freed by in-flight transactions.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(|txp| txp.ids.len()).sum()
    }

    /// All free page ids, sorted ascending.
    pub fn free_page_ids(&self) -> Vec<PageId> {
        self.store.free_page_ids().into_owned()
    }

    /// Rebuild the free-or-pending cache from the store and the pending
    /// ledger.
    fn reindex(&mut self) {
        let free = self.store.free_page_ids();
        self.cache = HashSet::with_capacity(free.len());
        self.cache.extend(free.iter().copied());
        for txp in self.pending.values() {
            self.cache.extend(txp.ids.iter().copied());
        }
    }

    /// Pending ids recorded against `txid`, in the order they were freed.
    #[cfg(test)]
    pub(crate) fn pending_ids(&self, txid: TxId) -> Option<&[PageId]> {
        self.pending.get(&txid).map(|txp| txp.ids.as_slice())
    }

    /// The tx currently recorded as the allocator of `id`.
    #[cfg(test)]
    pub(crate) fn alloc_tx_of(&self, id: PageId) -> Option<TxId> {
        self.allocs.get(&id).copied()
    }
}

/// Merge two sorted, duplicate-free id lists into one sorted list.
pub(crate) fn merge_sorted(a: &[PageId], b: &[PageId]) -> Vec<PageId> {
    if a.is_empty() {
        return b.to_vec();
    }
    if b.is_empty() {
        return a.to_vec();
    }

    let mut merged = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] <= b[j] {
            merged.push(a[i]);
            i += 1;
        } else {
            merged.push(b[j]);
            j += 1;
        }
    }
    merged.extend_from_slice(&a[i..]);
    merged.extend_from_slice(&b[j..]);
    merged
}
