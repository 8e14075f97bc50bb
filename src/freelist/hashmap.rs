//! Run-indexed free store.
//!
//! Free pages are held as maximal runs of contiguous ids, indexed three
//! ways: by run start, by one-past-run-end, and by run size. Allocation
//! picks a fitting size class directly instead of scanning the free set,
//! and freed ids coalesce with their neighbours through the start/end
//! indices.

use std::borrow::Cow;

use foldhash::{HashMap, HashMapExt, HashSet};
use smallvec::SmallVec;

use crate::page::PageId;

#[derive(Default)]
/// Free store indexing maximal runs of contiguous free pages.
pub(crate) struct HashMapStore {
    /// Run start -> run length.
    forward: HashMap<PageId, u64>,
    /// One past the run end -> run length.
    backward: HashMap<PageId, u64>,
    /// Run length -> starts of every run of that length. Never holds an
    /// empty set.
    by_size: HashMap<u64, HashSet<PageId>>,
    /// Total number of free pages across all runs.
    free_count: u64,
}

impl HashMapStore {
    pub(crate) fn init(&mut self, ids: Vec<PageId>) {
        self.forward = HashMap::with_capacity(ids.len() / 2);
        self.backward = HashMap::with_capacity(ids.len() / 2);
        self.by_size = HashMap::new();
        self.free_count = 0;

        let Some((&first, rest)) = ids.split_first() else {
            return;
        };

        let mut start = first;
        let mut len = 1u64;
        for &id in rest {
            if id.0 == start.0 + len {
                len += 1;
            } else {
                self.insert_run(start, len);
                start = id;
                len = 1;
            }
        }
        self.insert_run(start, len);
    }

    /// Pick a run of at least `n` pages and return its start, reinserting
    /// any remainder as a shorter run.
    ///
    /// The smallest fitting size class is used, and the smallest start
    /// within it, keeping placement deterministic. Callers must not rely on
    /// the exact placement, only on the free count arithmetic.
    pub(crate) fn allocate(&mut self, n: u64) -> Option<PageId> {
        if n == 0 {
            return None;
        }

        let size = self.by_size.keys().copied().filter(|size| *size >= n).min()?;
        let start = self.by_size[&size].iter().copied().min()?;

        self.remove_run(start, size);
        if size > n {
            self.insert_run(PageId(start.0 + n), size - n);
        }
        Some(start)
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free_count as usize
    }

    pub(crate) fn free_page_ids(&self) -> Cow<'_, [PageId]> {
        let mut ids = Vec::with_capacity(self.free_count as usize);
        for (&start, &len) in &self.forward {
            for offset in 0..len {
                ids.push(PageId(start.0 + offset));
            }
        }
        ids.sort_unstable();
        Cow::Owned(ids)
    }

    /// Merge the freed ids into the free set, coalescing each with any run
    /// it touches.
    pub(crate) fn merge_spans(&mut self, mut ids: SmallVec<[PageId; 16]>) {
        ids.sort_unstable();

        #[cfg(any(test, feature = "verify"))]
        for pair in ids.windows(2) {
            assert!(
                pair[0] != pair[1],
                "BUG: duplicated page id {} in merge batch",
                pair[0].0
            );
        }

        for id in ids {
            self.merge_id(id);
        }
    }

    fn merge_id(&mut self, id: PageId) {
        #[cfg(any(test, feature = "verify"))]
        self.verify_merge(id);

        // A run ending just left of `id` has its one-past-end key at `id`.
        let left = self.backward.get(&id).copied();
        let right = self.forward.get(&PageId(id.0 + 1)).copied();

        let mut start = id;
        let mut len = 1u64;
        if let Some(left_len) = left {
            let left_start = PageId(id.0 - left_len);
            self.remove_run(left_start, left_len);
            start = left_start;
            len += left_len;
        }
        if let Some(right_len) = right {
            self.remove_run(PageId(id.0 + 1), right_len);
            len += right_len;
        }
        self.insert_run(start, len);
    }

    /// O(R) containment check over every existing run, too slow for release
    /// builds. Checking only run starts would miss ids landing in the
    /// interior of a run.
    #[cfg(any(test, feature = "verify"))]
    fn verify_merge(&self, id: PageId) {
        for (&start, &len) in &self.forward {
            assert!(
                id.0 < start.0 || id.0 >= start.0 + len,
                "BUG: page id {} in merge batch overlaps the free set",
                id.0
            );
        }
    }

    fn insert_run(&mut self, start: PageId, len: u64) {
        debug_assert!(len > 0, "BUG: zero length free run at {}", start.0);
        self.forward.insert(start, len);
        self.backward.insert(PageId(start.0 + len), len);
        self.by_size.entry(len).or_default().insert(start);
        self.free_count += len;
    }

    fn remove_run(&mut self, start: PageId, len: u64) {
        self.forward.remove(&start);
        self.backward.remove(&PageId(start.0 + len));
        if let Some(starts) = self.by_size.get_mut(&len) {
            starts.remove(&start);
            if starts.is_empty() {
                self.by_size.remove(&len);
            }
        }
        self.free_count -= len;
    }
}
