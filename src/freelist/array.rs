//! Sorted-array free store.
//!
//! The whole free set lives in one ascending vector of page ids.
//! Allocation is a single left-to-right scan for a contiguous run, which
//! keeps the representation compact and serialization-friendly at the cost
//! of O(F) allocations.

use std::borrow::Cow;

use smallvec::SmallVec;

use crate::freelist::merge_sorted;
use crate::page::PageId;

#[derive(Default)]
/// Free store keeping every free page id in one sorted vector.
pub(crate) struct ArrayStore {
    /// All free page ids, ascending, no duplicates.
    ids: Vec<PageId>,
}

impl ArrayStore {
    pub(crate) fn init(&mut self, ids: Vec<PageId>) {
        self.ids = ids;
    }

    /// Find and excise a contiguous run of `n` pages, returning its start.
    ///
    /// One pass over the free set, tracking the start of the current run.
    /// The run is reset whenever an id is not adjacent to its predecessor.
    pub(crate) fn allocate(&mut self, n: u64) -> Option<PageId> {
        if self.ids.is_empty() {
            return None;
        }

        let mut found = None;
        let mut initial = PageId(0);
        let mut previd = PageId(0);
        for (i, &id) in self.ids.iter().enumerate() {
            if id.0 <= 1 {
                panic!("BUG: invalid page allocation: {}", id.0);
            }

            // Reset the run start if this id is not contiguous.
            if previd.0 == 0 || id.0 - previd.0 != 1 {
                initial = id;
            }

            if (id.0 - initial.0) + 1 == n {
                found = Some((i, initial));
                break;
            }

            previd = id;
        }

        let (end, initial) = found?;
        self.ids.drain(end + 1 - n as usize..=end);
        Some(initial)
    }

    pub(crate) fn free_count(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn free_page_ids(&self) -> Cow<'_, [PageId]> {
        Cow::Borrowed(&self.ids)
    }

    /// Merge the freed ids into the sorted free set.
    pub(crate) fn merge_spans(&mut self, mut ids: SmallVec<[PageId; 16]>) {
        if ids.is_empty() {
            return;
        }

        ids.sort_unstable();
        #[cfg(any(test, feature = "verify"))]
        self.verify_merge(&ids);
        self.ids = merge_sorted(&self.ids, &ids);
    }

    /// O(F) duplicate and overlap checks, too slow for release builds.
    #[cfg(any(test, feature = "verify"))]
    fn verify_merge(&self, ids: &[PageId]) {
        for pair in self.ids.windows(2) {
            assert!(
                pair[0] < pair[1],
                "BUG: duplicated free page id {} in the free set",
                pair[1].0
            );
        }

        let existing: foldhash::HashSet<PageId> = self.ids.iter().copied().collect();
        let mut prev = PageId(0);
        for &id in ids {
            assert!(
                id != prev,
                "BUG: duplicated page id {} in merge batch",
                id.0
            );
            prev = id;
            assert!(
                !existing.contains(&id),
                "BUG: page id {} in merge batch overlaps the free set",
                id.0
            );
        }
    }
}
