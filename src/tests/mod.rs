mod invariants;

use crate::page::{PageBuf, PageId};

/// Builds a minimal page carrying just an id and an overflow run, for
/// feeding [`crate::FreeList::free`].
fn page(id: u64, overflow: u32) -> PageBuf {
    PageBuf::with_header(PageId(id), 0, overflow)
}

fn ids(raw: &[u64]) -> Vec<PageId> {
    raw.iter().copied().map(PageId).collect()
}
