//! Freelist (de)serialization against a single on-disk page.
//!
//! The encoded form is the page header (freelist flag set, element count in
//! the header `count` field) followed by the ids as little-endian u64s,
//! ascending. Counts at or above `0xFFFF` do not fit the u16 header field:
//! the header then carries the `0xFFFF` sentinel and the true count moves
//! into the first payload slot.
//!
//! Pending ids are serialized alongside free ids. A crash after the meta
//! page flip but before the next release must not lose pages that were
//! still pending at write time.

use foldhash::{HashSet, HashSetExt};

use crate::freelist::{FreeList, merge_sorted};
use crate::page::{COUNT_OVERFLOW_SENTINEL, FLAG_FREELIST, PAGE_HEADER_SIZE};
use crate::page::{PageId, PageMut, PageRef};

impl FreeList {
    /// Load the freelist from a serialized freelist page.
    ///
    /// Panics if the page is not flagged as a freelist page or its id array
    /// is truncated; both indicate file corruption that cannot safely be
    /// continued from.
    pub fn read(&mut self, page: PageRef<'_>) {
        if !page.is_freelist() {
            tracing::error!(
                page = page.id().0,
                page_type = page.type_name(),
                "page read as freelist has the wrong type"
            );
            panic!(
                "BUG: invalid freelist page {}: page type is {}",
                page.id().0,
                page.type_name()
            );
        }

        let mut ids = match page.freelist_page_ids() {
            Ok(ids) => ids,
            Err(error) => {
                tracing::error!(page = page.id().0, %error, "corrupted freelist page");
                panic!("BUG: corrupted freelist page {}: {error}", page.id().0);
            }
        };
        ids.sort_unstable();
        self.init(ids);
    }

    /// Serialize the freelist into `page`.
    ///
    /// Writes the sorted merge of the free set and every pending id, and
    /// stamps the freelist flag onto the page. The buffer must be at least
    /// [`FreeList::estimated_write_page_size`] bytes.
    pub fn write(&self, page: &mut PageMut<'_>) {
        page.set_flags(page.flags() | FLAG_FREELIST);

        let ids = self.copy_all();
        if ids.is_empty() {
            page.set_count(0);
            return;
        }

        if ids.len() < COUNT_OVERFLOW_SENTINEL as usize {
            page.set_count(ids.len() as u16);
            write_ids(page.payload_mut(), None, &ids);
        } else {
            page.set_count(COUNT_OVERFLOW_SENTINEL);
            write_ids(page.payload_mut(), Some(ids.len() as u64), &ids);
        }
    }

    /// Size in bytes of the freelist as serialized by [`FreeList::write`].
    ///
    /// Never underestimates.
    pub fn estimated_write_page_size(&self) -> usize {
        let mut n = self.count();
        if n >= COUNT_OVERFLOW_SENTINEL as usize {
            // One extra slot carries the out-of-band count.
            n += 1;
        }
        PAGE_HEADER_SIZE + 8 * n
    }

    /// Re-read the freelist from `page`, keeping pages freed by still-open
    /// transactions out of the free set.
    pub fn reload(&mut self, page: PageRef<'_>) {
        self.read(page);
        let ids = self.free_page_ids();
        self.no_sync_reload(ids);
    }

    /// Adopt `ids` as a freshly loaded free set, filtering out any id that
    /// is currently pending in memory.
    ///
    /// The disk image was written with pending ids included; without the
    /// filter, a page freed by a still-open tx would be handed out again
    /// while older readers can still observe its previous content.
    pub fn no_sync_reload(&mut self, ids: Vec<PageId>) {
        let mut pending = HashSet::with_capacity(self.pending_count());
        for txp in self.pending.values() {
            pending.extend(txp.ids.iter().copied());
        }

        let before = ids.len();
        let available: Vec<PageId> =
            ids.into_iter().filter(|id| !pending.contains(id)).collect();
        if available.len() != before {
            tracing::debug!(
                filtered = before - available.len(),
                "filtered pending pages out of reloaded freelist"
            );
        }
        self.init(available);
    }

    /// All free and pending ids as one sorted list, the exact sequence the
    /// serializer writes.
    pub(crate) fn copy_all(&self) -> Vec<PageId> {
        let mut pending_ids: Vec<PageId> = Vec::with_capacity(self.pending_count());
        for txp in self.pending.values() {
            pending_ids.extend(txp.ids.iter().copied());
        }
        pending_ids.sort_unstable();

        merge_sorted(&self.store.free_page_ids(), &pending_ids)
    }
}

/// Encode `ids` as little-endian u64s into `payload`, optionally prefixed
/// with the out-of-band count slot.
fn write_ids(payload: &mut [u8], count_prefix: Option<u64>, ids: &[PageId]) {
    let slots = usize::from(count_prefix.is_some()) + ids.len();
    assert!(
        payload.len() >= slots * 8,
        "BUG: page buffer too small for freelist write: need {} payload bytes, have {}",
        slots * 8,
        payload.len()
    );

    let mut offset = 0;
    if let Some(count) = count_prefix {
        payload[..8].copy_from_slice(&count.to_le_bytes());
        offset = 8;
    }
    for (slot, id) in payload[offset..].chunks_exact_mut(8).zip(ids) {
        slot.copy_from_slice(&id.0.to_le_bytes());
    }
}
