//! The slice of the page layer the freelist depends on.
//!
//! Pages are fixed-size units of the data file addressed by [`PageId`]. Only
//! the 16 byte little-endian header and the raw post-header payload are
//! modelled here; node layouts belong to the tree layer. The header is:
//!
//! - `id`: u64, the page's own id.
//! - `flags`: u16, page type bitfield.
//! - `count`: u16, element count (saturating, see the freelist serializer).
//! - `overflow`: u32, number of contiguous trailing pages belonging to the
//!   same logical allocation.

use std::fmt;

/// The fixed size of the page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Page flag marking a B+tree branch page.
pub const FLAG_BRANCH: u16 = 0x01;
/// Page flag marking a B+tree leaf page.
pub const FLAG_LEAF: u16 = 0x02;
/// Page flag marking a meta page.
pub const FLAG_META: u16 = 0x04;
/// Page flag marking a freelist page.
pub const FLAG_FREELIST: u16 = 0x10;

/// Sentinel stored in the header `count` field when the number of encoded
/// freelist ids does not fit in a u16. The true count then occupies the
/// first payload slot.
pub(crate) const COUNT_OVERFLOW_SENTINEL: u16 = 0xFFFF;

#[repr(transparent)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Default)]
/// A unique identifier for a page within the data file.
///
/// Pages 0 and 1 are reserved for the meta pages and must never appear as
/// free, pending, or allocatable.
pub struct PageId(pub u64);

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId({})", self.0)
    }
}

#[repr(transparent)]
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Default)]
/// A monotonic transaction identifier.
///
/// `TxId(0)` doubles as the "allocating tx unknown" sentinel in the pending
/// ledger, for pages that came out of an older freelist image.
pub struct TxId(pub u64);

impl fmt::Debug for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxId({})", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
/// An error that prevented a byte buffer from being interpreted as a page.
pub enum PageError {
    #[error("page buffer of {0} bytes cannot hold the {PAGE_HEADER_SIZE} byte header")]
    /// The buffer is smaller than the fixed page header.
    BufferTooSmall(usize),
    #[error("freelist page claims {claimed} ids but the payload holds at most {capacity}")]
    /// The encoded freelist id count overruns the page payload.
    TruncatedFreelist {
        /// Number of ids the header (or out-of-band slot) claims.
        claimed: usize,
        /// Number of id slots the payload can actually hold.
        capacity: usize,
    },
}

/// An owned page buffer.
///
/// Production pages live in the memory map and are viewed in place; this
/// type backs freelist serialization targets and tests.
pub struct PageBuf {
    data: Box<[u8]>,
}

impl PageBuf {
    /// Allocate a zeroed page buffer of `size` bytes.
    pub fn new(size: usize) -> Result<Self, PageError> {
        if size < PAGE_HEADER_SIZE {
            return Err(PageError::BufferTooSmall(size));
        }
        Ok(Self {
            data: vec![0; size].into_boxed_slice(),
        })
    }

    /// Allocate a minimal page carrying only the given header fields.
    ///
    /// Used when a page is referred to by id alone, without its mapped
    /// bytes at hand, e.g. when freeing a logical page and its overflow run.
    pub fn with_header(id: PageId, flags: u16, overflow: u32) -> Self {
        let mut page = Self {
            data: vec![0; PAGE_HEADER_SIZE].into_boxed_slice(),
        };
        let mut view = page.view_mut();
        view.set_id(id);
        view.set_flags(flags);
        view.set_overflow(overflow);
        page
    }

    /// Borrow the page immutably.
    pub fn view(&self) -> PageRef<'_> {
        PageRef { data: &self.data }
    }

    /// Borrow the page mutably.
    pub fn view_mut(&mut self) -> PageMut<'_> {
        PageMut {
            data: &mut self.data,
        }
    }
}

#[derive(Copy, Clone)]
/// An immutable view of a page buffer.
pub struct PageRef<'a> {
    data: &'a [u8],
}

impl<'a> PageRef<'a> {
    /// Interpret `data` as a page.
    pub fn new(data: &'a [u8]) -> Result<Self, PageError> {
        if data.len() < PAGE_HEADER_SIZE {
            return Err(PageError::BufferTooSmall(data.len()));
        }
        Ok(Self { data })
    }

    /// The page's own id.
    pub fn id(&self) -> PageId {
        PageId(u64::from_le_bytes(self.data[0..8].try_into().unwrap()))
    }

    /// The page type bitfield.
    pub fn flags(&self) -> u16 {
        u16::from_le_bytes(self.data[8..10].try_into().unwrap())
    }

    /// The element count stored in the header.
    pub fn count(&self) -> u16 {
        u16::from_le_bytes(self.data[10..12].try_into().unwrap())
    }

    /// Number of contiguous trailing pages belonging to the same logical
    /// allocation as this page.
    pub fn overflow(&self) -> u32 {
        u32::from_le_bytes(self.data[12..16].try_into().unwrap())
    }

    /// Returns if the page is flagged as a freelist page.
    pub fn is_freelist(&self) -> bool {
        self.flags() & FLAG_FREELIST != 0
    }

    /// Human readable name of the page type, derived from the flags.
    pub fn type_name(&self) -> &'static str {
        let flags = self.flags();
        if flags & FLAG_BRANCH != 0 {
            "branch"
        } else if flags & FLAG_LEAF != 0 {
            "leaf"
        } else if flags & FLAG_META != 0 {
            "meta"
        } else if flags & FLAG_FREELIST != 0 {
            "freelist"
        } else {
            "unknown"
        }
    }

    /// The raw payload following the fixed header.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    /// Decode the freelist id array stored in the payload.
    ///
    /// Honors the count overflow convention: a header count of `0xFFFF`
    /// means the first payload slot holds the true count and the ids start
    /// at the second slot. The ids are copied out; callers never hold a
    /// reference into the (possibly memory mapped) page bytes.
    pub fn freelist_page_ids(&self) -> Result<Vec<PageId>, PageError> {
        let payload = self.payload();
        let capacity = payload.len() / 8;

        let count = self.count();
        let (first_slot, claimed) = if count == COUNT_OVERFLOW_SENTINEL {
            if capacity == 0 {
                return Err(PageError::TruncatedFreelist {
                    claimed: 1,
                    capacity,
                });
            }
            let claimed = u64::from_le_bytes(payload[..8].try_into().unwrap());
            (1, claimed as usize)
        } else {
            (0, count as usize)
        };

        if first_slot + claimed > capacity {
            return Err(PageError::TruncatedFreelist { claimed, capacity });
        }

        let mut ids = Vec::with_capacity(claimed);
        let encoded = &payload[first_slot * 8..(first_slot + claimed) * 8];
        for slot in encoded.chunks_exact(8) {
            ids.push(PageId(u64::from_le_bytes(slot.try_into().unwrap())));
        }
        Ok(ids)
    }
}

/// A mutable view of a page buffer.
pub struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    /// Interpret `data` as a mutable page.
    pub fn new(data: &'a mut [u8]) -> Result<Self, PageError> {
        if data.len() < PAGE_HEADER_SIZE {
            return Err(PageError::BufferTooSmall(data.len()));
        }
        Ok(Self { data })
    }

    /// Reborrow the page immutably.
    pub fn as_ref(&self) -> PageRef<'_> {
        PageRef { data: self.data }
    }

    /// The page type bitfield.
    pub fn flags(&self) -> u16 {
        self.as_ref().flags()
    }

    /// Set the page's own id.
    pub fn set_id(&mut self, id: PageId) {
        self.data[0..8].copy_from_slice(&id.0.to_le_bytes());
    }

    /// Set the page type bitfield.
    pub fn set_flags(&mut self, flags: u16) {
        self.data[8..10].copy_from_slice(&flags.to_le_bytes());
    }

    /// Set the element count stored in the header.
    pub fn set_count(&mut self, count: u16) {
        self.data[10..12].copy_from_slice(&count.to_le_bytes());
    }

    /// Set the overflow run length.
    pub fn set_overflow(&mut self, overflow: u32) {
        self.data[12..16].copy_from_slice(&overflow.to_le_bytes());
    }

    /// The raw payload following the fixed header.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }
}

#[cfg(all(test, not(miri)))]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut page = PageBuf::new(64).unwrap();
        let mut view = page.view_mut();
        view.set_id(PageId(42));
        view.set_flags(FLAG_FREELIST);
        view.set_count(7);
        view.set_overflow(3);

        let view = page.view();
        assert_eq!(view.id(), PageId(42));
        assert_eq!(view.flags(), FLAG_FREELIST);
        assert_eq!(view.count(), 7);
        assert_eq!(view.overflow(), 3);
        assert!(view.is_freelist());
        assert_eq!(view.type_name(), "freelist");
    }

    #[test]
    fn test_views_over_foreign_buffers() {
        let mut raw = vec![0u8; 64];
        {
            let mut view = PageMut::new(&mut raw).unwrap();
            view.set_id(PageId(3));
            view.set_flags(FLAG_META);
        }

        let view = PageRef::new(&raw).unwrap();
        assert_eq!(view.id(), PageId(3));
        assert_eq!(view.type_name(), "meta");

        assert!(PageRef::new(&raw[..8]).is_err());
        assert!(PageMut::new(&mut raw[..8]).is_err());
    }

    #[test]
    fn test_buffer_too_small() {
        assert!(matches!(
            PageBuf::new(PAGE_HEADER_SIZE - 1),
            Err(PageError::BufferTooSmall(_))
        ));
        assert!(PageBuf::new(PAGE_HEADER_SIZE).is_ok());
    }

    #[test]
    fn test_with_header() {
        let page = PageBuf::with_header(PageId(9), FLAG_LEAF, 2);
        let view = page.view();
        assert_eq!(view.id(), PageId(9));
        assert_eq!(view.overflow(), 2);
        assert_eq!(view.type_name(), "leaf");
        assert!(!view.is_freelist());
    }

    #[test]
    fn test_freelist_page_ids_plain_count() {
        let mut page = PageBuf::new(4096).unwrap();
        let mut view = page.view_mut();
        view.set_flags(FLAG_FREELIST);
        view.set_count(2);
        view.payload_mut()[0..8].copy_from_slice(&23u64.to_le_bytes());
        view.payload_mut()[8..16].copy_from_slice(&50u64.to_le_bytes());

        let ids = page.view().freelist_page_ids().unwrap();
        assert_eq!(ids, [PageId(23), PageId(50)]);
    }

    #[test]
    fn test_freelist_page_ids_sentinel_count() {
        let mut page = PageBuf::new(4096).unwrap();
        let mut view = page.view_mut();
        view.set_flags(FLAG_FREELIST);
        view.set_count(COUNT_OVERFLOW_SENTINEL);
        view.payload_mut()[0..8].copy_from_slice(&3u64.to_le_bytes());
        for (i, id) in [7u64, 8, 9].into_iter().enumerate() {
            let offset = 8 + i * 8;
            view.payload_mut()[offset..offset + 8].copy_from_slice(&id.to_le_bytes());
        }

        let ids = page.view().freelist_page_ids().unwrap();
        assert_eq!(ids, [PageId(7), PageId(8), PageId(9)]);
    }

    #[test]
    fn test_freelist_page_ids_truncated() {
        let mut page = PageBuf::new(PAGE_HEADER_SIZE + 8).unwrap();
        let mut view = page.view_mut();
        view.set_flags(FLAG_FREELIST);
        view.set_count(5);

        let error = page.view().freelist_page_ids().unwrap_err();
        assert!(matches!(
            error,
            PageError::TruncatedFreelist {
                claimed: 5,
                capacity: 1
            }
        ));
    }
}
