use rstest::rstest;

use super::{ids, page};
use crate::freelist::{FreeList, FreeListKind};
use crate::page::{PageId, TxId};

#[rstest]
fn test_random_ops_hold_invariants(
    #[values(FreeListKind::Array, FreeListKind::HashMap)] kind: FreeListKind,
) {
    fastrand::seed(0x51EE7);

    let mut freelist = FreeList::new(kind);
    // Pages past this point have never entered the freelist; "growing the
    // file" hands them to the writer directly.
    let mut next_unused = 2u64;
    let mut allocated: Vec<(u64, u64)> = Vec::new();

    for round in 0..500u64 {
        let tx = TxId(round + 1);
        match fastrand::u8(0..4) {
            0 | 1 => {
                let n = fastrand::u64(1..5);
                let start = match freelist.allocate(tx, n) {
                    Some(start) => start.0,
                    None => {
                        let start = next_unused;
                        next_unused += n;
                        start
                    }
                };
                allocated.push((start, n));
            }
            2 if !allocated.is_empty() => {
                let (start, n) =
                    allocated.swap_remove(fastrand::usize(..allocated.len()));
                freelist.free(tx, page(start, n as u32 - 1).view());
            }
            _ => {
                let lag = fastrand::u64(0..20);
                freelist.release(TxId(tx.0.saturating_sub(lag)));
            }
        }

        assert_eq!(freelist.count(), freelist.free_count() + freelist.pending_count());

        let free = freelist.free_page_ids();
        assert_eq!(free.len(), freelist.free_count());
        assert!(
            free.windows(2).all(|pair| pair[0] < pair[1]),
            "free page ids must stay sorted and unique"
        );

        for &id in free.iter().take(16) {
            assert!(freelist.freed(id));
        }
        for &(start, n) in allocated.iter().take(16) {
            for offset in 0..n {
                assert!(!freelist.freed(PageId(start + offset)));
            }
        }
    }
}

#[test]
fn test_store_kinds_agree_on_shared_operations() {
    let mut array = FreeList::new(FreeListKind::Array);
    let mut map = FreeList::new(FreeListKind::HashMap);

    for freelist in [&mut array, &mut map] {
        freelist.init(ids(&[3, 4, 5, 10, 11, 18]));
        freelist.free(TxId(100), page(25, 2).view());
        freelist.free(TxId(101), page(7, 0).view());
        freelist.free(TxId(103), page(40, 0).view());
        freelist.release(TxId(101));
        freelist.rollback(TxId(103));
    }

    let expected = ids(&[3, 4, 5, 7, 10, 11, 18, 25, 26, 27]);
    assert_eq!(array.free_page_ids(), expected);
    assert_eq!(map.free_page_ids(), expected);

    assert_eq!(array.count(), map.count());
    assert_eq!(array.free_count(), map.free_count());
    assert_eq!(array.pending_count(), map.pending_count());
    for id in 0..45 {
        assert_eq!(array.freed(PageId(id)), map.freed(PageId(id)));
    }
}

#[rstest]
fn test_allocation_returns_previously_free_run(
    #[values(FreeListKind::Array, FreeListKind::HashMap)] kind: FreeListKind,
) {
    let mut freelist = FreeList::new(kind);
    freelist.init(ids(&[2, 3, 4, 8, 9, 10, 11, 20]));

    for n in [1u64, 2, 3] {
        let before = freelist.free_count();
        let start = freelist
            .allocate(TxId(50), n)
            .expect("a fitting run should exist");
        for offset in 0..n {
            assert!(!freelist.freed(PageId(start.0 + offset)));
        }
        assert_eq!(freelist.free_count(), before - n as usize);
    }
}
