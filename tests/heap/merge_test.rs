/*!
 * Merge Tests
 * Multi-level coalescing of free buddies
 */

use crate::common::{alloc_units, assert_partition, free_blocks, unit, Fixture, SMALL_HEAP};
use pmheap::{CrashPoint, FaultInjector, HeapConfig, HeapError, MergeReport};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[test]
fn test_merge_rebuilds_largest_aligned_blocks() {
    let fixture = Fixture::new(SMALL_HEAP);
    let heap = fixture.open();

    for loc in alloc_units(&heap, 24) {
        heap.free(loc).unwrap();
    }

    let report = heap.merge().unwrap();
    assert_eq!(
        report,
        MergeReport {
            committed_levels: vec![0, 1, 2, 3],
            pairs_merged: 12 + 6 + 3 + 1,
        }
    );

    // Unit 8's buddy is the header, so [8, 16) cannot grow past level 3
    let audit = heap.audit().unwrap();
    assert_partition(&audit);
    assert_eq!(free_blocks(&audit), vec![(8, 3), (16, 4)]);

    assert_eq!(unit(heap.alloc(16 * 64).unwrap()), 16);
    assert_eq!(unit(heap.alloc(8 * 64).unwrap()), 8);
}

#[test]
fn test_merge_only_pairs_listed_buddies() {
    let fixture = Fixture::new(SMALL_HEAP);
    let heap = fixture.open();

    let blocks = alloc_units(&heap, 8);
    // Free 8, 9 and 11; 10 stays allocated
    for idx in [0, 1, 3] {
        heap.free(blocks[idx]).unwrap();
    }

    let report = heap.merge().unwrap();
    assert_eq!(report.committed_levels, vec![0]);
    assert_eq!(report.pairs_merged, 1);

    let audit = heap.audit().unwrap();
    assert_partition(&audit);
    assert_eq!(free_blocks(&audit), vec![(8, 1), (11, 0)]);
}

#[test]
fn test_merge_with_nothing_to_do() {
    let fixture = Fixture::new(SMALL_HEAP);
    let heap = fixture.open();
    alloc_units(&heap, 3);

    assert_eq!(heap.merge().unwrap(), MergeReport::default());
    // Repeating is harmless
    assert_eq!(heap.merge().unwrap(), MergeReport::default());
    assert_partition(&heap.audit().unwrap());
}

#[test]
fn test_merge_respects_max_merge_level() {
    let fixture = Fixture::with_config(SMALL_HEAP, HeapConfig::default().with_max_merge_level(2));
    let heap = fixture.open();

    for loc in alloc_units(&heap, 24) {
        heap.free(loc).unwrap();
    }

    let report = heap.merge().unwrap();
    assert_eq!(report.committed_levels, vec![0, 1]);

    let audit = heap.audit().unwrap();
    assert_partition(&audit);
    assert!(audit.free.iter().all(|b| b.level <= 2));
    assert_eq!(audit.free.len(), 6);
}

#[test]
fn test_merged_blocks_are_listed_ahead_of_older_entries() {
    let fixture = Fixture::new(SMALL_HEAP);
    let heap = fixture.open();

    let blocks = alloc_units(&heap, 8);
    // Level-1 block at 18 comes from the second carved block's split
    let pinned = alloc_units(&heap, 1);
    assert_eq!(unit(pinned[0]), 16);
    heap.free(blocks[0]).unwrap();
    heap.free(blocks[1]).unwrap();

    heap.merge().unwrap();
    // Merged 8 heads list 1, ahead of the older 18
    assert_eq!(unit(heap.alloc(128).unwrap()), 8);
    assert_eq!(unit(heap.alloc(128).unwrap()), 18);
}

#[test]
fn test_merge_refuses_while_marker_is_set() {
    let fixture = Fixture::new(SMALL_HEAP);
    {
        let heap = fixture.open();
        for loc in alloc_units(&heap, 24) {
            heap.free(loc).unwrap();
        }
    }

    let injector = Arc::new(FaultInjector::new());
    injector.arm(CrashPoint::MergeAfterCommit);
    let heap = fixture.open_with(&injector);
    assert_eq!(
        heap.merge(),
        Err(HeapError::Crashed(CrashPoint::MergeAfterCommit))
    );
    drop(heap);

    let heap = fixture.open();
    assert_eq!(heap.merge(), Err(HeapError::RecoveryRequired(0)));
    assert_eq!(heap.alloc(64), Err(HeapError::RecoveryRequired(0)));
    assert!(heap.stats().unwrap().merge_in_progress);

    heap.online_recover().unwrap();
    assert!(heap.merge().is_ok());
}
