/*!
 * Allocation Tests
 * Alloc, split, extension, free and bounded block access
 */

use crate::common::{alloc_units, assert_partition, free_blocks, unit, Fixture, POOL, SMALL_HEAP, TINY_HEAP};
use pmheap::{CrashPoint, FaultInjector, HeapError, Location};
use pretty_assertions::assert_eq;
use std::sync::Arc;

#[test]
fn test_first_allocations_split_the_first_carved_block() {
    let fixture = Fixture::new(SMALL_HEAP);
    let heap = fixture.open();

    assert_eq!(unit(heap.alloc(64).unwrap()), 8);
    assert_eq!(unit(heap.alloc(128).unwrap()), 10);
    assert_eq!(unit(heap.alloc(1).unwrap()), 9);
    assert_eq!(unit(heap.alloc(256).unwrap()), 12);

    // [8, 16) is used up, the next block is carved at the high-water mark
    assert_eq!(unit(heap.alloc(64).unwrap()), 16);

    let audit = heap.audit().unwrap();
    assert_partition(&audit);
    assert_eq!(audit.high_water, 32);
    assert_eq!(free_blocks(&audit), vec![(17, 0), (18, 1), (20, 2), (24, 3)]);
}

#[test]
fn test_free_reuses_most_recent_block() {
    let fixture = Fixture::new(SMALL_HEAP);
    let heap = fixture.open();

    let blocks = alloc_units(&heap, 4);
    heap.free(blocks[1]).unwrap();
    heap.free(blocks[2]).unwrap();

    assert_eq!(heap.alloc(64).unwrap(), blocks[2]);
    assert_eq!(heap.alloc(64).unwrap(), blocks[1]);
    assert_partition(&heap.audit().unwrap());
}

#[test]
fn test_free_never_coalesces() {
    let fixture = Fixture::new(SMALL_HEAP);
    let heap = fixture.open();

    let blocks = alloc_units(&heap, 2);
    for &loc in &blocks {
        heap.free(loc).unwrap();
    }

    let audit = heap.audit().unwrap();
    assert_partition(&audit);
    assert!(free_blocks(&audit).contains(&(8, 0)));
    assert!(free_blocks(&audit).contains(&(9, 0)));
}

#[test]
fn test_extension_skips_metadata_and_runs_out() {
    let fixture = Fixture::new(TINY_HEAP);
    let heap = fixture.open();

    // Largest block: carving walks 8, 16, jumps the metadata region at 32, then 64 .. 512
    let big = heap.alloc(512 * 64).unwrap();
    assert_eq!(unit(big), 512);

    let audit = heap.audit().unwrap();
    assert_partition(&audit);
    assert_eq!(audit.high_water, 1024);
    assert_eq!(
        free_blocks(&audit),
        vec![(8, 3), (16, 4), (64, 6), (128, 7), (256, 8)]
    );

    match heap.alloc(512 * 64) {
        Err(HeapError::OutOfSpace {
            level,
            high_water,
            capacity,
            ..
        }) => {
            assert_eq!(level, 9);
            assert_eq!(high_water, 1024);
            assert_eq!(capacity, 1024);
        }
        other => panic!("expected OutOfSpace, got {:?}", other),
    }

    // Whole-file blocks do not exist
    assert!(matches!(
        heap.alloc(TINY_HEAP),
        Err(HeapError::OutOfSpace { .. })
    ));

    // Smaller requests still succeed from the remaining free lists
    assert_eq!(unit(heap.alloc(256 * 64).unwrap()), 256);
}

#[test]
fn test_invalid_arguments() {
    let fixture = Fixture::new(SMALL_HEAP);
    let heap = fixture.open();
    let loc = heap.alloc(128).unwrap();

    assert!(matches!(heap.alloc(0), Err(HeapError::InvalidArgument(_))));
    assert!(matches!(
        heap.free(Location::new(POOL + 1, loc.offset())),
        Err(HeapError::InvalidArgument(_))
    ));
    assert!(matches!(
        heap.free(Location::new(POOL, loc.offset() + 1)),
        Err(HeapError::InvalidArgument(_))
    ));
    // Interior unit of a two-unit block
    assert!(matches!(
        heap.free(Location::new(POOL, loc.offset() + 64)),
        Err(HeapError::InvalidArgument(_))
    ));
    // Header and never-carved space
    assert!(matches!(
        heap.free(Location::new(POOL, 0)),
        Err(HeapError::InvalidArgument(_))
    ));
    assert!(matches!(
        heap.free(Location::new(POOL, 4096 * 64)),
        Err(HeapError::InvalidArgument(_))
    ));

    heap.free(loc).unwrap();
    assert!(matches!(heap.free(loc), Err(HeapError::InvalidArgument(_))));
    assert_partition(&heap.audit().unwrap());
}

#[test]
fn test_read_write_bounded_to_block() {
    let fixture = Fixture::new(SMALL_HEAP);
    let heap = fixture.open();
    let loc = heap.alloc(100).unwrap(); // two units

    heap.write(loc, 0, b"persistent").unwrap();
    heap.write(loc, 120, &[7u8; 8]).unwrap();

    let mut buf = [0u8; 10];
    heap.read(loc, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"persistent");

    assert!(matches!(
        heap.write(loc, 121, &[0u8; 8]),
        Err(HeapError::InvalidArgument(_))
    ));
    assert!(matches!(
        heap.read(loc, u64::MAX, &mut buf),
        Err(HeapError::InvalidArgument(_))
    ));

    heap.free(loc).unwrap();
    assert!(matches!(
        heap.read(loc, 0, &mut buf),
        Err(HeapError::InvalidArgument(_))
    ));
}

#[test]
fn test_sizes_and_stats() {
    let fixture = Fixture::new(SMALL_HEAP);
    let heap = fixture.open();
    assert_eq!(heap.min_alloc_size(), 64);
    assert_eq!(heap.capacity().unwrap(), SMALL_HEAP);

    heap.alloc(64).unwrap();
    heap.alloc(128).unwrap();
    heap.alloc(64).unwrap();
    heap.alloc(256).unwrap();

    let stats = heap.stats().unwrap();
    assert_eq!(stats.allocated_blocks, 4);
    assert_eq!(stats.allocated_units, 8);
    assert_eq!(stats.free_units, 0);
    assert_eq!(stats.reserved_units, 8);
    assert_eq!(stats.high_water, 16);
    assert!(!stats.merge_in_progress);
}

#[test]
fn test_handle_lifecycle() {
    let fixture = Fixture::new(SMALL_HEAP);
    let mut heap = fixture.registry.find_heap(POOL).unwrap();

    assert!(matches!(heap.alloc(64), Err(HeapError::NotOpen(POOL))));
    heap.open().unwrap();
    assert!(matches!(heap.open(), Err(HeapError::AlreadyOpen(POOL))));

    let loc = heap.alloc(64).unwrap();
    heap.write(loc, 0, &42u64.to_le_bytes()).unwrap();
    heap.close().unwrap();
    assert!(matches!(heap.alloc(64), Err(HeapError::NotOpen(POOL))));
    assert!(matches!(heap.close(), Err(HeapError::NotOpen(POOL))));

    // State survives the unmap
    let reopened = fixture.open();
    let mut buf = [0u8; 8];
    reopened.read(loc, 0, &mut buf).unwrap();
    assert_eq!(u64::from_le_bytes(buf), 42);
    assert_eq!(unit(reopened.alloc(64).unwrap()), 9);
}

#[test]
fn test_stopped_epoch_rejects_operations() {
    let fixture = Fixture::new(SMALL_HEAP);
    let heap = fixture.open();

    fixture.epoch.stop();
    assert!(matches!(heap.alloc(64), Err(HeapError::EpochInactive)));
    assert!(matches!(heap.audit(), Err(HeapError::EpochInactive)));

    fixture.epoch.start();
    assert!(heap.alloc(64).is_ok());
}

#[test]
fn test_crashed_handle_is_poisoned() {
    let fixture = Fixture::new(SMALL_HEAP);
    let injector = Arc::new(FaultInjector::new());
    let heap = fixture.open_with(&injector);

    let loc = heap.alloc(64).unwrap();
    injector.arm(CrashPoint::FreeBeforePush);
    assert_eq!(heap.free(loc), Err(HeapError::Crashed(CrashPoint::FreeBeforePush)));

    assert_eq!(heap.crashed(), Some(CrashPoint::FreeBeforePush));
    assert_eq!(heap.alloc(64), Err(HeapError::Crashed(CrashPoint::FreeBeforePush)));
    assert!(heap.online_recover().unwrap_err().is_crash());
}
