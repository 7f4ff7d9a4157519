/*!
 * Independent Handle Tests
 * Several handles on one pool, each with its own mapping, racing on the metadata
 */

use crate::common::{assert_partition, Fixture, LARGE_HEAP, SMALL_HEAP};
use pmheap::{HeapError, Location};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::thread;

#[test]
fn test_two_handles_never_grant_the_same_block() {
    const PER_HANDLE: usize = 5000;
    let fixture = Fixture::new(LARGE_HEAP);

    for _round in 0..3 {
        let granted: Vec<Location> = thread::scope(|scope| {
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    let heap = fixture.open();
                    scope.spawn(move || {
                        (0..PER_HANDLE)
                            .map(|_| heap.alloc(64).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|w| w.join().unwrap())
                .collect()
        });

        let unique: HashSet<Location> = granted.iter().copied().collect();
        assert_eq!(unique.len(), granted.len(), "a block was granted twice");

        let heap = fixture.open();
        let audit = heap.audit().unwrap();
        assert_partition(&audit);
        let allocated: HashSet<u64> = audit.allocated.iter().map(|b| b.unit).collect();
        assert!(granted.iter().all(|loc| allocated.contains(&(loc.offset() / 64))));

        for loc in granted {
            heap.free(loc).unwrap();
        }
    }
}

#[test]
fn test_handles_interleave_alloc_free_and_merge() {
    let fixture = Fixture::new(SMALL_HEAP);

    let kept: Vec<Location> = thread::scope(|scope| {
        let workers: Vec<_> = (0..3)
            .map(|idx| {
                let heap = fixture.open();
                scope.spawn(move || {
                    let mut kept = Vec::new();
                    for step in 0..400usize {
                        if idx == 2 && step % 50 == 0 {
                            heap.merge().unwrap();
                            continue;
                        }
                        match heap.alloc(64 << (step % 3)) {
                            Ok(loc) if step % 2 == 0 => heap.free(loc).unwrap(),
                            Ok(loc) => kept.push(loc),
                            Err(HeapError::OutOfSpace { .. }) => {}
                            Err(err) => panic!("unexpected {:?}", err),
                        }
                    }
                    kept
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    let heap = fixture.open();
    let audit = heap.audit().unwrap();
    assert_partition(&audit);
    let mut allocated: Vec<u64> = audit.allocated.iter().map(|b| b.unit).collect();
    allocated.sort_unstable();
    let mut expected: Vec<u64> = kept.iter().map(|loc| loc.offset() / 64).collect();
    expected.sort_unstable();
    assert_eq!(allocated, expected);
}
