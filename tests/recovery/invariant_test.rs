/*!
 * Partition Invariant Property Tests
 * Random alloc / free / merge sequences with one injected crash
 */

use crate::common::{assert_partition, Fixture, SMALL_HEAP};
use pmheap::{CrashPoint, FaultInjector, HeapError, Location};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Alloc(u64),
    Free(usize),
    Merge,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u64..4096).prop_map(Op::Alloc),
        3 => any::<usize>().prop_map(Op::Free),
        1 => Just(Op::Merge),
    ]
}

/// Crash points reachable from alloc, free and merge
const OPERATION_POINTS: usize = 12;

fn crash_strategy() -> impl Strategy<Value = Option<(usize, u32)>> {
    proptest::option::of((0..OPERATION_POINTS, 1u32..4))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_partition_survives_any_single_crash(
        ops in proptest::collection::vec(op_strategy(), 1..60),
        crash in crash_strategy(),
    ) {
        let fixture = Fixture::new(SMALL_HEAP);
        let injector = Arc::new(FaultInjector::new());
        if let Some((idx, nth)) = crash {
            injector.arm_nth(CrashPoint::ALL[idx], nth);
        }

        let mut heap = fixture.open_with(&injector);
        // Live allocations and the stamp written into each
        let mut live: BTreeMap<Location, u64> = BTreeMap::new();
        let mut stamp = 0u64;

        for op in &ops {
            let result = match *op {
                Op::Alloc(size) => heap.alloc(size).and_then(|loc| {
                    stamp += 1;
                    live.insert(loc, stamp);
                    heap.write(loc, 0, &stamp.to_le_bytes())
                }),
                Op::Free(pick) => {
                    if live.is_empty() {
                        continue;
                    }
                    let loc = *live.keys().nth(pick % live.len()).unwrap();
                    live.remove(&loc);
                    heap.free(loc)
                }
                Op::Merge => heap.merge().map(|_| ()),
            };

            match result {
                Ok(()) | Err(HeapError::OutOfSpace { .. }) => {}
                Err(err) if err.is_crash() => {
                    heap = fixture.open();
                    heap.offline_recover().unwrap();
                    break;
                }
                Err(err) => panic!("unexpected error {:?} for {:?}", err, op),
            }
        }

        let audit = heap.audit().unwrap();
        assert_partition(&audit);

        // Exactly the live allocations are allocated, with their contents intact
        let mut allocated: Vec<u64> = audit.allocated.iter().map(|b| b.unit).collect();
        allocated.sort_unstable();
        let expected: Vec<u64> = live.keys().map(|loc| loc.offset() / 64).collect();
        prop_assert_eq!(allocated, expected);

        for (&loc, &value) in &live {
            let mut buf = [0u8; 8];
            heap.read(loc, 0, &mut buf).unwrap();
            prop_assert_eq!(u64::from_le_bytes(buf), value);
        }

        // Still usable afterwards
        let extra = heap.alloc(64);
        prop_assert!(extra.is_ok() || matches!(extra, Err(HeapError::OutOfSpace { .. })), "unexpected alloc result: {:?}", extra);
        assert_partition(&heap.audit().unwrap());
    }
}
