/*!
 * Online Recovery Tests
 * Interrupted merge passes resolve to "not merged" or "merged through the committed level"
 */

use crate::common::{alloc_units, assert_partition, free_blocks, Fixture, SMALL_HEAP};
use pmheap::{CrashPoint, FaultInjector, Heap, HeapError, RecoveryStatus};
use pretty_assertions::assert_eq;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

/// 24 unit blocks at 8..32, all freed
fn freed_fixture() -> Fixture {
    let fixture = Fixture::new(SMALL_HEAP);
    let heap = fixture.open();
    for loc in alloc_units(&heap, 24) {
        heap.free(loc).unwrap();
    }
    fixture
}

/// Free blocks of [8, 32) once merged through `level` (None: not merged)
fn merged_through(level: Option<u32>) -> Vec<(u64, u32)> {
    match level {
        None => (8..32).map(|u| (u, 0)).collect(),
        Some(3) => vec![(8, 3), (16, 4)],
        Some(l) => (8..32).step_by(1 << (l + 1)).map(|u| (u, l + 1)).collect(),
    }
}

/// Run a merge that crashes at the `nth` hit of `point`
fn crash_merge(fixture: &Fixture, point: CrashPoint, nth: u32) {
    let injector = Arc::new(FaultInjector::new());
    injector.arm_nth(point, nth);
    let heap = fixture.open_with(&injector);
    assert_eq!(heap.merge(), Err(HeapError::Crashed(point)));
    assert_eq!(heap.crashed(), Some(point));
}

fn recover(heap: &Heap) -> pmheap::RecoveryReport {
    let report = heap.online_recover().unwrap();
    assert_eq!(report.status, RecoveryStatus::Repaired);
    let again = heap.online_recover().unwrap();
    assert_eq!(again.status, RecoveryStatus::Consistent);
    report
}

#[test]
fn test_crash_at_every_merge_checkpoint_on_first_level() {
    let expectations = [
        (CrashPoint::MergeAfterMark, None, None),
        (CrashPoint::MergeAfterStage, None, None),
        (CrashPoint::MergeAfterCommit, Some(0), Some(0)),
        (CrashPoint::MergeDuringApply, Some(0), Some(0)),
        (CrashPoint::MergeAfterApply, Some(0), None),
        (CrashPoint::MergeBeforeReset, Some(3), None),
    ];

    for (point, through, redone) in expectations {
        let fixture = freed_fixture();
        crash_merge(&fixture, point, 1);

        let heap = fixture.open();
        let report = recover(&heap);
        assert_eq!(report.redone_level, redone, "redo after crash at {}", point);

        let audit = heap.audit().unwrap();
        assert_partition(&audit);
        assert_eq!(free_blocks(&audit), merged_through(through), "state after crash at {}", point);
    }
}

#[test]
fn test_crash_on_a_later_level_keeps_earlier_levels() {
    let cases = [
        (CrashPoint::MergeAfterMark, 2, Some(0)),
        (CrashPoint::MergeAfterStage, 3, Some(1)),
        (CrashPoint::MergeAfterCommit, 3, Some(2)),
        (CrashPoint::MergeDuringApply, 4, Some(3)),
    ];

    for (point, nth, through) in cases {
        let fixture = freed_fixture();
        crash_merge(&fixture, point, nth);

        let heap = fixture.open();
        recover(&heap);
        let audit = heap.audit().unwrap();
        assert_partition(&audit);
        assert_eq!(free_blocks(&audit), merged_through(through), "crash at {} #{}", point, nth);
    }
}

#[test]
fn test_merge_resumes_after_recovery() {
    let fixture = freed_fixture();
    crash_merge(&fixture, CrashPoint::MergeAfterCommit, 2);

    let heap = fixture.open();
    recover(&heap);
    let report = heap.merge().unwrap();
    assert_eq!(report.committed_levels, vec![2, 3]);
    assert_eq!(free_blocks(&heap.audit().unwrap()), merged_through(Some(3)));
}

#[test]
fn test_crash_inside_recovery_is_recoverable() {
    for recovery_point in [CrashPoint::MergeDuringApply, CrashPoint::RecoverAfterRedo] {
        let fixture = freed_fixture();
        crash_merge(&fixture, CrashPoint::MergeDuringApply, 1);

        let injector = Arc::new(FaultInjector::new());
        injector.arm(recovery_point);
        let heap = fixture.open_with(&injector);
        assert_eq!(heap.online_recover(), Err(HeapError::Crashed(recovery_point)));
        drop(heap);

        let heap = fixture.open();
        recover(&heap);
        let audit = heap.audit().unwrap();
        assert_partition(&audit);
        assert_eq!(free_blocks(&audit), merged_through(Some(0)));
    }
}

#[test]
fn test_consistent_heap_needs_nothing() {
    let fixture = freed_fixture();
    let heap = fixture.open();
    let report = heap.online_recover().unwrap();
    assert!(report.is_consistent());
    assert_eq!(report.redone_level, None);
    assert!(!report.discarded_merge_state);
}

#[test]
fn test_impossible_header_states_are_unrecoverable() {
    // (byte offset, value): apply cursor ahead of marker, staged level
    // mismatch, marker past the last level
    let corruptions: [(u64, i64); 3] = [(64, 1), (72, 2), (56, 40)];

    for (offset, value) in corruptions {
        let fixture = freed_fixture();
        crash_merge(&fixture, CrashPoint::MergeAfterCommit, 1);

        let path = fixture.registry.heap_path(crate::common::POOL);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_at(&value.to_le_bytes(), offset).unwrap();
        drop(file);

        let heap = fixture.open();
        assert!(
            matches!(heap.online_recover(), Err(HeapError::Unrecoverable(_))),
            "corruption at byte {} not detected",
            offset
        );
    }
}

#[test]
fn test_recovery_waits_for_quiescence() {
    let fixture = freed_fixture();
    let heap = fixture.open();

    let pin = fixture.epoch.pin().unwrap();
    assert_eq!(heap.online_recover(), Err(HeapError::NotQuiescent(1)));
    drop(pin);

    assert!(heap.online_recover().is_ok());
}
