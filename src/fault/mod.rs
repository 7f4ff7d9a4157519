/*!
 * Fault Injection
 *
 * Named crash checkpoints threaded through alloc, free, merge and recovery.
 * When a checkpoint fires the running operation stops on the spot and returns
 * `HeapError::Crashed`, leaving persistent state exactly as a killed process
 * would. Production handles use `NoCheckpoints`.
 */

use crate::core::{HeapError, HeapResult};
use ahash::HashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Every point at which a heap operation can be interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashPoint {
    /// Extension tagged the carved block but has not advanced the high-water mark
    ExtendAfterTag,
    /// High-water mark advanced, carved block not yet on its free list
    ExtendAfterBump,
    /// Split children recorded, parent still on its free list
    AllocBeforeSplit,
    /// Parent off its list, upper buddy not yet pushed
    AllocDuringSplit,
    /// Block reserved but not yet tagged allocated
    AllocBeforeMark,
    /// Block tagged free but not yet pushed
    FreeBeforePush,
    /// Merge intent recorded in the bitmap
    MergeAfterMark,
    /// Rewritten lists staged, marker not yet advanced
    MergeAfterStage,
    /// Marker advanced to the level being merged
    MergeAfterCommit,
    /// Level descriptors switched, tags not yet rewritten
    MergeDuringApply,
    /// Apply cursor advanced, bitmap not yet cleared
    MergeAfterApply,
    /// All levels done, marker not yet reset
    MergeBeforeReset,
    /// Recovery re-applied a committed level but has not reset the marker
    RecoverAfterRedo,
}

impl CrashPoint {
    pub const ALL: [CrashPoint; 13] = [
        CrashPoint::ExtendAfterTag,
        CrashPoint::ExtendAfterBump,
        CrashPoint::AllocBeforeSplit,
        CrashPoint::AllocDuringSplit,
        CrashPoint::AllocBeforeMark,
        CrashPoint::FreeBeforePush,
        CrashPoint::MergeAfterMark,
        CrashPoint::MergeAfterStage,
        CrashPoint::MergeAfterCommit,
        CrashPoint::MergeDuringApply,
        CrashPoint::MergeAfterApply,
        CrashPoint::MergeBeforeReset,
        CrashPoint::RecoverAfterRedo,
    ];

    /// Merge checkpoints, in the order a single level reaches them
    pub const MERGE: [CrashPoint; 6] = [
        CrashPoint::MergeAfterMark,
        CrashPoint::MergeAfterStage,
        CrashPoint::MergeAfterCommit,
        CrashPoint::MergeDuringApply,
        CrashPoint::MergeAfterApply,
        CrashPoint::MergeBeforeReset,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CrashPoint::ExtendAfterTag => "extend after tag",
            CrashPoint::ExtendAfterBump => "extend after bump",
            CrashPoint::AllocBeforeSplit => "alloc before split",
            CrashPoint::AllocDuringSplit => "alloc during split",
            CrashPoint::AllocBeforeMark => "alloc before set bitmap",
            CrashPoint::FreeBeforePush => "free before push",
            CrashPoint::MergeAfterMark => "merge after mark",
            CrashPoint::MergeAfterStage => "merge after stage",
            CrashPoint::MergeAfterCommit => "merge after commit",
            CrashPoint::MergeDuringApply => "merge during apply",
            CrashPoint::MergeAfterApply => "merge after apply",
            CrashPoint::MergeBeforeReset => "merge before reset",
            CrashPoint::RecoverAfterRedo => "recover after redo",
        }
    }
}

impl fmt::Display for CrashPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CrashPoint {
    type Err = HeapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CrashPoint::ALL
            .iter()
            .copied()
            .find(|point| point.name() == s)
            .ok_or_else(|| HeapError::InvalidArgument(format!("unknown crash point '{}'", s)))
    }
}

/// Checkpoint callback consulted at every crash point
pub trait Checkpoints: Send + Sync {
    /// Returns true when execution must stop at this point
    fn should_crash(&self, point: CrashPoint) -> bool;
}

/// Checkpoints that never fire
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCheckpoints;

impl Checkpoints for NoCheckpoints {
    #[inline(always)]
    fn should_crash(&self, _point: CrashPoint) -> bool {
        false
    }
}

/// Consult the callback and turn a firing checkpoint into an error
#[inline]
pub(crate) fn checkpoint(hooks: &dyn Checkpoints, point: CrashPoint) -> HeapResult<()> {
    if hooks.should_crash(point) {
        warn!(checkpoint = %point, "crash injected");
        return Err(HeapError::Crashed(point));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct InjectorState {
    /// Armed points and the hit number at which they fire
    armed: HashMap<CrashPoint, u32>,
    hits: HashMap<CrashPoint, u32>,
    fired: Option<CrashPoint>,
}

/// Test-side injector: arm a named point and the next matching hit crashes
///
/// Fires at most once; after firing every further checkpoint is ignored so a
/// poisoned handle cannot crash twice.
#[derive(Debug, Default)]
pub struct FaultInjector {
    state: Mutex<InjectorState>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crash the next time `point` is reached
    pub fn arm(&self, point: CrashPoint) {
        self.arm_nth(point, 1);
    }

    /// Crash on the `nth` hit of `point` (1-based), counting from now
    pub fn arm_nth(&self, point: CrashPoint, nth: u32) {
        let mut state = self.state.lock();
        let seen = state.hits.get(&point).copied().unwrap_or(0);
        state.armed.insert(point, seen + nth.max(1));
        state.fired = None;
    }

    pub fn disarm(&self, point: CrashPoint) {
        self.state.lock().armed.remove(&point);
    }

    /// Number of times `point` has been reached
    pub fn hits(&self, point: CrashPoint) -> u32 {
        self.state.lock().hits.get(&point).copied().unwrap_or(0)
    }

    /// The point that fired, if any
    pub fn fired(&self) -> Option<CrashPoint> {
        self.state.lock().fired
    }
}

impl Checkpoints for FaultInjector {
    fn should_crash(&self, point: CrashPoint) -> bool {
        let mut state = self.state.lock();
        if state.fired.is_some() {
            return false;
        }
        let count = state.hits.entry(point).or_insert(0);
        *count += 1;
        let count = *count;
        if state.armed.get(&point) == Some(&count) {
            state.armed.remove(&point);
            state.fired = Some(point);
            return true;
        }
        false
    }
}
