/*!
 * Recovery Engine
 *
 * Online recovery resolves an interrupted merge pass: a committed level is
 * re-applied, anything uncommitted is discarded. Offline recovery does the
 * same and then rebuilds the free lists from the block map, reclaiming free
 * blocks that an interrupted alloc, split or free left on no list.
 */

mod offline;
mod online;
mod scan;

pub use scan::{AuditBlock, HeapAudit, HeapStats};

use crate::core::{Level, Unit};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// Nothing needed repair and nothing was written
    #[default]
    Consistent,
    /// State was repaired
    Repaired,
}

/// What a recovery run found and changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub status: RecoveryStatus,
    /// Committed merge level that had to be applied again
    pub redone_level: Option<Level>,
    /// Uncommitted merge intent (bits, staged lists, stray cursor) was dropped
    pub discarded_merge_state: bool,
    /// Free blocks that were on no list and have been relinked
    pub reclaimed_blocks: usize,
    pub reclaimed_units: Unit,
    /// List entries whose block was not free at that level
    pub dropped_entries: usize,
    pub relinked_levels: Vec<Level>,
    /// Non-zero tags found inside blocks or beyond the high-water mark
    pub cleared_tags: usize,
}

impl RecoveryReport {
    pub fn is_consistent(&self) -> bool {
        self.status == RecoveryStatus::Consistent
    }

    pub(crate) fn finish(mut self, changed: bool) -> Self {
        self.status = if changed {
            RecoveryStatus::Repaired
        } else {
            RecoveryStatus::Consistent
        };
        self
    }
}
