/*!
 * Online Recovery
 * Resolve an interrupted merge pass from the marker, cursor, staged lists and bitmap
 */

use super::RecoveryReport;
use crate::core::{HeapError, HeapResult, Level};
use crate::fault::{checkpoint, Checkpoints, CrashPoint};
use crate::heap::block_map::BlockTag;
use crate::heap::header::NO_MERGE;
use crate::heap::layout::{block_units, is_aligned};
use crate::heap::merge::BuddyPair;
use crate::heap::zone::Zone;
use ahash::HashSet;
use tracing::{info, instrument, warn};

impl Zone {
    #[instrument(skip(self, cp), fields(pool = self.pool()))]
    pub fn online_recover(&self, cp: &dyn Checkpoints) -> HeapResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let changed = self.repair_merge(&mut report, cp)?;
        let report = report.finish(changed);
        info!(status = ?report.status, redone = ?report.redone_level, "Online recovery finished");
        Ok(report)
    }

    /// Roll a committed level forward and discard everything uncommitted.
    /// Returns whether anything was written.
    pub(crate) fn repair_merge(&self, report: &mut RecoveryReport, cp: &dyn Checkpoints) -> HeapResult<bool> {
        let header = self.header();
        let marker = header.merge_marker();

        if marker == NO_MERGE {
            let discarded = self.discard_merge_intent()?;
            report.discarded_merge_state |= discarded;
            return Ok(discarded);
        }

        let max_level = self.layout().max_level() as i64;
        if marker < 0 || marker >= max_level {
            return Err(HeapError::Unrecoverable(format!(
                "merge marker {} outside 0..{}",
                marker, max_level
            )));
        }
        let applied = header.merge_applied();
        if applied < NO_MERGE || applied > marker {
            return Err(HeapError::Unrecoverable(format!(
                "apply cursor {} ahead of merge marker {}",
                applied, marker
            )));
        }

        if applied < marker {
            let staged = header.staged_level();
            if staged != marker {
                return Err(HeapError::Unrecoverable(format!(
                    "staged lists belong to level {} but level {} is committed",
                    staged, marker
                )));
            }
            let level = marker as Level;
            let pairs = self.committed_pairs(level)?;
            warn!(level, pairs = pairs.len(), "Re-applying committed merge level");
            self.apply_level(level, &pairs, cp)?;
            report.redone_level = Some(level);
        }
        checkpoint(cp, CrashPoint::RecoverAfterRedo)?;

        // Anything above the committed level never happened
        self.bitmap().clear_below(header.high_water())?;
        header.clear_staged()?;
        header.set_merge_marker(NO_MERGE)?;
        header.set_merge_applied(NO_MERGE)?;
        report.discarded_merge_state = true;
        Ok(true)
    }

    /// Rebuild the pairs of a committed level from the merge bits. Every bit
    /// needs its partner, and every tag must be either the pre-merge or the
    /// post-merge value.
    fn committed_pairs(&self, level: Level) -> HeapResult<Vec<BuddyPair>> {
        let hwm = self.header().high_water();
        let bits = self.bitmap().set_units(hwm);
        let marked: HashSet<u64> = bits.iter().copied().collect();
        let map = self.block_map();
        let half = block_units(level);
        let mut pairs = Vec::new();

        for &unit in &bits {
            if !is_aligned(unit, level) {
                return Err(HeapError::Unrecoverable(format!(
                    "merge bit at unit {} is not a level-{} block start",
                    unit, level
                )));
            }
            let (lo, hi) = if is_aligned(unit, level + 1) {
                (unit, unit + half)
            } else {
                (unit - half, unit)
            };
            if !marked.contains(&lo) || !marked.contains(&hi) {
                return Err(HeapError::Unrecoverable(format!(
                    "merge bit at unit {} has no partner",
                    unit
                )));
            }
            if unit != lo {
                continue;
            }

            match map.get(lo) {
                BlockTag::Free(l) if l <= level + 1 => {}
                other => {
                    return Err(HeapError::Unrecoverable(format!(
                        "merged block at unit {} tagged {}",
                        lo, other
                    )))
                }
            }
            match map.get(hi) {
                BlockTag::None => {}
                BlockTag::Free(l) if l <= level => {}
                other => {
                    return Err(HeapError::Unrecoverable(format!(
                        "absorbed buddy at unit {} tagged {}",
                        hi, other
                    )))
                }
            }
            pairs.push((lo, hi));
        }

        if pairs.is_empty() {
            return Err(HeapError::Unrecoverable(format!(
                "level {} committed without any recorded pairs",
                level
            )));
        }
        Ok(pairs)
    }
}
