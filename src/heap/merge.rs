/*!
 * Merge Engine
 *
 * Explicit coalescing of free buddies, one level at a time from level 0
 * upwards. Each level goes through four durable phases:
 *
 * 1. intent: set the merge bit of both members of every pair
 * 2. stage: relink the unpaired remainder of level l, and the merged blocks
 *    followed by the old level l+1 entries, through a link slot neither list
 *    uses; record both staged descriptors in the header
 * 3. commit: advance the merge marker to l
 * 4. apply: install the staged descriptors, retag every pair, advance the
 *    apply cursor, clear the merge bits
 *
 * Nothing before the commit is visible to the allocator, so an interrupted
 * level is rolled back by online recovery; a committed level is rolled
 * forward from the staged descriptors and the bitmap.
 */

use super::block_map::BlockTag;
use super::free_list::spare_slot;
use super::header::NO_MERGE;
use super::layout::{block_units, is_aligned};
use super::zone::Zone;
use crate::core::{HeapError, HeapResult, Level, Unit};
use crate::fault::{checkpoint, Checkpoints, CrashPoint};
use ahash::HashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// Outcome of one merge pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Levels whose pairs were merged, ascending
    pub committed_levels: Vec<Level>,
    /// Total pairs coalesced across all levels
    pub pairs_merged: usize,
}

/// A lower block and its buddy, both free at the merge level
pub(crate) type BuddyPair = (Unit, Unit);

impl Zone {
    /// Coalesce free buddies into blocks up to `max_merge_level`
    #[instrument(skip(self, cp), fields(pool = self.pool()))]
    pub fn merge(&self, max_merge_level: Level, cp: &dyn Checkpoints) -> HeapResult<MergeReport> {
        self.ensure_no_pending_merge()?;
        self.discard_merge_intent()?;

        let header = self.header();
        let bitmap = self.bitmap();
        let lists = self.lists();
        let top = max_merge_level.min(self.layout().max_level());
        let mut report = MergeReport::default();

        for level in 0..top {
            let pairs = self.collect_pairs(level)?;
            if pairs.is_empty() {
                continue;
            }

            for &(lo, hi) in &pairs {
                bitmap.mark(lo);
                bitmap.mark(hi);
            }
            bitmap.persist_units(pairs.iter().flat_map(|&(lo, hi)| [lo, hi]))?;
            checkpoint(cp, CrashPoint::MergeAfterMark)?;

            let lower = lists.desc(level);
            let upper = lists.desc(level + 1);
            let slot = spare_slot(lower.slot, upper.slot);
            let paired: HashSet<Unit> = pairs.iter().flat_map(|&(lo, hi)| [lo, hi]).collect();
            let remainder: Vec<Unit> = lists
                .walk(level)?
                .into_iter()
                .filter(|unit| !paired.contains(unit))
                .collect();
            let mut merged: Vec<Unit> = pairs.iter().map(|&(lo, _)| lo).collect();
            merged.extend(lists.walk(level + 1)?);

            let staged_lower = lists.stage(&remainder, slot)?;
            let staged_upper = lists.stage(&merged, slot)?;
            header.set_staged(level, staged_lower, staged_upper)?;
            checkpoint(cp, CrashPoint::MergeAfterStage)?;

            header.set_merge_marker(level as i64)?;
            checkpoint(cp, CrashPoint::MergeAfterCommit)?;

            self.apply_level(level, &pairs, cp)?;
            report.committed_levels.push(level);
            report.pairs_merged += pairs.len();
            debug!(level, pairs = pairs.len(), "Merged level");
        }

        checkpoint(cp, CrashPoint::MergeBeforeReset)?;
        header.set_merge_marker(NO_MERGE)?;
        header.set_merge_applied(NO_MERGE)?;
        header.clear_staged()?;

        info!(
            levels = report.committed_levels.len(),
            pairs = report.pairs_merged,
            "Merge pass complete"
        );
        Ok(report)
    }

    /// Apply a committed level: install the staged lists, retag the pairs,
    /// advance the cursor and drop the merge bits. Safe to repeat.
    pub(crate) fn apply_level(&self, level: Level, pairs: &[BuddyPair], cp: &dyn Checkpoints) -> HeapResult<()> {
        let header = self.header();
        let lists = self.lists();
        let map = self.block_map();
        let bitmap = self.bitmap();

        let (staged_lower, staged_upper) = header.staged();
        lists.install(level, staged_lower)?;
        lists.install(level + 1, staged_upper)?;
        checkpoint(cp, CrashPoint::MergeDuringApply)?;

        for &(lo, hi) in pairs {
            map.put(lo, BlockTag::Free(level + 1));
            map.put(hi, BlockTag::None);
        }
        if let (Some(&(first, _)), Some(&(_, last))) = (pairs.first(), pairs.last()) {
            map.persist_span(first, last)?;
        }

        header.set_merge_applied(level as i64)?;
        checkpoint(cp, CrashPoint::MergeAfterApply)?;

        for &(lo, hi) in pairs {
            bitmap.unmark(lo);
            bitmap.unmark(hi);
        }
        bitmap.persist_units(pairs.iter().flat_map(|&(lo, hi)| [lo, hi]))
    }

    /// Pairs of listed level-`level` blocks whose buddy is also listed, ascending
    fn collect_pairs(&self, level: Level) -> HeapResult<Vec<BuddyPair>> {
        let map = self.block_map();
        let blocks = self.lists().walk(level)?;
        let mut listed = HashSet::default();
        for &unit in &blocks {
            match map.get(unit) {
                BlockTag::Free(found) if found <= level => {
                    if found == level {
                        listed.insert(unit);
                    }
                }
                other => {
                    return Err(HeapError::Unrecoverable(format!(
                        "unit {} on free list {} is tagged {}",
                        unit, level, other
                    )))
                }
            }
        }

        let mut pairs: Vec<BuddyPair> = listed
            .iter()
            .copied()
            .filter(|&lo| is_aligned(lo, level + 1))
            .map(|lo| (lo, lo + block_units(level)))
            .filter(|(_, hi)| listed.contains(hi))
            .collect();
        pairs.sort_unstable();
        Ok(pairs)
    }

    /// Drop merge bits and staged descriptors left by a pass that never committed
    pub(crate) fn discard_merge_intent(&self) -> HeapResult<bool> {
        let header = self.header();
        let bitmap = self.bitmap();
        let hwm = header.high_water();
        let mut changed = false;

        if !bitmap.set_units(hwm).is_empty() {
            bitmap.clear_below(hwm)?;
            changed = true;
        }
        if header.has_staged() {
            header.clear_staged()?;
            changed = true;
        }
        if header.merge_applied() != NO_MERGE {
            header.set_merge_applied(NO_MERGE)?;
            changed = true;
        }
        if changed {
            debug!("Discarded uncommitted merge state");
        }
        Ok(changed)
    }
}
