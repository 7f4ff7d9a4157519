/*!
 * Offline Recovery
 * Merge repair, structural validation, then free lists rebuilt from the block map
 */

use super::RecoveryReport;
use crate::core::{HeapResult, Level, Unit};
use crate::fault::Checkpoints;
use crate::heap::block_map::BlockTag;
use crate::heap::free_list::spare_slot;
use crate::heap::layout::block_units;
use crate::heap::zone::Zone;
use ahash::HashSet;
use tracing::{debug, info, instrument, warn};

impl Zone {
    #[instrument(skip(self, cp), fields(pool = self.pool()))]
    pub fn offline_recover(&self, cp: &dyn Checkpoints) -> HeapResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut changed = self.repair_merge(&mut report, cp)?;

        let scan = self.scan_blocks()?;
        let map = self.block_map();

        let mut stray = scan.stale_tags.clone();
        stray.extend(self.tags_beyond_high_water());
        if !stray.is_empty() {
            for &unit in &stray {
                map.set(unit, BlockTag::None)?;
            }
            warn!(count = stray.len(), "Cleared stray block-map tags");
            report.cleared_tags = stray.len();
            changed = true;
        }

        let levels = self.layout().max_level() as usize + 1;
        let expected = scan.free_by_level(levels);
        let lists = self.lists();

        // Walk every list before relinking any: staging writes link slots
        let listed: Vec<Option<Vec<Unit>>> = (0..levels as Level)
            .map(|level| match lists.walk(level) {
                Ok(blocks) => Some(blocks),
                Err(err) => {
                    warn!(level, error = %err, "Free list unreadable, rebuilding");
                    None
                }
            })
            .collect();

        for (idx, want) in expected.iter().enumerate() {
            let level = idx as Level;
            let have: HashSet<Unit> = listed[idx].iter().flatten().copied().collect();
            let intact = listed[idx]
                .as_ref()
                .is_some_and(|blocks| blocks.len() == want.len() && want.iter().all(|u| have.contains(u)));
            if intact {
                continue;
            }

            let reclaimed = want.iter().filter(|u| !have.contains(u)).count();
            let wanted: HashSet<Unit> = want.iter().copied().collect();
            let dropped = have.iter().filter(|u| !wanted.contains(u)).count();

            let active = lists.desc(level);
            let slot = spare_slot(active.slot, active.slot);
            let rebuilt = lists.stage(want, slot)?;
            lists.install(level, rebuilt)?;

            debug!(level, reclaimed, dropped, blocks = want.len(), "Relinked free list");
            report.reclaimed_blocks += reclaimed;
            report.reclaimed_units += reclaimed as Unit * block_units(level);
            report.dropped_entries += dropped;
            report.relinked_levels.push(level);
            changed = true;
        }

        let report = report.finish(changed);
        info!(
            status = ?report.status,
            reclaimed_blocks = report.reclaimed_blocks,
            reclaimed_units = report.reclaimed_units,
            relinked = report.relinked_levels.len(),
            "Offline recovery finished"
        );
        Ok(report)
    }
}
