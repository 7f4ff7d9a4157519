/*!
 * Structural Scan
 * Walk the block map from unit 0 to the high-water mark following block starts
 */

use crate::core::{HeapError, HeapResult, Level, Unit};
use crate::heap::block_map::BlockTag;
use crate::heap::header::NO_MERGE;
use crate::heap::layout::{block_units, is_aligned};
use crate::heap::zone::Zone;
use ahash::HashMap;
use serde::{Deserialize, Serialize};

/// Result of a successful structural scan
#[derive(Debug, Default)]
pub(crate) struct BlockScan {
    /// Every block start below the high-water mark with its tag, ascending
    pub blocks: Vec<(Unit, BlockTag)>,
    /// Non-zero tag bytes that sit inside a block
    pub stale_tags: Vec<Unit>,
}

impl BlockScan {
    /// Free blocks grouped by level, each group ascending
    pub fn free_by_level(&self, levels: usize) -> Vec<Vec<Unit>> {
        let mut grouped = vec![Vec::new(); levels];
        for &(unit, tag) in &self.blocks {
            if let BlockTag::Free(level) = tag {
                if let Some(group) = grouped.get_mut(level as usize) {
                    group.push(unit);
                }
            }
        }
        grouped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditBlock {
    pub unit: Unit,
    pub level: Level,
}

/// Read-only structural report of a heap
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapAudit {
    pub capacity_units: Unit,
    pub high_water: Unit,
    pub allocated: Vec<AuditBlock>,
    /// Free-tagged blocks reachable from their level's list
    pub free: Vec<AuditBlock>,
    /// Free-tagged blocks on no list
    pub lost: Vec<AuditBlock>,
    pub reserved: Vec<AuditBlock>,
    pub merge_marker: i64,
    pub anomalies: Vec<String>,
}

impl HeapAudit {
    /// No anomalies and nothing lost
    pub fn is_consistent(&self) -> bool {
        self.anomalies.is_empty() && self.lost.is_empty()
    }

    /// Units covered by the blocks found, which equals the high-water mark
    /// whenever the scan completed
    pub fn covered_units(&self) -> Unit {
        self.allocated
            .iter()
            .chain(&self.free)
            .chain(&self.lost)
            .chain(&self.reserved)
            .map(|b| block_units(b.level))
            .sum()
    }

    pub fn stats(&self) -> HeapStats {
        let units = |blocks: &[AuditBlock]| blocks.iter().map(|b| block_units(b.level)).sum();
        let mut free_blocks_per_level = Vec::new();
        for block in &self.free {
            let idx = block.level as usize;
            if free_blocks_per_level.len() <= idx {
                free_blocks_per_level.resize(idx + 1, 0);
            }
            free_blocks_per_level[idx] += 1;
        }
        HeapStats {
            capacity_units: self.capacity_units,
            high_water: self.high_water,
            allocated_blocks: self.allocated.len(),
            allocated_units: units(&self.allocated),
            free_units: units(&self.free),
            lost_units: units(&self.lost),
            reserved_units: units(&self.reserved),
            free_blocks_per_level,
            merge_in_progress: self.merge_marker != NO_MERGE,
        }
    }
}

/// Summary counters derived from an audit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapStats {
    pub capacity_units: Unit,
    pub high_water: Unit,
    pub allocated_blocks: usize,
    pub allocated_units: Unit,
    pub free_units: Unit,
    pub lost_units: Unit,
    pub reserved_units: Unit,
    /// Index is the level
    pub free_blocks_per_level: Vec<usize>,
    pub merge_in_progress: bool,
}

impl Zone {
    /// Follow block starts over `[0, high-water)`. Holes, misaligned blocks,
    /// overruns and misplaced reserved tags are unrecoverable.
    pub(crate) fn scan_blocks(&self) -> HeapResult<BlockScan> {
        let layout = *self.layout();
        let map = self.block_map();
        let hwm = self.header().high_water();
        let mut scan = BlockScan::default();
        let mut unit = 0;

        while unit < hwm {
            let tag = map.get(unit);
            let level = tag.level().ok_or_else(|| {
                HeapError::Unrecoverable(format!("no block starts at unit {} (raw tag 0x{:02x})", unit, map.raw(unit)))
            })?;
            if !is_aligned(unit, level) || level > layout.max_level() {
                return Err(HeapError::Unrecoverable(format!(
                    "block at unit {} tagged {} breaks buddy alignment",
                    unit, tag
                )));
            }

            let end = unit + block_units(level);
            let is_header = unit == 0 && tag == BlockTag::Reserved(layout.header_level());
            let is_metadata = unit == layout.metadata_start()
                && tag == BlockTag::Reserved(layout.metadata_level());
            match tag {
                BlockTag::Reserved(_) if !is_header && !is_metadata => {
                    return Err(HeapError::Unrecoverable(format!(
                        "unexpected reserved block at unit {}",
                        unit
                    )))
                }
                _ if unit == 0 && !is_header => {
                    return Err(HeapError::Unrecoverable(format!("header block tagged {}", tag)))
                }
                _ => {}
            }
            if end > hwm || (!is_metadata && unit < layout.metadata_end() && end > layout.metadata_start()) {
                return Err(HeapError::Unrecoverable(format!(
                    "block at unit {} tagged {} overruns into unit {}",
                    unit, tag, end
                )));
            }

            if !is_metadata {
                scan.stale_tags
                    .extend((unit + 1..end).filter(|&interior| map.raw(interior) != 0));
            }
            scan.blocks.push((unit, tag));
            unit = end;
        }
        Ok(scan)
    }

    /// Units at or above the high-water mark that carry a tag, metadata excluded
    pub(crate) fn tags_beyond_high_water(&self) -> Vec<Unit> {
        let layout = *self.layout();
        let map = self.block_map();
        let hwm = self.header().high_water();
        (hwm..layout.units())
            .filter(|&unit| !layout.is_metadata(unit) && map.raw(unit) != 0)
            .collect()
    }

    /// Read-only audit: structural scan plus free-list cross-check
    pub fn audit(&self) -> HeapAudit {
        let layout = *self.layout();
        let header = self.header();
        let mut audit = HeapAudit {
            capacity_units: layout.units(),
            high_water: header.high_water(),
            merge_marker: header.merge_marker(),
            ..HeapAudit::default()
        };
        if audit.merge_marker != NO_MERGE {
            audit
                .anomalies
                .push(format!("merge marker left at level {}", audit.merge_marker));
        }
        if header.has_staged() {
            audit.anomalies.push("staged merge descriptors present".to_string());
        }
        let bits = self.bitmap().set_units(audit.high_water);
        if !bits.is_empty() {
            audit
                .anomalies
                .push(format!("{} merge bit(s) set", bits.len()));
        }

        let scan = match self.scan_blocks() {
            Ok(scan) => scan,
            Err(err) => {
                audit.anomalies.push(err.to_string());
                return audit;
            }
        };
        for &unit in &scan.stale_tags {
            audit.anomalies.push(format!("stale tag inside a block at unit {}", unit));
        }

        // Which level's list each unit is on
        let mut listed: HashMap<Unit, Level> = HashMap::default();
        for level in 0..=layout.max_level() {
            match self.lists().walk(level) {
                Ok(blocks) => {
                    for unit in blocks {
                        if let Some(prev) = listed.insert(unit, level) {
                            audit.anomalies.push(format!(
                                "unit {} listed on both level {} and level {}",
                                unit, prev, level
                            ));
                        }
                    }
                }
                Err(err) => audit.anomalies.push(err.to_string()),
            }
        }

        for &(unit, tag) in &scan.blocks {
            let on_list = listed.remove(&unit);
            match tag {
                BlockTag::Free(level) => {
                    let block = AuditBlock { unit, level };
                    match on_list {
                        Some(l) if l == level => audit.free.push(block),
                        Some(l) => {
                            audit.anomalies.push(format!(
                                "free level-{} block at unit {} listed at level {}",
                                level, unit, l
                            ));
                            audit.lost.push(block);
                        }
                        None => audit.lost.push(block),
                    }
                }
                BlockTag::Allocated(level) => {
                    if on_list.is_some() {
                        audit
                            .anomalies
                            .push(format!("allocated block at unit {} is on a free list", unit));
                    }
                    audit.allocated.push(AuditBlock { unit, level });
                }
                BlockTag::Reserved(level) => audit.reserved.push(AuditBlock { unit, level }),
                BlockTag::None => {}
            }
        }
        for (unit, level) in listed {
            audit.anomalies.push(format!(
                "level-{} list entry at unit {} is not a block start",
                level, unit
            ));
        }
        audit
    }
}
