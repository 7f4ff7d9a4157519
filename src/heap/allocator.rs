/*!
 * Allocator Implementation
 * Allocation, splitting, extension and free
 *
 * Write orders, each step persisted before the next:
 * - split: both child tags, then the parent leaves its list, then the upper
 *   buddy joins the lower list
 * - extend: tag the carved block, advance the high-water mark, push it
 * - alloc: the block leaves its list, then its tag becomes allocated
 * - free: the tag becomes free, then the block is pushed
 *
 * A crash between any two steps leaves at worst a free-tagged block on no
 * list, which offline recovery reclaims. A parent still listed after its
 * children were tagged is unlinked by the next alloc that meets it, so
 * allocation carries on before recovery runs.
 */

use super::block_map::BlockTag;
use super::layout::{block_units, buddy_of, is_aligned, unit_to_byte};
use super::zone::Zone;
use crate::core::{HeapError, HeapResult, Level, Location, Unit};
use crate::fault::{checkpoint, Checkpoints, CrashPoint};
use tracing::{debug, trace, warn};

impl Zone {
    /// Allocate a block of at least `size` bytes
    pub fn alloc(&self, size: u64, cp: &dyn Checkpoints) -> HeapResult<Location> {
        self.ensure_no_pending_merge()?;
        let level = self.layout().level_for_size(size)?;
        let unit = self.alloc_level(level, size, cp)?;
        trace!(pool = self.pool(), unit, level, size, "Allocated block");
        Ok(self.location(unit))
    }

    pub(crate) fn alloc_level(&self, level: Level, requested: u64, cp: &dyn Checkpoints) -> HeapResult<Unit> {
        let max_level = self.layout().max_level();
        if level > max_level {
            return Err(self.out_of_space(requested, level));
        }

        loop {
            let lists = self.lists();
            if let Some(found) = (level..=max_level).find(|&l| !lists.is_empty(l)) {
                if !self.head_is_free(found)? {
                    continue;
                }
                let unit = if found == level {
                    lists.pop(level)?.ok_or_else(|| {
                        HeapError::Unrecoverable(format!("free list {} emptied underneath alloc", level))
                    })?
                } else {
                    self.split(found, level, cp)?
                };

                checkpoint(cp, CrashPoint::AllocBeforeMark)?;
                self.block_map().set(unit, BlockTag::Allocated(level))?;
                return Ok(unit);
            }

            self.extend(level, requested, cp)?;
        }
    }

    /// Split the head of list `from`, already checked free, down to `target`,
    /// returning the lowest `target`-level block. Both children of every split are recorded in the
    /// block map before the parent's list membership is cleared.
    fn split(&self, from: Level, target: Level, cp: &dyn Checkpoints) -> HeapResult<Unit> {
        let map = self.block_map();
        let lists = self.lists();
        let unit = lists.desc(from).head;

        let child = from - 1;
        let buddy = buddy_of(unit, child);
        map.set(buddy, BlockTag::Free(child))?;
        map.set(unit, BlockTag::Free(child))?;
        checkpoint(cp, CrashPoint::AllocBeforeSplit)?;

        lists.pop(from)?;
        checkpoint(cp, CrashPoint::AllocDuringSplit)?;
        lists.push(child, buddy)?;

        // The lower half is held privately from here on
        let mut level = child;
        while level > target {
            let child = level - 1;
            let buddy = buddy_of(unit, child);
            map.set(buddy, BlockTag::Free(child))?;
            map.set(unit, BlockTag::Free(child))?;
            lists.push(child, buddy)?;
            level = child;
        }

        debug!(unit, from, target, "Split block");
        Ok(unit)
    }

    /// Check the head of a non-empty list. A head not tagged free at that
    /// level is left over from an interrupted split: it is unlinked, and its
    /// children stay tagged on no list until offline recovery relinks them.
    fn head_is_free(&self, level: Level) -> HeapResult<bool> {
        let lists = self.lists();
        let head = lists.desc(level).head;
        let tag = self.block_map().get(head);
        if tag == BlockTag::Free(level) {
            return Ok(true);
        }
        warn!(
            pool = self.pool(),
            unit = head,
            level,
            %tag,
            "Unlinking stale free-list head; offline recovery reclaims it"
        );
        lists.pop(level)?;
        Ok(false)
    }

    /// Carve the naturally aligned block at the high-water mark onto its list
    fn extend(&self, level: Level, requested: u64, cp: &dyn Checkpoints) -> HeapResult<()> {
        let layout = *self.layout();
        let header = self.header();
        let mut hwm = header.high_water();

        if hwm == layout.metadata_start() {
            hwm = layout.metadata_end();
            header.set_high_water(hwm)?;
            debug!(hwm, "High-water mark skipped metadata region");
        }
        if hwm >= layout.units() {
            warn!(pool = self.pool(), level, requested, "Heap exhausted");
            return Err(self.out_of_space(requested, level));
        }

        let carved = layout.natural_level(hwm);
        self.block_map().set(hwm, BlockTag::Free(carved))?;
        checkpoint(cp, CrashPoint::ExtendAfterTag)?;

        header.set_high_water(hwm + block_units(carved))?;
        checkpoint(cp, CrashPoint::ExtendAfterBump)?;

        self.lists().push(carved, hwm)?;
        debug!(unit = hwm, level = carved, "Extended heap");
        Ok(())
    }

    /// Return an allocated block to its free list. Never coalesces.
    pub fn free(&self, loc: Location, cp: &dyn Checkpoints) -> HeapResult<()> {
        self.ensure_no_pending_merge()?;
        let unit = self.unit_of(loc)?;
        let map = self.block_map();
        let level = match map.get(unit) {
            BlockTag::Allocated(level) if is_aligned(unit, level) => level,
            other => {
                return Err(HeapError::InvalidArgument(format!(
                    "location {} is not an allocated block (tag {})",
                    loc, other
                )))
            }
        };

        map.set(unit, BlockTag::Free(level))?;
        checkpoint(cp, CrashPoint::FreeBeforePush)?;
        self.lists().push(level, unit)?;
        trace!(pool = self.pool(), unit, level, "Freed block");
        Ok(())
    }

    /// Byte range of the allocated block holding `loc`
    pub(crate) fn allocated_span(&self, loc: Location) -> HeapResult<(u64, u64)> {
        let unit = self.unit_of(loc)?;
        match self.block_map().get(unit) {
            BlockTag::Allocated(level) => Ok((unit_to_byte(unit), unit_to_byte(block_units(level)))),
            other => Err(HeapError::InvalidArgument(format!(
                "location {} is not an allocated block (tag {})",
                loc, other
            ))),
        }
    }

    fn out_of_space(&self, requested: u64, level: Level) -> HeapError {
        HeapError::OutOfSpace {
            requested,
            level,
            high_water: self.header().high_water(),
            capacity: self.layout().units(),
        }
    }
}
