/*!
 * Persistent Free Lists
 *
 * One singly linked stack per level, threaded through the first unit of each
 * free block:
 *
 * ```text
 * +0   FREE_NODE_MAGIC
 * +16  link[0]   next head through slot 0
 * +24  link[1]
 * +32  link[2]
 * ```
 *
 * The level descriptor in the header names the head and the slot the list
 * currently threads through. Push and pop prepare the node first and commit
 * with one descriptor store; a whole list can be rebuilt through an unused
 * slot and switched over with a single store as well.
 */

use super::header::{Header, ListDesc};
use super::layout::{unit_to_byte, HeapLayout};
use super::region::MappedRegion;
use crate::core::limits::{FREE_NODE_MAGIC, LINK_SLOTS};
use crate::core::{HeapError, HeapResult, Level, Unit};
use ahash::HashSet;

const NODE_MAGIC_OFFSET: u64 = 0;
const NODE_LINK_OFFSET: u64 = 16;

#[derive(Clone, Copy)]
pub struct FreeLists<'a> {
    region: &'a MappedRegion,
    layout: HeapLayout,
    header: Header<'a>,
}

impl<'a> FreeLists<'a> {
    pub fn new(region: &'a MappedRegion, layout: HeapLayout) -> Self {
        Self {
            region,
            layout,
            header: Header::new(region),
        }
    }

    #[inline]
    pub fn desc(&self, level: Level) -> ListDesc {
        self.header.level(level)
    }

    #[inline]
    pub fn is_empty(&self, level: Level) -> bool {
        self.desc(level).is_empty()
    }

    pub fn push(&self, level: Level, unit: Unit) -> HeapResult<()> {
        let desc = self.desc(level);
        self.write_node(unit, desc.slot, desc.head)?;
        self.header.set_level(level, ListDesc::new(unit, desc.slot))
    }

    /// Detach and return the head of `level`
    pub fn pop(&self, level: Level) -> HeapResult<Option<Unit>> {
        let desc = self.desc(level);
        if desc.is_empty() {
            return Ok(None);
        }
        let next = self.next(desc.head, desc.slot, level)?;
        self.header.set_level(level, ListDesc::new(next, desc.slot))?;
        Ok(Some(desc.head))
    }

    /// Every block on `level`, head first
    pub fn walk(&self, level: Level) -> HeapResult<Vec<Unit>> {
        self.walk_desc(level, self.desc(level))
    }

    /// Walk a list described by `desc`, which need not be installed yet
    pub fn walk_desc(&self, level: Level, desc: ListDesc) -> HeapResult<Vec<Unit>> {
        let mut blocks = Vec::new();
        let mut seen = HashSet::default();
        let mut cursor = desc.head;
        while cursor != 0 {
            if !seen.insert(cursor) {
                return Err(HeapError::Unrecoverable(format!(
                    "free list {} loops back to unit {}",
                    level, cursor
                )));
            }
            blocks.push(cursor);
            cursor = self.next(cursor, desc.slot, level)?;
        }
        Ok(blocks)
    }

    /// Link `blocks` in order through `slot` and describe the result; the
    /// header is left untouched
    pub fn stage(&self, blocks: &[Unit], slot: usize) -> HeapResult<ListDesc> {
        for (idx, &unit) in blocks.iter().enumerate() {
            let next = blocks.get(idx + 1).copied().unwrap_or(0);
            self.write_node(unit, slot, next)?;
        }
        Ok(ListDesc::new(blocks.first().copied().unwrap_or(0), slot))
    }

    /// Install a previously staged list with one descriptor store
    pub fn install(&self, level: Level, desc: ListDesc) -> HeapResult<()> {
        self.header.set_level(level, desc)
    }

    fn next(&self, unit: Unit, slot: usize, level: Level) -> HeapResult<Unit> {
        self.check_node(unit, level)?;
        let next = self.region.load_u64(link_byte(unit, slot));
        if next != 0 && !self.in_range(next) {
            return Err(HeapError::Unrecoverable(format!(
                "free list {} links unit {} to out-of-range unit {}",
                level, unit, next
            )));
        }
        Ok(next)
    }

    fn write_node(&self, unit: Unit, slot: usize, next: Unit) -> HeapResult<()> {
        if slot >= LINK_SLOTS {
            return Err(HeapError::Unrecoverable(format!("link slot {} out of range", slot)));
        }
        let base = unit_to_byte(unit);
        self.region.store_u64(base + NODE_MAGIC_OFFSET, FREE_NODE_MAGIC);
        self.region.store_u64(link_byte(unit, slot), next);
        self.region.persist(base, 64)
    }

    fn check_node(&self, unit: Unit, level: Level) -> HeapResult<()> {
        if !self.in_range(unit) {
            return Err(HeapError::Unrecoverable(format!(
                "free list {} references out-of-range unit {}",
                level, unit
            )));
        }
        let magic = self.region.load_u64(unit_to_byte(unit) + NODE_MAGIC_OFFSET);
        if magic != FREE_NODE_MAGIC {
            return Err(HeapError::Unrecoverable(format!(
                "free list {} node at unit {} has bad magic 0x{:016x}",
                level, unit, magic
            )));
        }
        Ok(())
    }

    #[inline]
    fn in_range(&self, unit: Unit) -> bool {
        unit < self.layout.units() && !self.layout.is_metadata(unit)
    }
}

#[inline]
fn link_byte(unit: Unit, slot: usize) -> u64 {
    unit_to_byte(unit) + NODE_LINK_OFFSET + 8 * slot as u64
}

/// A link slot used by neither `a` nor `b`
#[inline]
pub fn spare_slot(a: usize, b: usize) -> usize {
    (0..LINK_SLOTS).find(|&s| s != a && s != b).unwrap_or(0)
}
