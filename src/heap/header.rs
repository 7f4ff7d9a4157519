/*!
 * Durable Header
 *
 * Typed view over units [0, 8). Every field is one naturally aligned 8-byte
 * word, so each setter is a single atomic store followed by a persist.
 *
 * ```text
 *   0 magic          8 version        16 pool id        24 N
 *  32 unit size     40 metadata B     48 high-water     56 merge marker
 *  64 apply cursor  72 staged level   80 staged lo desc 88 staged hi desc
 * 128 level descriptors, 8 bytes each, MAX_LEVELS of them (ends at 512)
 * ```
 */

use super::layout::HeapLayout;
use super::region::MappedRegion;
use crate::core::limits::{FORMAT_VERSION, HEAP_MAGIC, LINK_SLOTS, MAX_LEVELS, UNIT_SIZE};
use crate::core::{HeapError, HeapResult, Level, PoolId, Unit};

const OFF_MAGIC: u64 = 0;
const OFF_VERSION: u64 = 8;
const OFF_POOL: u64 = 16;
const OFF_SHIFT: u64 = 24;
const OFF_UNIT_SIZE: u64 = 32;
const OFF_METADATA: u64 = 40;
const OFF_HIGH_WATER: u64 = 48;
const OFF_MARKER: u64 = 56;
const OFF_APPLIED: u64 = 64;
const OFF_STAGED_LEVEL: u64 = 72;
const OFF_STAGED_DESC: u64 = 80;
const OFF_LEVELS: u64 = 128;

/// Marker / cursor / staged-level value meaning "no merge in progress"
pub const NO_MERGE: i64 = -1;

const SLOT_SHIFT: u32 = 56;
const HEAD_MASK: u64 = (1 << SLOT_SHIFT) - 1;

/// Packed free-list descriptor: head unit plus the link slot the list threads through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListDesc {
    pub head: Unit,
    pub slot: usize,
}

impl ListDesc {
    #[inline]
    pub fn new(head: Unit, slot: usize) -> Self {
        Self { head, slot }
    }

    /// Unit 0 is the header and is never free, so 0 marks an empty list
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == 0
    }

    #[inline]
    pub fn pack(&self) -> u64 {
        (self.head & HEAD_MASK) | ((self.slot as u64) << SLOT_SHIFT)
    }

    #[inline]
    pub fn unpack(raw: u64) -> Self {
        Self {
            head: raw & HEAD_MASK,
            slot: (raw >> SLOT_SHIFT) as usize,
        }
    }
}

/// Typed accessor over a mapped header
#[derive(Clone, Copy)]
pub struct Header<'a> {
    region: &'a MappedRegion,
}

impl<'a> Header<'a> {
    pub fn new(region: &'a MappedRegion) -> Self {
        Self { region }
    }

    /// Write a fresh header. The high-water mark starts just past the header block.
    pub fn format(region: &'a MappedRegion, pool: PoolId, layout: &HeapLayout) -> HeapResult<Self> {
        let header = Self { region };
        region.fill(0, 512, 0);
        region.store_u64(OFF_VERSION, FORMAT_VERSION);
        region.store_u64(OFF_POOL, pool as u64);
        region.store_u64(OFF_SHIFT, layout.shift() as u64);
        region.store_u64(OFF_UNIT_SIZE, UNIT_SIZE);
        region.store_u64(OFF_METADATA, layout.metadata_start());
        region.store_u64(OFF_HIGH_WATER, layout.header_units());
        region.store_i64(OFF_MARKER, NO_MERGE);
        region.store_i64(OFF_APPLIED, NO_MERGE);
        region.store_i64(OFF_STAGED_LEVEL, NO_MERGE);
        region.persist(0, 512)?;
        // Magic last: a header without it was never finished
        region.store_u64(OFF_MAGIC, HEAP_MAGIC);
        region.persist(OFF_MAGIC, 8)?;
        Ok(header)
    }

    /// Check the header against the file it was found in and return its layout
    pub fn validate(&self, pool: PoolId, file_len: u64) -> HeapResult<HeapLayout> {
        let magic = self.region.load_u64(OFF_MAGIC);
        if magic != HEAP_MAGIC {
            return Err(HeapError::Format(format!("bad magic 0x{:016x}", magic)));
        }
        let version = self.region.load_u64(OFF_VERSION);
        if version != FORMAT_VERSION {
            return Err(HeapError::Format(format!(
                "unsupported format version {} (expected {})",
                version, FORMAT_VERSION
            )));
        }
        if self.pool() != Some(pool) {
            return Err(HeapError::Format(format!(
                "header names pool {} but file belongs to pool {}",
                self.region.load_u64(OFF_POOL),
                pool
            )));
        }
        if self.region.load_u64(OFF_UNIT_SIZE) != UNIT_SIZE {
            return Err(HeapError::Format("unit size mismatch".to_string()));
        }
        let shift = u32::try_from(self.region.load_u64(OFF_SHIFT))
            .map_err(|_| HeapError::Format("heap shift out of range".to_string()))?;
        let layout = HeapLayout::from_shift(shift).map_err(|e| HeapError::Format(e.to_string()))?;
        if layout.size_bytes() != file_len {
            return Err(HeapError::Format(format!(
                "header describes {} bytes, file holds {}",
                layout.size_bytes(),
                file_len
            )));
        }
        if self.region.load_u64(OFF_METADATA) != layout.metadata_start() {
            return Err(HeapError::Format("metadata offset mismatch".to_string()));
        }
        let hwm = self.high_water();
        if hwm < layout.header_units() || hwm > layout.units() {
            return Err(HeapError::Format(format!("high-water mark {} out of range", hwm)));
        }
        Ok(layout)
    }

    /// Pool recorded at format time; `None` if the word is not a pool id
    pub fn pool(&self) -> Option<PoolId> {
        PoolId::try_from(self.region.load_u64(OFF_POOL)).ok()
    }

    #[inline]
    pub fn high_water(&self) -> Unit {
        self.region.load_u64(OFF_HIGH_WATER)
    }

    pub fn set_high_water(&self, unit: Unit) -> HeapResult<()> {
        self.store(OFF_HIGH_WATER, unit)
    }

    #[inline]
    pub fn merge_marker(&self) -> i64 {
        self.region.load_i64(OFF_MARKER)
    }

    pub fn set_merge_marker(&self, level: i64) -> HeapResult<()> {
        self.store(OFF_MARKER, level as u64)
    }

    #[inline]
    pub fn merge_applied(&self) -> i64 {
        self.region.load_i64(OFF_APPLIED)
    }

    pub fn set_merge_applied(&self, level: i64) -> HeapResult<()> {
        self.store(OFF_APPLIED, level as u64)
    }

    #[inline]
    pub fn staged_level(&self) -> i64 {
        self.region.load_i64(OFF_STAGED_LEVEL)
    }

    /// Staged descriptors for (level, level + 1)
    pub fn staged(&self) -> (ListDesc, ListDesc) {
        (
            ListDesc::unpack(self.region.load_u64(OFF_STAGED_DESC)),
            ListDesc::unpack(self.region.load_u64(OFF_STAGED_DESC + 8)),
        )
    }

    /// Record staged descriptors; the level word goes last and names which pair is valid
    pub fn set_staged(&self, level: Level, lo: ListDesc, hi: ListDesc) -> HeapResult<()> {
        self.region.store_u64(OFF_STAGED_DESC, lo.pack());
        self.region.store_u64(OFF_STAGED_DESC + 8, hi.pack());
        self.region.persist(OFF_STAGED_DESC, 16)?;
        self.store(OFF_STAGED_LEVEL, level as u64)
    }

    pub fn clear_staged(&self) -> HeapResult<()> {
        self.store(OFF_STAGED_LEVEL, NO_MERGE as u64)?;
        self.region.store_u64(OFF_STAGED_DESC, 0);
        self.region.store_u64(OFF_STAGED_DESC + 8, 0);
        self.region.persist(OFF_STAGED_DESC, 16)
    }

    /// True when any staged field holds a value
    pub fn has_staged(&self) -> bool {
        self.staged_level() != NO_MERGE
            || self.region.load_u64(OFF_STAGED_DESC) != 0
            || self.region.load_u64(OFF_STAGED_DESC + 8) != 0
    }

    #[inline]
    pub fn level(&self, level: Level) -> ListDesc {
        ListDesc::unpack(self.region.load_u64(level_offset(level)))
    }

    /// Single-store commit of a level's list
    #[inline]
    pub fn set_level(&self, level: Level, desc: ListDesc) -> HeapResult<()> {
        debug_assert!(desc.slot < LINK_SLOTS);
        self.store(level_offset(level), desc.pack())
    }

    #[inline]
    fn store(&self, offset: u64, value: u64) -> HeapResult<()> {
        self.region.store_u64(offset, value);
        self.region.persist(offset, 8)
    }
}

#[inline]
fn level_offset(level: Level) -> u64 {
    debug_assert!((level as usize) < MAX_LEVELS);
    OFF_LEVELS + 8 * level as u64
}
