/*!
 * Region Layout
 *
 * Static addressing for a heap of 2^N units:
 *
 * ```text
 * unit 0        8                  B                 2B                       2^N
 *      | header | allocable gap    | metadata region | allocable zone ... |
 * ```
 *
 * with `B = 2^(N-5)`. The metadata region holds one tag byte per unit (the
 * block map) followed by one merge bit per unit (the merge bitmap). Both the
 * header and the metadata region are themselves buddy-aligned blocks, so the
 * buddy structure covers the whole file.
 */

use crate::core::limits::{
    HEADER_LEVEL, HEADER_UNITS, MAX_HEAP_SHIFT, METADATA_SHIFT_DELTA, MIN_HEAP_SHIFT, UNIT_SHIFT,
    UNIT_SIZE,
};
use crate::core::{HeapError, HeapResult, Level, Location, PoolId, Unit};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapLayout {
    /// log2 of the heap size in units
    shift: u32,
}

impl HeapLayout {
    /// Layout for a heap of `bytes`; the size must be a power-of-two number of units
    pub fn for_size(bytes: u64) -> HeapResult<Self> {
        if bytes == 0 || !bytes.is_power_of_two() || bytes < UNIT_SIZE {
            return Err(HeapError::InvalidArgument(format!(
                "heap size {} is not a power-of-two multiple of {} bytes",
                bytes, UNIT_SIZE
            )));
        }
        Self::from_shift(bytes.trailing_zeros() - UNIT_SHIFT)
    }

    pub fn from_shift(shift: u32) -> HeapResult<Self> {
        if !(MIN_HEAP_SHIFT..=MAX_HEAP_SHIFT).contains(&shift) {
            return Err(HeapError::InvalidArgument(format!(
                "heap of 2^{} units outside supported range 2^{}..=2^{}",
                shift, MIN_HEAP_SHIFT, MAX_HEAP_SHIFT
            )));
        }
        Ok(Self { shift })
    }

    #[inline]
    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// Capacity in units
    #[inline]
    pub fn units(&self) -> u64 {
        1 << self.shift
    }

    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.units() << UNIT_SHIFT
    }

    /// Highest level a block can have; level N would be the whole file
    #[inline]
    pub fn max_level(&self) -> Level {
        self.shift - 1
    }

    #[inline]
    pub fn header_units(&self) -> u64 {
        HEADER_UNITS
    }

    #[inline]
    pub fn header_level(&self) -> Level {
        HEADER_LEVEL
    }

    /// First unit of the metadata region (B)
    #[inline]
    pub fn metadata_start(&self) -> Unit {
        1 << self.metadata_level()
    }

    #[inline]
    pub fn metadata_level(&self) -> Level {
        self.shift - METADATA_SHIFT_DELTA
    }

    #[inline]
    pub fn metadata_end(&self) -> Unit {
        self.metadata_start() * 2
    }

    #[inline]
    pub fn is_metadata(&self, unit: Unit) -> bool {
        unit >= self.metadata_start() && unit < self.metadata_end()
    }

    /// Byte offset of the block-map tag for `unit`
    #[inline]
    pub fn tag_byte(&self, unit: Unit) -> u64 {
        unit_to_byte(self.metadata_start()) + unit
    }

    /// Byte offset of the bitmap byte holding the merge bit for `unit`, and the bit index
    #[inline]
    pub fn bitmap_bit(&self, unit: Unit) -> (u64, u32) {
        (self.bitmap_start() + unit / 8, (unit % 8) as u32)
    }

    /// Byte offset where the merge bitmap begins
    #[inline]
    pub fn bitmap_start(&self) -> u64 {
        unit_to_byte(self.metadata_start()) + self.units()
    }

    /// Size of the merge bitmap in bytes
    #[inline]
    pub fn bitmap_bytes(&self) -> u64 {
        self.units() / 8
    }

    /// Target level for a request of `bytes`
    pub fn level_for_size(&self, bytes: u64) -> HeapResult<Level> {
        if bytes == 0 {
            return Err(HeapError::InvalidArgument(
                "allocation size must be non-zero".to_string(),
            ));
        }
        let units = bytes.div_ceil(UNIT_SIZE);
        Ok(units.next_power_of_two().trailing_zeros())
    }

    /// Level of the naturally aligned block starting at `unit`, capped at the max level
    #[inline]
    pub fn natural_level(&self, unit: Unit) -> Level {
        unit.trailing_zeros().min(self.max_level())
    }

    #[inline]
    pub fn location(&self, pool: PoolId, unit: Unit) -> Location {
        Location::new(pool, unit_to_byte(unit))
    }
}

#[inline]
pub fn unit_to_byte(unit: Unit) -> u64 {
    unit << UNIT_SHIFT
}

#[inline]
pub fn block_units(level: Level) -> u64 {
    1 << level
}

/// Buddy of the level-`level` block at `unit`
#[inline]
pub fn buddy_of(unit: Unit, level: Level) -> Unit {
    unit ^ block_units(level)
}

#[inline]
pub fn is_aligned(unit: Unit, level: Level) -> bool {
    unit & (block_units(level) - 1) == 0
}
