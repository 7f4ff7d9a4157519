/*!
 * Merge Bitmap
 * Packed one-bit-per-unit intent record for the level being merged
 */

use super::layout::HeapLayout;
use super::region::MappedRegion;
use crate::core::{HeapResult, Unit};

#[derive(Clone, Copy)]
pub struct MergeBitmap<'a> {
    region: &'a MappedRegion,
    layout: HeapLayout,
}

impl<'a> MergeBitmap<'a> {
    pub fn new(region: &'a MappedRegion, layout: HeapLayout) -> Self {
        Self { region, layout }
    }

    /// Set without persisting
    #[inline]
    pub fn mark(&self, unit: Unit) {
        let (byte, bit) = self.layout.bitmap_bit(unit);
        let old = self.region.load_u8(byte);
        self.region.store_u8(byte, old | (1 << bit));
    }

    /// Clear without persisting
    #[inline]
    pub fn unmark(&self, unit: Unit) {
        let (byte, bit) = self.layout.bitmap_bit(unit);
        let old = self.region.load_u8(byte);
        self.region.store_u8(byte, old & !(1 << bit));
    }

    /// Persist the bytes holding the bits of `units`
    pub fn persist_units(&self, units: impl IntoIterator<Item = Unit>) -> HeapResult<()> {
        let mut lo = u64::MAX;
        let mut hi = 0;
        for unit in units {
            let (byte, _) = self.layout.bitmap_bit(unit);
            lo = lo.min(byte);
            hi = hi.max(byte);
        }
        if lo > hi {
            return Ok(());
        }
        self.region.persist(lo, (hi - lo + 1) as usize)
    }

    /// Every unit below `limit` whose bit is set, ascending
    pub fn set_units(&self, limit: Unit) -> Vec<Unit> {
        let mut units = Vec::new();
        let words = limit.div_ceil(64);
        for word_idx in 0..words {
            let offset = self.layout.bitmap_start() + word_idx * 8;
            let mut word = self.region.load_u64(offset);
            while word != 0 {
                let bit = word.trailing_zeros() as u64;
                let unit = word_idx * 64 + bit;
                if unit < limit {
                    units.push(unit);
                }
                word &= word - 1;
            }
        }
        units
    }

    /// Zero the bits of every unit below `limit`
    pub fn clear_below(&self, limit: Unit) -> HeapResult<()> {
        let bytes = limit.div_ceil(64) as usize * 8;
        self.region.fill(self.layout.bitmap_start(), bytes, 0);
        self.region.persist(self.layout.bitmap_start(), bytes)
    }
}
