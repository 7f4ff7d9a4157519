/*!
 * Block Map
 * One tag byte per unit, non-zero only at block starts
 */

use super::layout::HeapLayout;
use super::region::MappedRegion;
use crate::core::{HeapResult, Level, Unit};
use std::fmt;

const STATE_MASK: u8 = 0xC0;
const LEVEL_MASK: u8 = 0x3F;
const STATE_FREE: u8 = 0x40;
const STATE_ALLOCATED: u8 = 0x80;
const STATE_RESERVED: u8 = 0xC0;

/// Decoded block-map tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockTag {
    /// Not a block start
    None,
    Free(Level),
    Allocated(Level),
    /// Header or metadata region
    Reserved(Level),
}

impl BlockTag {
    #[inline]
    pub fn encode(self) -> u8 {
        match self {
            BlockTag::None => 0,
            BlockTag::Free(level) => STATE_FREE | level as u8,
            BlockTag::Allocated(level) => STATE_ALLOCATED | level as u8,
            BlockTag::Reserved(level) => STATE_RESERVED | level as u8,
        }
    }

    #[inline]
    pub fn decode(byte: u8) -> Self {
        let level = (byte & LEVEL_MASK) as Level;
        match byte & STATE_MASK {
            STATE_FREE => BlockTag::Free(level),
            STATE_ALLOCATED => BlockTag::Allocated(level),
            STATE_RESERVED => BlockTag::Reserved(level),
            // A zero state with stray level bits is still "no block here"
            _ => BlockTag::None,
        }
    }

    /// Level of the block this tag starts, if it starts one
    #[inline]
    pub fn level(self) -> Option<Level> {
        match self {
            BlockTag::None => None,
            BlockTag::Free(level) | BlockTag::Allocated(level) | BlockTag::Reserved(level) => {
                Some(level)
            }
        }
    }

    #[inline]
    pub fn is_free(self) -> bool {
        matches!(self, BlockTag::Free(_))
    }
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockTag::None => write!(f, "none"),
            BlockTag::Free(l) => write!(f, "free({})", l),
            BlockTag::Allocated(l) => write!(f, "allocated({})", l),
            BlockTag::Reserved(l) => write!(f, "reserved({})", l),
        }
    }
}

/// Accessor over the tag bytes
#[derive(Clone, Copy)]
pub struct BlockMap<'a> {
    region: &'a MappedRegion,
    layout: HeapLayout,
}

impl<'a> BlockMap<'a> {
    pub fn new(region: &'a MappedRegion, layout: HeapLayout) -> Self {
        Self { region, layout }
    }

    #[inline]
    pub fn get(&self, unit: Unit) -> BlockTag {
        BlockTag::decode(self.region.load_u8(self.layout.tag_byte(unit)))
    }

    /// Store a tag without a persist; callers batch and persist
    #[inline]
    pub fn put(&self, unit: Unit, tag: BlockTag) {
        self.region.store_u8(self.layout.tag_byte(unit), tag.encode());
    }

    /// Store and persist a single tag
    #[inline]
    pub fn set(&self, unit: Unit, tag: BlockTag) -> HeapResult<()> {
        self.put(unit, tag);
        self.region.persist(self.layout.tag_byte(unit), 1)
    }

    /// Persist the tags of every unit in `[first, last]`
    pub fn persist_span(&self, first: Unit, last: Unit) -> HeapResult<()> {
        if last < first {
            return Ok(());
        }
        self.region
            .persist(self.layout.tag_byte(first), (last - first + 1) as usize)
    }

    #[inline]
    pub fn raw(&self, unit: Unit) -> u8 {
        self.region.load_u8(self.layout.tag_byte(unit))
    }

    /// Tag the header and the metadata region as reserved blocks
    pub fn format(&self) -> HeapResult<()> {
        let start = self.layout.tag_byte(0);
        self.region.fill(start, self.layout.units() as usize, 0);
        self.put(0, BlockTag::Reserved(self.layout.header_level()));
        self.put(
            self.layout.metadata_start(),
            BlockTag::Reserved(self.layout.metadata_level()),
        );
        self.region.persist(start, self.layout.units() as usize)
    }
}
