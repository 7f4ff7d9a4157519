/*!
 * Core Types
 * Common types used across the heap
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pool identifier, as handed out by the pool registry
pub type PoolId = u16;

/// Block level: a block at level `l` spans `2^l` units
pub type Level = u32;

/// Offset measured in allocation units (not bytes)
pub type Unit = u64;

/// Bits reserved for the byte offset when a location is packed into a `u64`
const LOCATION_OFFSET_BITS: u32 = 48;
const LOCATION_OFFSET_MASK: u64 = (1 << LOCATION_OFFSET_BITS) - 1;

/// Durable reference to memory inside a heap
///
/// Unlike a process-local pointer, a location stays valid across remapping
/// and restarts. It is the only form in which callers should store references
/// to persistent memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pool: PoolId,
    offset: u64,
}

impl Location {
    #[inline]
    pub const fn new(pool: PoolId, offset: u64) -> Self {
        Self { pool, offset }
    }

    /// Pool that owns the referenced memory
    #[inline]
    pub const fn pool(&self) -> PoolId {
        self.pool
    }

    /// Byte offset within the pool's mapped region
    #[inline]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Pack into a single word, suitable for storing inside persistent data
    #[inline]
    pub const fn to_raw(&self) -> u64 {
        ((self.pool as u64) << LOCATION_OFFSET_BITS) | (self.offset & LOCATION_OFFSET_MASK)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            pool: (raw >> LOCATION_OFFSET_BITS) as PoolId,
            offset: raw & LOCATION_OFFSET_MASK,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:0x{:x}", self.pool, self.offset)
    }
}
