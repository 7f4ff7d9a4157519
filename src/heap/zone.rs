/*!
 * Zone
 * An open heap file: its mapping, layout and typed views over both
 */

use super::bitmap::MergeBitmap;
use super::block_map::BlockMap;
use super::file_lock::{HeapFileLock, LockMode};
use super::free_list::FreeLists;
use super::header::{Header, NO_MERGE};
use super::layout::{unit_to_byte, HeapLayout};
use super::region::MappedRegion;
use crate::config::SyncMode;
use crate::core::limits::UNIT_SIZE;
use crate::core::{HeapError, HeapResult, Location, PoolId, Unit};
use std::fs::File;
use tracing::info;

pub struct Zone {
    pool: PoolId,
    layout: HeapLayout,
    region: MappedRegion,
    // Own open file description: the flock target for this handle
    file: File,
}

impl Zone {
    /// Map a freshly sized file and write an empty heap into it
    pub fn format(file: File, pool: PoolId, layout: HeapLayout, sync: SyncMode) -> HeapResult<Self> {
        let region = MappedRegion::map(&file, layout.size_bytes() as usize, sync)?;
        let zone = Self {
            pool,
            layout,
            region,
            file,
        };
        let _lock = zone.lock(LockMode::Exclusive)?;
        // Block map before header: the magic word is the last thing written
        zone.block_map().format()?;
        zone.bitmap().clear_below(layout.units())?;
        Header::format(&zone.region, pool, &layout)?;
        info!(
            pool,
            units = layout.units(),
            metadata = layout.metadata_start(),
            "Formatted heap"
        );
        Ok(zone)
    }

    /// Map an existing heap file and validate its header
    pub fn open(file: File, pool: PoolId, sync: SyncMode) -> HeapResult<Self> {
        let _lock = HeapFileLock::acquire(&file, LockMode::Shared)?;
        let file_len = file.metadata()?.len();
        if file_len < 512 {
            return Err(HeapError::Format(format!(
                "file of {} bytes cannot hold a heap header",
                file_len
            )));
        }
        let region = MappedRegion::map(&file, file_len as usize, sync)?;
        let layout = Header::new(&region).validate(pool, file_len)?;
        Ok(Self {
            pool,
            layout,
            region,
            file,
        })
    }

    #[inline]
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    #[inline]
    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    #[inline]
    pub fn region(&self) -> &MappedRegion {
        &self.region
    }

    /// Serialise against every other handle and process using this heap
    pub fn lock(&self, mode: LockMode) -> HeapResult<HeapFileLock> {
        HeapFileLock::acquire(&self.file, mode)
    }

    #[inline]
    pub fn header(&self) -> Header<'_> {
        Header::new(&self.region)
    }

    #[inline]
    pub fn block_map(&self) -> BlockMap<'_> {
        BlockMap::new(&self.region, self.layout)
    }

    #[inline]
    pub fn bitmap(&self) -> MergeBitmap<'_> {
        MergeBitmap::new(&self.region, self.layout)
    }

    #[inline]
    pub fn lists(&self) -> FreeLists<'_> {
        FreeLists::new(&self.region, self.layout)
    }

    /// Refuse mutation while a committed merge level is waiting for recovery
    pub(crate) fn ensure_no_pending_merge(&self) -> HeapResult<()> {
        let marker = self.header().merge_marker();
        if marker != NO_MERGE {
            return Err(HeapError::RecoveryRequired(marker));
        }
        Ok(())
    }

    /// Resolve a location to its unit, rejecting foreign pools and bad offsets
    pub(crate) fn unit_of(&self, loc: Location) -> HeapResult<Unit> {
        if loc.pool() != self.pool {
            return Err(HeapError::InvalidArgument(format!(
                "location {} belongs to pool {}, not {}",
                loc,
                loc.pool(),
                self.pool
            )));
        }
        if loc.offset() % UNIT_SIZE != 0 {
            return Err(HeapError::InvalidArgument(format!(
                "location {} is not aligned to {} bytes",
                loc, UNIT_SIZE
            )));
        }
        let unit = loc.offset() / UNIT_SIZE;
        if unit < self.layout.header_units()
            || unit >= self.header().high_water()
            || self.layout.is_metadata(unit)
        {
            return Err(HeapError::InvalidArgument(format!(
                "location {} is outside the allocated range",
                loc
            )));
        }
        Ok(unit)
    }

    #[inline]
    pub(crate) fn location(&self, unit: Unit) -> Location {
        Location::new(self.pool, unit_to_byte(unit))
    }
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("pool", &self.pool)
            .field("layout", &self.layout)
            .finish()
    }
}
