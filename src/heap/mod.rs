/*!
 * Persistent Heap
 *
 * Buddy-style allocator over a memory-mapped file whose metadata survives a
 * crash at any point without losing or double-granting memory.
 *
 * ## Layout
 *
 * A heap is 2^N units of 64 bytes. Units [0, 8) hold the durable header,
 * units [B, 2B) with B = 2^(N-5) hold the block map and the merge bitmap,
 * and every other unit is allocable. Blocks are power-of-two runs of units
 * aligned to their own size.
 *
 * ## Operations
 *
 * - **alloc / free**: O(levels). Free never coalesces.
 * - **merge**: explicit, resumable coalescing pass over levels 0 and up
 * - **online_recover**: resolves an interrupted merge; needs a recovery window
 * - **offline_recover**: merge repair plus a full free-list rebuild that
 *   reclaims blocks an interrupted alloc, split or free left unreachable
 *
 * Every operation pins the process epoch coordinator and holds the handle's
 * operation lock for its duration. Handles are independent, possibly in
 * different processes, so metadata access is also serialised by an advisory
 * lock on the heap file: exclusive for anything that mutates the header,
 * block map, bitmap or free lists, shared for audits and block I/O.
 */

pub(crate) mod allocator;
pub(crate) mod bitmap;
pub(crate) mod block_map;
pub(crate) mod file_lock;
pub(crate) mod free_list;
pub(crate) mod header;
pub mod layout;
pub(crate) mod merge;
pub(crate) mod region;
pub mod traits;
pub(crate) mod zone;

pub use block_map::BlockTag;
pub use layout::HeapLayout;
pub use merge::MergeReport;
pub use traits::{Coalescer, PersistentAllocator, Recoverable};

use crate::config::HeapConfig;
use crate::core::limits::UNIT_SIZE;
use crate::core::{HeapError, HeapResult, Location, PoolId};
use crate::epoch::EpochManager;
use crate::fault::{Checkpoints, CrashPoint, NoCheckpoints};
use crate::monitoring::OperationSpan;
use crate::recovery::{HeapAudit, HeapStats, RecoveryReport};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use file_lock::LockMode;
use zone::Zone;

/// Handle to one heap file
///
/// Obtained from the registry, then opened. A handle whose operation hit an
/// injected crash is poisoned: every later call reports the same crash, and
/// the caller is expected to drop it and recover through a fresh handle.
pub struct Heap {
    pool: PoolId,
    path: PathBuf,
    config: HeapConfig,
    epoch: Arc<EpochManager>,
    checkpoints: Arc<dyn Checkpoints>,
    zone: Option<Zone>,
    op_lock: Mutex<()>,
    crashed: Mutex<Option<CrashPoint>>,
}

impl Heap {
    pub(crate) fn new(pool: PoolId, path: PathBuf, config: HeapConfig, epoch: Arc<EpochManager>) -> Self {
        Self {
            pool,
            path,
            config,
            epoch,
            checkpoints: Arc::new(NoCheckpoints),
            zone: None,
            op_lock: Mutex::new(()),
            crashed: Mutex::new(None),
        }
    }

    /// Install crash checkpoints (fault injection)
    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn Checkpoints>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.zone.is_some()
    }

    /// Checkpoint at which this handle died, if it did
    pub fn crashed(&self) -> Option<CrashPoint> {
        *self.crashed.lock()
    }

    /// Map the heap file and validate its header
    pub fn open(&mut self) -> HeapResult<()> {
        if self.zone.is_some() {
            return Err(HeapError::AlreadyOpen(self.pool));
        }
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let zone = Zone::open(file, self.pool, self.config.sync_mode)?;
        info!(
            pool = self.pool,
            units = zone.layout().units(),
            high_water = zone.header().high_water(),
            "Opened heap"
        );
        self.zone = Some(zone);
        Ok(())
    }

    /// Flush and unmap
    pub fn close(&mut self) -> HeapResult<()> {
        let zone = self.zone.take().ok_or(HeapError::NotOpen(self.pool))?;
        if self.crashed().is_none() {
            zone.region().flush()?;
        }
        info!(pool = self.pool, "Closed heap");
        Ok(())
    }

    pub fn min_alloc_size(&self) -> u64 {
        UNIT_SIZE
    }

    pub fn capacity(&self) -> HeapResult<u64> {
        Ok(self.zone()?.layout().size_bytes())
    }

    pub fn layout(&self) -> HeapResult<HeapLayout> {
        Ok(*self.zone()?.layout())
    }

    pub fn alloc(&self, size: u64) -> HeapResult<Location> {
        self.operation("alloc", LockMode::Exclusive, |zone, cp| zone.alloc(size, cp))
    }

    pub fn free(&self, location: Location) -> HeapResult<()> {
        self.operation("free", LockMode::Exclusive, |zone, cp| zone.free(location, cp))
    }

    pub fn merge(&self) -> HeapResult<MergeReport> {
        self.operation("merge", LockMode::Exclusive, |zone, cp| {
            let top = self
                .config
                .max_merge_level
                .unwrap_or_else(|| zone.layout().max_level());
            zone.merge(top, cp)
        })
    }

    pub fn online_recover(&self) -> HeapResult<RecoveryReport> {
        self.recovery("online_recover", |zone, cp| zone.online_recover(cp))
    }

    pub fn offline_recover(&self) -> HeapResult<RecoveryReport> {
        self.recovery("offline_recover", |zone, cp| zone.offline_recover(cp))
    }

    /// Copy bytes out of an allocated block, starting `offset` bytes into it
    pub fn read(&self, location: Location, offset: u64, buf: &mut [u8]) -> HeapResult<()> {
        self.operation("read", LockMode::Shared, |zone, _| {
            let start = block_range(zone, location, offset, buf.len())?;
            zone.region().read_bytes(start, buf);
            Ok(())
        })
    }

    /// Copy bytes into an allocated block and persist them
    pub fn write(&self, location: Location, offset: u64, data: &[u8]) -> HeapResult<()> {
        self.operation("write", LockMode::Shared, |zone, _| {
            let start = block_range(zone, location, offset, data.len())?;
            zone.region().write_bytes(start, data);
            zone.region().persist(start, data.len())
        })
    }

    pub fn audit(&self) -> HeapResult<HeapAudit> {
        self.operation("audit", LockMode::Shared, |zone, _| Ok(zone.audit()))
    }

    pub fn stats(&self) -> HeapResult<HeapStats> {
        Ok(self.audit()?.stats())
    }

    fn zone(&self) -> HeapResult<&Zone> {
        self.zone.as_ref().ok_or(HeapError::NotOpen(self.pool))
    }

    fn check_alive(&self) -> HeapResult<()> {
        match self.crashed() {
            Some(point) => Err(HeapError::Crashed(point)),
            None => Ok(()),
        }
    }

    /// Run `f` pinned to the epoch, under the operation lock and the file lock
    fn operation<T>(
        &self,
        op: &'static str,
        mode: LockMode,
        f: impl FnOnce(&Zone, &dyn Checkpoints) -> HeapResult<T>,
    ) -> HeapResult<T> {
        self.check_alive()?;
        let zone = self.zone()?;
        let _pin = self.epoch.pin()?;
        let span = OperationSpan::new(op, self.pool);
        let _entered = span.span().enter();
        let _guard = self.op_lock.lock();
        let _file_lock = zone.lock(mode)?;
        self.poison_on_crash(f(zone, self.checkpoints.as_ref()))
    }

    /// Run `f` inside an exclusive recovery window
    fn recovery<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&Zone, &dyn Checkpoints) -> HeapResult<T>,
    ) -> HeapResult<T> {
        self.check_alive()?;
        let zone = self.zone()?;
        let window = self.epoch.recovery_window()?;
        let span = OperationSpan::new(op, self.pool);
        let _entered = span.span().enter();
        let _guard = self.op_lock.lock();
        let _file_lock = zone.lock(LockMode::Exclusive)?;
        let result = self.poison_on_crash(f(zone, self.checkpoints.as_ref()));
        drop(window);
        result
    }

    fn poison_on_crash<T>(&self, result: HeapResult<T>) -> HeapResult<T> {
        if let Err(HeapError::Crashed(point)) = &result {
            error!(pool = self.pool, checkpoint = %point, "Heap handle crashed");
            *self.crashed.lock() = Some(*point);
        }
        result
    }
}

/// Absolute byte offset of `[offset, offset + len)` inside the allocated block at `location`
fn block_range(zone: &Zone, location: Location, offset: u64, len: usize) -> HeapResult<u64> {
    let (start, size) = zone.allocated_span(location)?;
    let end = offset.checked_add(len as u64);
    if end.map_or(true, |end| end > size) {
        return Err(HeapError::InvalidArgument(format!(
            "access of {} bytes at offset {} exceeds block of {} bytes at {}",
            len, offset, size, location
        )));
    }
    Ok(start + offset)
}

impl Drop for Heap {
    fn drop(&mut self) {
        if self.zone.is_some() && self.crashed().is_none() {
            if let Err(err) = self.close() {
                error!(pool = self.pool, error = %err, "Failed to close heap on drop");
            }
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("pool", &self.pool)
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("crashed", &self.crashed())
            .finish()
    }
}

impl PersistentAllocator for Heap {
    fn alloc(&self, size: u64) -> HeapResult<Location> {
        Heap::alloc(self, size)
    }

    fn free(&self, location: Location) -> HeapResult<()> {
        Heap::free(self, location)
    }

    fn min_alloc_size(&self) -> u64 {
        Heap::min_alloc_size(self)
    }

    fn capacity(&self) -> HeapResult<u64> {
        Heap::capacity(self)
    }
}

impl Coalescer for Heap {
    fn merge(&self) -> HeapResult<MergeReport> {
        Heap::merge(self)
    }
}

impl Recoverable for Heap {
    fn online_recover(&self) -> HeapResult<RecoveryReport> {
        Heap::online_recover(self)
    }

    fn offline_recover(&self) -> HeapResult<RecoveryReport> {
        Heap::offline_recover(self)
    }

    fn audit(&self) -> HeapResult<HeapAudit> {
        Heap::audit(self)
    }
}
