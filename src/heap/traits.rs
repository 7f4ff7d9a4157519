/*!
 * Heap Traits
 * Allocation, coalescing and recovery abstractions
 */

use super::merge::MergeReport;
use crate::core::{HeapResult, Location};
use crate::recovery::{HeapAudit, HeapStats, RecoveryReport};

/// Persistent allocator interface
pub trait PersistentAllocator: Send + Sync {
    /// Allocate a block of at least `size` bytes
    fn alloc(&self, size: u64) -> HeapResult<Location>;

    /// Return an allocated block to its free list
    fn free(&self, location: Location) -> HeapResult<()>;

    /// Smallest block handed out, in bytes
    fn min_alloc_size(&self) -> u64;

    /// Total bytes managed, header and metadata included
    fn capacity(&self) -> HeapResult<u64>;
}

/// Explicit coalescing
pub trait Coalescer: Send + Sync {
    fn merge(&self) -> HeapResult<MergeReport>;
}

/// Crash recovery and inspection
pub trait Recoverable: Send + Sync {
    fn online_recover(&self) -> HeapResult<RecoveryReport>;

    fn offline_recover(&self) -> HeapResult<RecoveryReport>;

    fn audit(&self) -> HeapResult<HeapAudit>;

    fn stats(&self) -> HeapResult<HeapStats> {
        Ok(self.audit()?.stats())
    }
}
