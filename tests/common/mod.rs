/*!
 * Shared heap fixtures for integration tests
 */

#![allow(dead_code)]

use pmheap::{
    EpochManager, FaultInjector, Heap, HeapAudit, HeapConfig, HeapRegistry, Location, PoolId,
    RegistryConfig,
};
use std::sync::Arc;
use tempfile::TempDir;

/// Size used by the end-to-end scenarios: 2^21 units, metadata at unit 65536
pub const LARGE_HEAP: u64 = 128 * 1024 * 1024;

/// 2^14 units, metadata region [512, 1024)
pub const SMALL_HEAP: u64 = 1024 * 1024;

/// 2^10 units, metadata region [32, 64)
pub const TINY_HEAP: u64 = 64 * 1024;

pub const POOL: PoolId = 1;

pub struct Fixture {
    pub dir: TempDir,
    pub registry: HeapRegistry,
    pub epoch: Arc<EpochManager>,
}

impl Fixture {
    pub fn new(size: u64) -> Self {
        Self::with_config(size, HeapConfig::default())
    }

    pub fn with_config(size: u64, heap: HeapConfig) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let epoch = Arc::new(EpochManager::started());
        let registry = HeapRegistry::new(
            RegistryConfig::new(dir.path()).with_heap_config(heap),
            Arc::clone(&epoch),
        )
        .expect("registry");
        registry.create_heap(POOL, size).expect("create heap");
        Self {
            dir,
            registry,
            epoch,
        }
    }

    /// Open a fresh handle without fault injection
    pub fn open(&self) -> Heap {
        let mut heap = self.registry.find_heap(POOL).expect("find heap");
        heap.open().expect("open heap");
        heap
    }

    /// Open a fresh handle that consults `injector` at every checkpoint
    pub fn open_with(&self, injector: &Arc<FaultInjector>) -> Heap {
        let mut heap = self
            .registry
            .find_heap(POOL)
            .expect("find heap")
            .with_checkpoints(Arc::clone(injector) as Arc<dyn pmheap::Checkpoints>);
        heap.open().expect("open heap");
        heap
    }
}

/// Unit index of a location
pub fn unit(loc: Location) -> u64 {
    loc.offset() / 64
}

/// Allocate `count` single-unit blocks
pub fn alloc_units(heap: &Heap, count: usize) -> Vec<Location> {
    (0..count)
        .map(|_| heap.alloc(64).expect("unit alloc"))
        .collect()
}

/// Free blocks as (unit, level), ascending
pub fn free_blocks(audit: &HeapAudit) -> Vec<(u64, u32)> {
    let mut blocks: Vec<_> = audit.free.iter().map(|b| (b.unit, b.level)).collect();
    blocks.sort_unstable();
    blocks
}

/// Exact partition: every unit below the high-water mark in exactly one block,
/// nothing lost, no listing anomalies
pub fn assert_partition(audit: &HeapAudit) {
    assert!(
        audit.anomalies.is_empty(),
        "audit anomalies: {:?}",
        audit.anomalies
    );
    assert!(audit.lost.is_empty(), "lost blocks: {:?}", audit.lost);
    assert_eq!(audit.covered_units(), audit.high_water);
    for block in audit
        .allocated
        .iter()
        .chain(&audit.free)
        .chain(&audit.reserved)
    {
        assert_eq!(
            block.unit % (1 << block.level),
            0,
            "block at unit {} breaks alignment for level {}",
            block.unit,
            block.level
        );
    }
}
