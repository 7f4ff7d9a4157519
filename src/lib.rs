/*!
 * pmheap
 * Crash-consistent buddy heap over memory-mapped persistent files
 */

pub mod config;
pub mod core;
pub mod epoch;
pub mod fault;
pub mod heap;
pub mod monitoring;
pub mod recovery;
pub mod registry;

// Re-exports
pub use config::{HeapConfig, RegistryConfig, SyncMode};
pub use core::{HeapError, HeapResult, Level, Location, PoolId, Unit};
pub use epoch::EpochManager;
pub use fault::{Checkpoints, CrashPoint, FaultInjector, NoCheckpoints};
pub use heap::{BlockTag, Coalescer, Heap, HeapLayout, MergeReport, PersistentAllocator, Recoverable};
pub use monitoring::init_tracing;
pub use recovery::{AuditBlock, HeapAudit, HeapStats, RecoveryReport, RecoveryStatus};
pub use registry::HeapRegistry;
