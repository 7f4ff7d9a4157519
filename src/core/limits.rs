/*!
 * Heap Limits and Constants
 *
 * Centralized location for the durable-format constants and size limits.
 * Changing anything marked [FORMAT] changes the on-disk layout and requires a
 * FORMAT_VERSION bump.
 */

// =============================================================================
// UNITS AND LEVELS
// =============================================================================

/// Minimum allocation size in bytes (one cache line)
/// [FORMAT]
pub const UNIT_SIZE: u64 = 64;

/// log2(UNIT_SIZE)
pub const UNIT_SHIFT: u32 = 6;

/// Number of per-level free lists the header can describe
/// [FORMAT]
pub const MAX_LEVELS: usize = 48;

/// Smallest heap: 2^10 units (64 KiB)
pub const MIN_HEAP_SHIFT: u32 = 10;

/// Largest heap: 2^42 units (256 TiB), bounded by the 48-bit offset in a packed location
pub const MAX_HEAP_SHIFT: u32 = 42;

// =============================================================================
// REGION LAYOUT
// =============================================================================

/// Header occupies units [0, 8), a level-3 block
/// [FORMAT]
pub const HEADER_UNITS: u64 = 8;
pub const HEADER_LEVEL: u32 = 3;

/// The metadata region is 2^(N - METADATA_SHIFT_DELTA) units and starts at the
/// same offset: one tag byte plus one merge bit per unit fit with room to spare
/// [FORMAT]
pub const METADATA_SHIFT_DELTA: u32 = 5;

/// Header magic ("PMHEAP01")
/// [FORMAT]
pub const HEAP_MAGIC: u64 = 0x504d_4845_4150_3031;

/// Free-list node magic written into the first word of every listed block
/// [FORMAT]
pub const FREE_NODE_MAGIC: u64 = 0x4652_4545_4e4f_4445;

/// Durable format version
pub const FORMAT_VERSION: u64 = 1;

/// Link slots per free-list node; a merge stages through a slot neither
/// affected list uses
/// [FORMAT]
pub const LINK_SLOTS: usize = 3;

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Granularity used to align msync ranges
pub const PERSIST_PAGE: usize = 4096;

// =============================================================================
// ENVIRONMENT
// =============================================================================

pub const ENV_ROOT: &str = "PMHEAP_ROOT";
pub const ENV_SYNC: &str = "PMHEAP_SYNC";
pub const ENV_MAX_MERGE_LEVEL: &str = "PMHEAP_MAX_MERGE_LEVEL";
pub const ENV_TRACE_JSON: &str = "PMHEAP_TRACE_JSON";

/// Default directory name under the system temp dir for heap files
pub const DEFAULT_ROOT_DIR: &str = "pmheap";
