/*!
 * Configuration
 * Heap and registry settings, with environment overrides
 */

use crate::core::limits::{DEFAULT_ROOT_DIR, ENV_MAX_MERGE_LEVEL, ENV_ROOT, ENV_SYNC};
use crate::core::{HeapError, HeapResult, Level};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// How persistence points reach the backing file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Ordering fence only; durability follows the page cache (tmpfs / DAX style)
    #[default]
    Fence,
    /// Fence plus a synchronous msync of the touched pages
    Msync,
}

impl FromStr for SyncMode {
    type Err = HeapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fence" => Ok(SyncMode::Fence),
            "msync" => Ok(SyncMode::Msync),
            other => Err(HeapError::InvalidArgument(format!(
                "unknown sync mode '{}' (expected fence or msync)",
                other
            ))),
        }
    }
}

/// Per-heap settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeapConfig {
    pub sync_mode: SyncMode,
    /// Highest level a merge pass may produce; `None` merges up to the largest block level
    pub max_merge_level: Option<Level>,
}

impl HeapConfig {
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    pub fn with_max_merge_level(mut self, level: Level) -> Self {
        self.max_merge_level = Some(level);
        self
    }
}

/// Registry settings: where heap files live and how they are opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub root: PathBuf,
    pub heap: HeapConfig,
}

impl RegistryConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            heap: HeapConfig::default(),
        }
    }

    pub fn with_heap_config(mut self, heap: HeapConfig) -> Self {
        self.heap = heap;
        self
    }

    /// Defaults overridden by PMHEAP_ROOT, PMHEAP_SYNC and PMHEAP_MAX_MERGE_LEVEL
    pub fn from_env() -> HeapResult<Self> {
        let mut config = Self::default();
        if let Ok(root) = std::env::var(ENV_ROOT) {
            config.root = PathBuf::from(root);
        }
        if let Ok(sync) = std::env::var(ENV_SYNC) {
            config.heap.sync_mode = sync.parse()?;
        }
        if let Ok(level) = std::env::var(ENV_MAX_MERGE_LEVEL) {
            let level = level.trim().parse::<Level>().map_err(|_| {
                HeapError::InvalidArgument(format!("{} must be a level number, got '{}'", ENV_MAX_MERGE_LEVEL, level))
            })?;
            config.heap.max_merge_level = Some(level);
        }
        Ok(config)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join(DEFAULT_ROOT_DIR))
    }
}
