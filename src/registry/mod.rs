/*!
 * Pool Registry
 * Directory-backed create / find / destroy of heap files, one file per pool
 */

use crate::config::RegistryConfig;
use crate::core::{HeapError, HeapResult, PoolId};
use crate::epoch::EpochManager;
use crate::heap::zone::Zone;
use crate::heap::{Heap, HeapLayout};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const FILE_PREFIX: &str = "pool-";
const FILE_SUFFIX: &str = ".pmh";

/// Heap files under one root directory, sharing one epoch coordinator
#[derive(Debug, Clone)]
pub struct HeapRegistry {
    config: RegistryConfig,
    epoch: Arc<EpochManager>,
}

impl HeapRegistry {
    /// Open (creating if needed) the registry directory
    pub fn new(config: RegistryConfig, epoch: Arc<EpochManager>) -> HeapResult<Self> {
        fs::create_dir_all(&config.root)?;
        info!(root = %config.root.display(), "Heap registry ready");
        Ok(Self { config, epoch })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn epoch(&self) -> &Arc<EpochManager> {
        &self.epoch
    }

    pub fn heap_path(&self, pool: PoolId) -> PathBuf {
        self.config
            .root
            .join(format!("{}{:05}{}", FILE_PREFIX, pool, FILE_SUFFIX))
    }

    /// Create and format a heap of `size_bytes` (a power of two)
    pub fn create_heap(&self, pool: PoolId, size_bytes: u64) -> HeapResult<()> {
        let layout = HeapLayout::for_size(size_bytes)?;
        let path = self.heap_path(pool);
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(HeapError::AlreadyExists(pool))
            }
            Err(err) => return Err(err.into()),
        };

        let formatted = file
            .set_len(size_bytes)
            .map_err(HeapError::from)
            .and_then(|_| Zone::format(file, pool, layout, self.config.heap.sync_mode))
            .and_then(|zone| zone.region().flush());
        if let Err(err) = formatted {
            // A half-written file must not be found later
            if let Err(cleanup) = fs::remove_file(&path) {
                warn!(
                    pool,
                    path = %path.display(),
                    error = %cleanup,
                    "Failed to remove partially created heap file"
                );
            }
            return Err(err);
        }

        info!(pool, size_bytes, path = %path.display(), "Created heap");
        Ok(())
    }

    /// Unopened handle to an existing heap
    pub fn find_heap(&self, pool: PoolId) -> HeapResult<Heap> {
        let path = self.heap_path(pool);
        if !path.is_file() {
            return Err(HeapError::NotFound(pool));
        }
        debug!(pool, path = %path.display(), "Found heap");
        Ok(Heap::new(pool, path, self.config.heap, Arc::clone(&self.epoch)))
    }

    pub fn destroy_heap(&self, pool: PoolId) -> HeapResult<()> {
        match fs::remove_file(self.heap_path(pool)) {
            Ok(()) => {
                info!(pool, "Destroyed heap");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Err(HeapError::NotFound(pool)),
            Err(err) => Err(err.into()),
        }
    }

    /// Pools with a heap file in the root directory, ascending
    pub fn pools(&self) -> HeapResult<Vec<PoolId>> {
        let mut pools: Vec<PoolId> = fs::read_dir(&self.config.root)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                name.strip_prefix(FILE_PREFIX)?
                    .strip_suffix(FILE_SUFFIX)?
                    .parse::<PoolId>()
                    .ok()
            })
            .collect();
        pools.sort_unstable();
        Ok(pools)
    }
}
