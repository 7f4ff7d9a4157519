/*!
 * Heap File Lock
 * Advisory flock serialising heap metadata access across handles and processes
 */

use crate::core::{HeapError, HeapResult};
use nix::fcntl::{Flock, FlockArg};
use std::fs::File;

/// Lock mode for one heap operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Readers of metadata and block contents
    Shared,
    /// Anything that writes the header, block map, bitmap or free lists
    Exclusive,
}

/// Held for the duration of one operation; released on drop
///
/// flock locks belong to the open file description, so every `Heap` handle
/// opens the file itself. Threads sharing one handle are ordered by the
/// handle's operation lock instead.
#[derive(Debug)]
pub struct HeapFileLock {
    _lock: Flock<File>,
}

impl HeapFileLock {
    /// Block until the lock is granted
    pub fn acquire(file: &File, mode: LockMode) -> HeapResult<Self> {
        let arg = match mode {
            LockMode::Shared => FlockArg::LockShared,
            LockMode::Exclusive => FlockArg::LockExclusive,
        };
        // The duplicate shares the open file description, hence the lock
        let dup = file.try_clone()?;
        let lock = Flock::lock(dup, arg).map_err(|(_, errno)| HeapError::from(errno))?;
        Ok(Self { _lock: lock })
    }
}
