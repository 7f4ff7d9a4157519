/*!
 * Epoch Manager
 * Start/stop participation and gate recovery windows
 */

use crate::core::{HeapError, HeapResult};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, info};

/// Epoch coordinator
///
/// One instance per process, constructed explicitly and shared through `Arc`
/// by every heap handle of that process.
///
/// # Performance
/// - Cache-line aligned to keep the pin counter off shared lines
#[repr(C, align(64))]
#[derive(Debug)]
pub struct EpochManager {
    active: AtomicBool,
    epoch: AtomicU64,
    in_flight: AtomicUsize,
    // Readers are operations, the writer is a recovery window or a draining stop()
    gate: RwLock<()>,
}

/// Held by a heap operation while it touches persistent state
pub struct EpochPin<'a> {
    manager: &'a EpochManager,
    _gate: RwLockReadGuard<'a, ()>,
}

impl Drop for EpochPin<'_> {
    fn drop(&mut self) {
        self.manager.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive access for recovery; no operation can pin while it is held
pub struct RecoveryWindow<'a> {
    epoch: u64,
    _gate: RwLockWriteGuard<'a, ()>,
}

impl RecoveryWindow<'_> {
    /// Epoch in which the window was opened
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl EpochManager {
    /// New coordinator, inactive until `start()`
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            gate: RwLock::new(()),
        }
    }

    /// New coordinator that is already participating
    pub fn started() -> Self {
        let manager = Self::new();
        manager.start();
        manager
    }

    /// Resume participation in shared persistent state
    pub fn start(&self) {
        if !self.active.swap(true, Ordering::AcqRel) {
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            info!(epoch, "Epoch coordinator started");
        }
    }

    /// Stop participating; returns once every in-flight operation has drained
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            // Acquiring the write side waits out every pinned operation
            drop(self.gate.write());
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            info!(epoch, "Epoch coordinator stopped, in-flight operations drained");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Operations currently pinned
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Pin for the duration of one heap operation
    pub fn pin(&self) -> HeapResult<EpochPin<'_>> {
        if !self.is_active() {
            return Err(HeapError::EpochInactive);
        }
        let gate = self
            .gate
            .try_read()
            .ok_or_else(|| HeapError::NotQuiescent(self.in_flight()))?;
        // stop() may have won the race between the check and the read lock
        if !self.is_active() {
            return Err(HeapError::EpochInactive);
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(EpochPin {
            manager: self,
            _gate: gate,
        })
    }

    /// Open a recovery window; fails while any operation is pinned
    pub fn recovery_window(&self) -> HeapResult<RecoveryWindow<'_>> {
        let gate = self
            .gate
            .try_write()
            .ok_or_else(|| HeapError::NotQuiescent(self.in_flight()))?;
        let epoch = self.current_epoch();
        debug!(epoch, "Recovery window opened");
        Ok(RecoveryWindow { epoch, _gate: gate })
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}
