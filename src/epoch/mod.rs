/*!
 * Epoch Coordinator
 *
 * Process-wide admission control for shared persistent state. Heap operations
 * pin the coordinator for their duration; recovery takes an exclusive window
 * that is only granted once nothing is pinned.
 */

mod manager;

pub use manager::{EpochManager, EpochPin, RecoveryWindow};
