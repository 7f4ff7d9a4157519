/*!
 * Error Types
 * Centralized error handling with thiserror and miette
 */

use super::types::{Level, PoolId};
use crate::fault::CrashPoint;
use miette::Diagnostic;
use thiserror::Error;

/// Heap operation result
pub type HeapResult<T> = Result<T, HeapError>;

/// Heap errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum HeapError {
    #[error("Pool {0} not found")]
    #[diagnostic(
        code(heap::not_found),
        help("The pool was never created or has already been destroyed.")
    )]
    NotFound(PoolId),

    #[error("Pool {0} already exists")]
    #[diagnostic(code(heap::already_exists))]
    AlreadyExists(PoolId),

    #[error("Out of space: requested {requested} bytes (level {level}), high-water mark at unit {high_water} of {capacity}")]
    #[diagnostic(
        code(heap::out_of_space),
        help("Free unused blocks and run merge to rebuild larger free blocks.")
    )]
    OutOfSpace {
        requested: u64,
        level: Level,
        high_water: u64,
        capacity: u64,
    },

    #[error("Invalid argument: {0}")]
    #[diagnostic(code(heap::invalid_argument))]
    InvalidArgument(String),

    #[error("Heap unrecoverable: {0}")]
    #[diagnostic(
        code(heap::unrecoverable),
        help("Persistent metadata matches no valid history. Treat the pool as lost.")
    )]
    Unrecoverable(String),

    #[error("Merge marker at level {0}: online recovery required before further merges")]
    #[diagnostic(code(heap::recovery_required), help("Call online_recover() first."))]
    RecoveryRequired(i64),

    #[error("Heap {0} is not open")]
    #[diagnostic(code(heap::not_open))]
    NotOpen(PoolId),

    #[error("Heap {0} is already open")]
    #[diagnostic(code(heap::already_open))]
    AlreadyOpen(PoolId),

    #[error("Epoch coordinator is stopped")]
    #[diagnostic(code(heap::epoch_inactive), help("Call EpochManager::start() first."))]
    EpochInactive,

    #[error("Heap not quiescent: {0} operation(s) in flight or recovery window held")]
    #[diagnostic(code(heap::not_quiescent))]
    NotQuiescent(usize),

    #[error("Crash injected at checkpoint '{0}'")]
    #[diagnostic(
        code(heap::crashed),
        help("This handle is dead. Reopen the heap and run the matching recovery.")
    )]
    Crashed(CrashPoint),

    #[error("Heap format error: {0}")]
    #[diagnostic(code(heap::format))]
    Format(String),

    #[error("I/O error: {0}")]
    #[diagnostic(code(heap::io))]
    Io(String),
}

impl HeapError {
    /// True when the error came from an injected crash
    pub fn is_crash(&self) -> bool {
        matches!(self, HeapError::Crashed(_))
    }
}

impl From<std::io::Error> for HeapError {
    fn from(err: std::io::Error) -> Self {
        HeapError::Io(err.to_string())
    }
}

impl From<nix::errno::Errno> for HeapError {
    fn from(err: nix::errno::Errno) -> Self {
        HeapError::Io(err.desc().to_string())
    }
}
