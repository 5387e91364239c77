//! Error types for the scheduler

use thiserror::Error;

/// Result type for scheduler operations
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Errors surfaced to callers of the scheduler and its service facade
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Accepting a batch of entries would exceed an entry quota; the whole
    /// batch is rejected and no state changes.
    #[error("Too many schedule entries")]
    EntryFull,

    /// The requesting peer could not be resolved to a stable identity.
    #[error("Could not identify peer '{0}'")]
    IdentifyingPeer(String),

    /// An entry property map carried a recognized key of the wrong type.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Lookup of a nonexistent (or unpermitted) entry.
    #[error("Unknown schedule entry '{0}'")]
    UnknownEntry(String),

    /// The entry behind a client handle disappeared on the server side.
    #[error("Schedule entry '{0}' no longer exists")]
    Invalidated(String),

    /// The operation was aborted by scheduler shutdown.
    #[error("Operation cancelled")]
    Cancelled,
}
