//! Error taxonomy for the storage core (§7).
//!
//! Propagation is explicit: no exceptions for control flow. Within a
//! multi-row request, the first non-recoverable error aborts the
//! partition's batch; partitions that already succeeded are not rolled
//! back, since writes to different partitions are independent by contract.

use thiserror::Error;

/// Result alias used throughout the storage core.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the storage core, covering every code in §7's
/// taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // --- Addressing ---
    /// The requested space does not exist on this node.
    #[error("space not found: {0:?}")]
    SpaceNotFound(crate::ids::SpaceId),

    /// The requested partition does not exist on this node.
    #[error("partition not found: space={0:?} part={1:?}")]
    PartNotFound(crate::ids::SpaceId, crate::ids::PartitionId),

    /// A VID did not match the space's configured shape (wrong fixed
    /// length, or an integer VID where bytes were expected).
    #[error("invalid vid: {0}")]
    InvalidVid(String),

    // --- Leadership ---
    /// The partition is no longer led by this node (or its term changed
    /// mid-request).
    #[error("leader changed for part {0:?}")]
    LeaderChanged(crate::ids::PartitionId),

    /// This node believes it is the leader but its lease has expired.
    #[error("leader lease failed for part {0:?}")]
    LeaderLeaseFailed(crate::ids::PartitionId),

    // --- Concurrency ---
    /// A write conflicted with another in-flight writer's mem-lock, or
    /// arrived while the partition's index was `Locked`.
    #[error("data conflict: {0}")]
    DataConflict(String),

    /// The partition is write-blocked (only heartbeats replicate).
    #[error("partition {0:?} is write-blocked")]
    BlockingWrite(crate::ids::PartitionId),

    // --- Storage ---
    /// The requested key does not exist.
    #[error("key not found")]
    KeyNotFound,

    /// A `multiGet` returned fewer values than keys requested, and the
    /// caller did not opt in to partial results.
    #[error("partial result: {found} of {requested} keys found")]
    PartialResult {
        /// Keys that were found.
        found: usize,
        /// Keys that were requested.
        requested: usize,
    },

    // --- Integrity ---
    /// The encoded row or index payload was malformed.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A field value could not be encoded/decoded against the schema.
    #[error("invalid field value: {0}")]
    InvalidFieldValue(String),

    // --- Lifecycle ---
    /// An index rebuild subtask failed.
    #[error("rebuild index failed: {0}")]
    RebuildIndexFailed(String),

    /// Creating a checkpoint failed.
    #[error("failed to checkpoint: {0}")]
    FailedToCheckpoint(String),

    /// The admin task was canceled by the caller.
    #[error("user canceled")]
    UserCanceled,

    // --- Raft ---
    /// A Raft atomic-op closure failed to commit; the caller must re-drive
    /// it (the closure is expected to be idempotent or safely re-derivable).
    #[error("raft atomic op failed: {0}")]
    RaftAtomicOpFailed(String),

    // --- Resource ---
    /// The process memory watermark was exceeded; writes fail fast.
    #[error("memory usage exceeded high watermark")]
    MemoryExceeded,

    // --- I/O / encoding (ambient) ---
    /// Underlying I/O failure (file operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A write batch was committed with `wait=false` and the engine
    /// declined immediate durability.
    #[error("write incomplete, durability pending")]
    Incomplete,
}

impl Error {
    /// Whether a caller may reasonably retry this operation (possibly after
    /// backoff or re-routing to a new leader).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LeaderChanged(_)
                | Error::LeaderLeaseFailed(_)
                | Error::DataConflict(_)
                | Error::BlockingWrite(_)
                | Error::RaftAtomicOpFailed(_)
                | Error::Incomplete
        )
    }

    /// Whether this is specifically a concurrency conflict (as opposed to
    /// any other retryable error).
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::DataConflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{PartitionId, SpaceId};

    #[test]
    fn retryable_classification() {
        assert!(Error::DataConflict("x".into()).is_retryable());
        assert!(Error::LeaderChanged(PartitionId::new(1)).is_retryable());
        assert!(!Error::KeyNotFound.is_retryable());
        assert!(!Error::SpaceNotFound(SpaceId::new(1)).is_retryable());
    }

    #[test]
    fn conflict_classification() {
        assert!(Error::DataConflict("x".into()).is_conflict());
        assert!(!Error::BlockingWrite(PartitionId::new(1)).is_conflict());
    }

    #[test]
    fn display_messages() {
        assert_eq!(Error::KeyNotFound.to_string(), "key not found");
        assert_eq!(
            Error::PartialResult {
                found: 3,
                requested: 5
            }
            .to_string(),
            "partial result: 3 of 5 keys found"
        );
    }
}
