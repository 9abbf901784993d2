//! Partition lifecycle (§4.2, §4.5): turning committed Raft log entries and
//! snapshot transfers into KV engine state, plus the collaborator traits
//! (`RaftHandle`, `Listener`) a partition is driven by and reports to.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod listener;
mod partition;
mod raft;
mod snapshot_manager;

pub use listener::{CountingListener, Listener, NoopListener};
pub use partition::{CommitEntry, Partition};
pub use raft::{LocalRaftHandle, RaftHandle};
pub use snapshot_manager::{SnapshotManager, SnapshotStatus};
