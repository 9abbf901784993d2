//! # graphstore
//!
//! The per-node storage core of a distributed graph database: a
//! Raft-replicated, partitioned key-value substrate, a wait-free in-memory
//! WAL buffer backed by durable segment files, rate-limited snapshot
//! transfer, and online secondary-index rebuild.
//!
//! This crate is a thin facade over the workspace's layered implementation
//! crates (innermost first: `graphstore-core`, `graphstore-storage`,
//! `graphstore-durability`, `graphstore-concurrency`, `graphstore-engine`,
//! `graphstore-primitives`, `graphstore-api`) and re-exports the surface an
//! embedder needs to open a [`Store`], wire up a [`MetaClient`], and drive
//! reads/writes/admin tasks against it. The query planner, row codec,
//! external meta/catalog service, Raft transport, and RPC/HTTP/CLI layers
//! are all out of scope here and appear only as the trait seams
//! (`RaftHandle`, `MetaClient`, `RowCodec`, `Listener`) this crate is driven
//! through.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use graphstore::{MockMetaClient, Store, StoreConfig};
//!
//! # fn main() -> graphstore::Result<()> {
//! let dir = tempfile::tempdir().unwrap();
//! let meta = Arc::new(MockMetaClient::new());
//! meta.set_parts(graphstore::SpaceId::new(1), vec![graphstore::PartitionId::new(1)]);
//!
//! let store = Store::open(StoreConfig::for_testing(dir.path().to_path_buf()), meta)?;
//! store.async_multi_put(
//!     graphstore::SpaceId::new(1),
//!     graphstore::PartitionId::new(1),
//!     vec![(b"k".to_vec(), b"v".to_vec())],
//!     true,
//! )?;
//! assert_eq!(
//!     store.get(graphstore::SpaceId::new(1), graphstore::PartitionId::new(1), b"k", false)?,
//!     b"v".to_vec()
//! );
//! # Ok(())
//! # }
//! ```
//!
//! Internal crates below `graphstore-api` are not exposed directly; this
//! facade re-exports only the types an embedder constructs or implements
//! against.

#![warn(missing_docs)]

pub use graphstore_api::{
    CheckpointInfo, CheckpointPartitionInfo, MembershipChange, MetaClient, MockMetaClient, MultiGetResponse, MultiGetStatus, Store,
    StoreConfig,
};
pub use graphstore_core::error::{Error, Result};
pub use graphstore_core::ids::{ClusterId, EdgeType, IndexId, LogId, PartitionId, SpaceId, TagId, TermId, VertexId};
pub use graphstore_core::limits::Limits;
pub use graphstore_engine::{CountingListener, Listener, LocalRaftHandle, NoopListener, Partition, RaftHandle};
pub use graphstore_primitives::{
    AdminStatus, AdminTaskHandle, AdminTaskManager, FieldValue, IndexCatalog, IndexDef, IndexState, PartitionStats, RowCodec, ScanCollector,
    ScanCursor, ScanRequest, ScanResult, Subtask, TaskKind, WriteContext,
};
pub use graphstore_storage::{EngineIterator, EngineSnapshot, KvEngine, MemEngine, WriteBatch};
