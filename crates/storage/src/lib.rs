//! Embedded KV engine (§4.3): batch writes, range/prefix iteration,
//! snapshots, and bulk ingest/checkpoint support, behind the [`KvEngine`]
//! trait so `graphstore-engine` never depends on a concrete backend.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod mem_engine;
mod traits;
mod write_batch;

pub use mem_engine::MemEngine;
pub use traits::{EngineIterator, EngineSnapshot, KvEngine};
pub use write_batch::WriteBatch;
