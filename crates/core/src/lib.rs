//! Core types for the graph storage engine.
//!
//! This crate defines the foundational, dependency-free pieces shared by
//! every layer of the storage core:
//! - identifiers (`SpaceId`, `PartitionId`, `TagId`, `EdgeType`, `VertexId`, `LogId`, `TermId`)
//! - the bit-exact key layout (`key`)
//! - the log-record wire format (`wire`)
//! - the error taxonomy (`error`)
//! - size limits (`limits`)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod ids;
pub mod key;
pub mod limits;
pub mod wire;

pub use error::{Error, Result};
pub use ids::{ClusterId, EdgeType, IndexId, LogId, PartitionId, SpaceId, TagId, TermId, VertexId};
pub use limits::Limits;
