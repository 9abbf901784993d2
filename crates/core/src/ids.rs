//! Identifiers used throughout the storage core.
//!
//! All identifiers are plain newtypes over fixed-width integers so that key
//! encoding (see [`crate::key`]) stays bit-exact and comparisons stay cheap.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! u32_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            /// Construct from a raw value.
            pub const fn new(v: u32) -> Self {
                Self(v)
            }

            /// The raw value.
            pub const fn get(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            fn from(v: u32) -> Self {
                Self(v)
            }
        }
    };
}

u32_id!(SpaceId);
u32_id!(PartitionId);
u32_id!(TagId);

/// Edge type. The sign bit distinguishes outbound (positive) from inbound
/// (negative, stored as the two's complement of the outbound type) edges, as
/// used in the edge key layout (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeType(pub i32);

impl EdgeType {
    /// Construct from a raw signed value.
    pub const fn new(v: i32) -> Self {
        Self(v)
    }

    /// The raw signed value.
    pub const fn get(self) -> i32 {
        self.0
    }

    /// Whether this is the outbound (positive) direction of the edge type.
    pub const fn is_outbound(self) -> bool {
        self.0 >= 0
    }

    /// The reversed (inbound/outbound swapped) edge type.
    pub const fn reversed(self) -> Self {
        Self(-self.0)
    }
}

/// Raft log entry id. Monotonically non-decreasing per partition.
pub type LogId = u64;

/// Raft term id. Monotonic across commits for a given partition.
pub type TermId = u64;

/// Raft cluster id, carried on each log record for multi-cluster safety
/// checks upstream of this core.
pub type ClusterId = u64;

/// Index identifier (secondary index on a tag or edge type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexId(pub u32);

impl IndexId {
    /// Construct from a raw value.
    pub const fn new(v: u32) -> Self {
        Self(v)
    }
}

/// A vertex identifier: either a fixed-length byte string or a signed
/// 64-bit integer, per the space's configured VID type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VertexId {
    /// Fixed-length byte string VID, stored left-justified and zero-padded
    /// to the space's `vid_len`.
    Bytes(Vec<u8>),
    /// Signed 64-bit integer VID, encoded big-endian with the sign bit
    /// flipped so that unsigned lexicographic comparison matches signed
    /// numeric order.
    Int(i64),
}

impl VertexId {
    /// Encode this VID to its on-disk representation, padded/sized to
    /// `vid_len` bytes. Returns `Err` if a byte-string VID is longer than
    /// `vid_len`.
    pub fn encode(&self, vid_len: usize) -> Result<Vec<u8>, crate::error::Error> {
        match self {
            VertexId::Bytes(b) => {
                if b.len() > vid_len {
                    return Err(crate::error::Error::InvalidVid(format!(
                        "vid length {} exceeds configured vid_len {}",
                        b.len(),
                        vid_len
                    )));
                }
                let mut out = vec![0u8; vid_len];
                out[..b.len()].copy_from_slice(b);
                Ok(out)
            }
            VertexId::Int(v) => {
                if vid_len != 8 {
                    return Err(crate::error::Error::InvalidVid(format!(
                        "integer vid requires vid_len == 8, got {}",
                        vid_len
                    )));
                }
                let flipped = (*v as u64) ^ (1u64 << 63);
                Ok(flipped.to_be_bytes().to_vec())
            }
        }
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VertexId::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            VertexId::Int(v) => write!(f, "{v}"),
        }
    }
}
