//! Meta-service collaborator seam (§4.1): the source of truth for which
//! partitions belong to this node, external to the storage core itself.
//!
//! Kept as a trait with one mock implementation, the same polymorphism
//! pattern as `graphstore_engine::RaftHandle`: the real meta client is a
//! separate service the storage core is driven by, not something this crate
//! implements.

use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use graphstore_core::{PartitionId, SpaceId};

/// A membership change the meta client has observed, driving `Store::add_part`
/// / `Store::remove_part`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    /// This node now hosts `part` of `space`.
    AddPart { space: SpaceId, part: PartitionId },
    /// This node no longer hosts `part` of `space`.
    RemovePart { space: SpaceId, part: PartitionId },
}

/// What `Store` needs from the meta service: the current partition
/// assignment for this node, and a way to be notified when it changes.
pub trait MetaClient: Send + Sync {
    /// Every space this node is aware of.
    fn spaces(&self) -> Vec<SpaceId>;

    /// Partitions of `space` currently assigned to this node.
    fn parts_for_space(&self, space: SpaceId) -> Vec<PartitionId>;

    /// Register a callback invoked once per membership change. A meta
    /// client implementation may support only one registered callback at a
    /// time (the storage core registers exactly one, at `Store` construction).
    fn register_listener(&self, callback: Arc<dyn Fn(MembershipChange) + Send + Sync>);
}

/// An in-memory `MetaClient` used by tests and by the single-node/embedded
/// deployment mode: the assignment is whatever `set_parts`/
/// `simulate_membership_change` say it is, with no real cluster behind it.
#[derive(Default)]
pub struct MockMetaClient {
    assignment: RwLock<FxHashMap<SpaceId, Vec<PartitionId>>>,
    listener: RwLock<Option<Arc<dyn Fn(MembershipChange) + Send + Sync>>>,
}

impl MockMetaClient {
    /// A client with no spaces assigned.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the initial assignment, e.g. before passing this client to
    /// `Store::open` so the startup scan finds the expected partitions.
    pub fn set_parts(&self, space: SpaceId, parts: Vec<PartitionId>) {
        self.assignment.write().unwrap().insert(space, parts);
    }

    /// Apply a membership change to the internal assignment and notify the
    /// registered listener, exactly as a real meta client would after a
    /// cluster reconfiguration commits.
    pub fn simulate_membership_change(&self, change: MembershipChange) {
        {
            let mut assignment = self.assignment.write().unwrap();
            match change {
                MembershipChange::AddPart { space, part } => {
                    let parts = assignment.entry(space).or_default();
                    if !parts.contains(&part) {
                        parts.push(part);
                    }
                }
                MembershipChange::RemovePart { space, part } => {
                    if let Some(parts) = assignment.get_mut(&space) {
                        parts.retain(|p| *p != part);
                    }
                }
            }
        }
        if let Some(listener) = self.listener.read().unwrap().as_ref() {
            listener(change);
        }
    }
}

impl MetaClient for MockMetaClient {
    fn spaces(&self) -> Vec<SpaceId> {
        self.assignment.read().unwrap().keys().copied().collect()
    }

    fn parts_for_space(&self, space: SpaceId) -> Vec<PartitionId> {
        self.assignment.read().unwrap().get(&space).cloned().unwrap_or_default()
    }

    fn register_listener(&self, callback: Arc<dyn Fn(MembershipChange) + Send + Sync>) {
        *self.listener.write().unwrap() = Some(callback);
    }
}
