//! Index-rebuild lifecycle state (§3, §4.7), keyed by `(space, part)` per
//! the data model: a partition's whole write path observes one rebuild
//! state at a time, not one per index, since nebula-style deployments only
//! run one rebuild against a given partition concurrently.
//!
//! Grounded in `graphstore_concurrency::MemLock`'s `DashMap`-per-key
//! striping idea, applied here to a small enum instead of a lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use graphstore_core::{PartitionId, SpaceId};

/// Where a partition's index rebuild currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// No rebuild in flight; write processors mutate indexes directly.
    Starting,
    /// A rebuild is running the base scan / replay loop; write processors
    /// additionally emit operation-log entries instead of touching the
    /// index directly (§4.7 step 2).
    Building,
    /// Final drain in progress; new writes are rejected with
    /// `Error::DataConflict` until the rebuild finishes.
    Locked,
    /// Rebuild complete; back to normal direct index maintenance.
    Finished,
}

/// Tracks rebuild state and in-flight write-processor request counts, one
/// entry per `(space, part)`. Shared between the rebuild task and every
/// write processor touching indexed data.
#[derive(Default)]
pub struct IndexStateTable {
    state: DashMap<(SpaceId, PartitionId), IndexState>,
    in_flight: DashMap<(SpaceId, PartitionId), Arc<AtomicUsize>>,
}

/// RAII handle incrementing a partition's in-flight write-processor count
/// on construction and decrementing it on drop, so the rebuild task's
/// `Locked` drain can poll the count down to zero without a callback.
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

impl IndexStateTable {
    /// An empty table; every partition starts `Starting` implicitly (absent
    /// entries are treated as `Starting` by [`IndexStateTable::state`]).
    pub fn new() -> Self {
        Self::default()
    }

    /// The current rebuild state for `(space, part)`, defaulting to
    /// `Starting` if no rebuild has ever touched this partition.
    pub fn state(&self, space: SpaceId, part: PartitionId) -> IndexState {
        self.state.get(&(space, part)).map(|s| *s).unwrap_or(IndexState::Starting)
    }

    /// Transition `(space, part)` to `state`.
    pub fn set_state(&self, space: SpaceId, part: PartitionId, state: IndexState) {
        self.state.insert((space, part), state);
    }

    fn counter(&self, space: SpaceId, part: PartitionId) -> Arc<AtomicUsize> {
        self.in_flight
            .entry((space, part))
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    /// Register one in-flight write-processor request against `(space,
    /// part)`. The returned guard decrements the count when the request
    /// finishes, however it finishes (including via early return or panic
    /// unwind).
    pub fn begin_request(&self, space: SpaceId, part: PartitionId) -> InFlightGuard {
        let counter = self.counter(space, part);
        counter.fetch_add(1, Ordering::AcqRel);
        InFlightGuard { counter }
    }

    /// Current in-flight write-processor request count for `(space, part)`.
    pub fn in_flight(&self, space: SpaceId, part: PartitionId) -> usize {
        self.counter(space, part).load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_partition_defaults_to_starting() {
        let table = IndexStateTable::new();
        assert_eq!(table.state(SpaceId::new(1), PartitionId::new(1)), IndexState::Starting);
    }

    #[test]
    fn state_transitions_are_observable() {
        let table = IndexStateTable::new();
        let key = (SpaceId::new(1), PartitionId::new(1));
        table.set_state(key.0, key.1, IndexState::Building);
        assert_eq!(table.state(key.0, key.1), IndexState::Building);
        table.set_state(key.0, key.1, IndexState::Locked);
        assert_eq!(table.state(key.0, key.1), IndexState::Locked);
    }

    #[test]
    fn in_flight_guard_decrements_on_drop() {
        let table = IndexStateTable::new();
        let key = (SpaceId::new(1), PartitionId::new(1));
        assert_eq!(table.in_flight(key.0, key.1), 0);
        let guard_a = table.begin_request(key.0, key.1);
        let guard_b = table.begin_request(key.0, key.1);
        assert_eq!(table.in_flight(key.0, key.1), 2);
        drop(guard_a);
        assert_eq!(table.in_flight(key.0, key.1), 1);
        drop(guard_b);
        assert_eq!(table.in_flight(key.0, key.1), 0);
    }
}
