//! The Raft collaborator seam (§4.2, §9).
//!
//! `Partition` does not implement consensus. It is driven by an external
//! Raft layer that proposes log entries, replicates them to a quorum, and
//! then calls back into `commit_logs`/`commit_snapshot` once an entry (or a
//! full snapshot) is safe to apply. [`RaftHandle`] is that seam: the
//! partition asks it "am I the leader, and what term is it", and reports
//! membership changes observed while pre-processing a log so the Raft layer
//! can update its own peer set in lockstep.
//!
//! [`LocalRaftHandle`] is the single-node mock used by tests and by any
//! deployment that runs one replica per partition: it is always the leader
//! of whatever term it starts at, and it accepts membership changes without
//! validating them against a quorum.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use graphstore_core::wire::HostAddr;
use graphstore_core::TermId;

/// The external consensus collaborator a [`crate::Partition`] is driven by.
pub trait RaftHandle: Send + Sync {
    /// Whether this node currently believes it is the partition's leader.
    fn is_leader(&self) -> bool;

    /// The term this node believes is current.
    fn term(&self) -> TermId;

    /// Record that `host` was added as a voting peer, observed while
    /// pre-processing an `OP_ADD_PEER` log entry.
    fn add_peer(&self, host: HostAddr);

    /// Record that `host` was added as a non-voting learner.
    fn add_learner(&self, host: HostAddr);

    /// Record that `host` was removed as a peer.
    fn remove_peer(&self, host: HostAddr);

    /// Record a leadership transfer to `host`.
    fn trans_leader(&self, host: HostAddr);

    /// The current voting peer set, in the order they were added.
    fn peers(&self) -> Vec<HostAddr>;

    /// Whether this node's leader lease is still valid, i.e. enough time
    /// has passed since its last confirmed heartbeat round that a `get`
    /// can be answered locally without risking a stale read after a
    /// leadership change elsewhere. Used by `Store::check_leader`
    /// (`readFromFollower || (isLeader && leaseValid)`); a handle that
    /// never loses its lease (like [`LocalRaftHandle`]) can just return
    /// `true`.
    fn lease_valid(&self) -> bool {
        true
    }
}

/// Single-node mock: always the leader of a fixed term, tracking membership
/// changes in a plain `Vec` with no quorum validation. Used by tests and by
/// single-replica deployments where a full Raft group would be overkill.
pub struct LocalRaftHandle {
    term: AtomicU64,
    peers: Mutex<Vec<HostAddr>>,
}

impl LocalRaftHandle {
    /// A handle that is always the leader of `term`.
    pub fn new(term: TermId) -> Self {
        Self {
            term: AtomicU64::new(term),
            peers: Mutex::new(Vec::new()),
        }
    }
}

impl Default for LocalRaftHandle {
    fn default() -> Self {
        Self::new(1)
    }
}

impl RaftHandle for LocalRaftHandle {
    fn is_leader(&self) -> bool {
        true
    }

    fn term(&self) -> TermId {
        self.term.load(Ordering::Acquire)
    }

    fn add_peer(&self, host: HostAddr) {
        let mut peers = self.peers.lock();
        if !peers.contains(&host) {
            peers.push(host);
        }
    }

    fn add_learner(&self, _host: HostAddr) {
        // A single-node deployment has no voting quorum to extend with a
        // learner; nothing to track beyond the log record itself.
    }

    fn remove_peer(&self, host: HostAddr) {
        self.peers.lock().retain(|h| h != &host);
    }

    fn trans_leader(&self, _host: HostAddr) {
        // Always the leader regardless of the target; transfers are
        // recorded as committed log entries but do not change who leads.
    }

    fn peers(&self) -> Vec<HostAddr> {
        self.peers.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(ip: &str) -> HostAddr {
        HostAddr { ip: ip.into(), port: 9999 }
    }

    #[test]
    fn always_leader_of_its_configured_term() {
        let handle = LocalRaftHandle::new(7);
        assert!(handle.is_leader());
        assert_eq!(handle.term(), 7);
    }

    #[test]
    fn tracks_added_and_removed_peers() {
        let handle = LocalRaftHandle::default();
        handle.add_peer(host("10.0.0.1"));
        handle.add_peer(host("10.0.0.2"));
        assert_eq!(handle.peers().len(), 2);
        handle.remove_peer(host("10.0.0.1"));
        assert_eq!(handle.peers(), vec![host("10.0.0.2")]);
    }

    #[test]
    fn adding_the_same_peer_twice_is_idempotent() {
        let handle = LocalRaftHandle::default();
        handle.add_peer(host("10.0.0.1"));
        handle.add_peer(host("10.0.0.1"));
        assert_eq!(handle.peers().len(), 1);
    }
}
