//! Commit listeners (§4.2): a hook notified after each batch of log
//! entries or a snapshot chunk has been applied to the engine, used by
//! downstream consumers (a full-text index feed, a change-data-capture
//! sink) that want to observe committed writes without being on the
//! critical path of `commit_logs` itself.
//!
//! Kept as a trait with a default no-op implementation rather than baked
//! into `Partition`, mirroring the source's listener registration: a
//! partition may have zero or more listeners, and a listener that panics or
//! blocks should never be able to stall the commit path (the listener is
//! invoked after the batch is durably committed, never before).

use graphstore_core::wire::LogPayload;
use graphstore_core::{LogId, TermId};

/// Notified after a partition durably applies committed log entries or
/// snapshot rows.
pub trait Listener: Send + Sync {
    /// Called once per `commit_logs` call, after the batch has been
    /// written to the engine, with every payload that was applied (in
    /// order) and the id/term of the last entry in the batch.
    fn on_logs_committed(&self, payloads: &[LogPayload], last_log_id: LogId, last_log_term: TermId);

    /// Called once per `commit_snapshot` call that completes a partition's
    /// snapshot transfer (`finished == true`), with the number of rows
    /// applied across the whole transfer.
    fn on_snapshot_committed(&self, rows_applied: usize);

    /// Discard whatever the listener has accumulated and start fresh,
    /// called before a `REBUILD_FULLTEXT_INDEX` admin task starts feeding it
    /// a base scan, mirroring the source's `fulltext index` listener reset
    /// ahead of a rebuild.
    fn reset(&self) {}

    /// Called once a `REBUILD_FULLTEXT_INDEX` task has replayed every
    /// operation-log entry and the listener's view is caught up to the
    /// current leader term, letting a listener that buffers writes flush
    /// them and start applying new ones directly. Returns whether the
    /// listener has in fact caught up; the rebuild task polls this until it
    /// reports `true`.
    fn pursue_leader_done(&self) -> bool {
        true
    }
}

/// A listener that does nothing, used as the default when a partition has
/// no downstream consumer to notify.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl Listener for NoopListener {
    fn on_logs_committed(&self, _payloads: &[LogPayload], _last_log_id: LogId, _last_log_term: TermId) {}

    fn on_snapshot_committed(&self, _rows_applied: usize) {}
}

/// A listener that only counts calls and rows, used by tests to assert a
/// partition actually notified its listeners.
#[derive(Debug, Default)]
pub struct CountingListener {
    logs_calls: std::sync::atomic::AtomicUsize,
    rows_committed: std::sync::atomic::AtomicUsize,
    snapshot_calls: std::sync::atomic::AtomicUsize,
}

impl CountingListener {
    /// A fresh counter, all zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `on_logs_committed` was called.
    pub fn logs_calls(&self) -> usize {
        self.logs_calls.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Number of times `on_snapshot_committed` was called.
    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Total rows reported across every `on_snapshot_committed` call.
    pub fn rows_committed(&self) -> usize {
        self.rows_committed.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl Listener for CountingListener {
    fn on_logs_committed(&self, _payloads: &[LogPayload], _last_log_id: LogId, _last_log_term: TermId) {
        self.logs_calls.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    }

    fn on_snapshot_committed(&self, rows_applied: usize) {
        self.snapshot_calls.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        self.rows_committed.fetch_add(rows_applied, std::sync::atomic::Ordering::AcqRel);
    }
}
