//! `Partition`: the per-partition state machine driven by a [`RaftHandle`]
//! (§4.2). This is the layer that turns committed Raft log entries (or
//! snapshot rows) into KV engine mutations, tracks the commit marker used
//! to resume after a restart, and pre-processes membership-change entries
//! before they are counted toward quorum.
//!
//! Grounded in the source `Part`'s `preProcessLog`/`commitLogs`/
//! `commitSnapshot`/`putCommitMsg`. The source's `Part` receives committed
//! entries from a separately-running `RaftPart`; here, since the Raft layer
//! is a pluggable mock rather than a real multi-node consensus
//! implementation, `Partition` also owns the durable WAL and proposes its
//! own entries through `propose` (single-node: propose, pre-process, and
//! commit happen inline with no quorum wait).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use graphstore_core::key::{self, KeyType};
use graphstore_core::wire::{LogPayload, LogRecord};
use graphstore_core::{ClusterId, Error, LogId, PartitionId, Result, SpaceId, TermId};
use graphstore_concurrency::AtomicLogBuffer;
use graphstore_durability::{WalPolicy, WalWriter};
use graphstore_storage::KvEngine;

use crate::listener::Listener;
use crate::raft::RaftHandle;

/// One already-decided log entry, as delivered to [`Partition::commit_logs`]
/// by the Raft layer after it reaches quorum.
#[derive(Debug, Clone)]
pub struct CommitEntry {
    /// The entry's log id.
    pub log_id: LogId,
    /// The term it was proposed in.
    pub term: TermId,
    /// The decoded record.
    pub record: LogRecord,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The per-partition Raft-applied state machine.
pub struct Partition {
    space_id: SpaceId,
    part_id: PartitionId,
    cluster_id: ClusterId,
    engine: Arc<dyn KvEngine>,
    wal: Mutex<WalWriter>,
    log_buffer: AtomicLogBuffer,
    raft: Arc<dyn RaftHandle>,
    listeners: Vec<Arc<dyn Listener>>,
    blocking: AtomicBool,
    last_log_id: AtomicU64,
    last_log_term: AtomicU64,
    start_time_ms: u64,
}

impl Partition {
    /// Open (or create) a partition's WAL directory, register it with the
    /// engine, and recover `last_log_id`/`last_log_term` from the engine's
    /// persisted commit marker.
    pub fn open(
        space_id: SpaceId,
        part_id: PartitionId,
        cluster_id: ClusterId,
        engine: Arc<dyn KvEngine>,
        wal_dir: PathBuf,
        wal_policy: WalPolicy,
        raft: Arc<dyn RaftHandle>,
        listeners: Vec<Arc<dyn Listener>>,
    ) -> Result<Self> {
        engine.add_part(part_id)?;
        let wal = WalWriter::open(wal_dir, wal_policy)?;
        let (last_log_id, last_log_term) = match engine.get(&key::system_commit_key(part_id))? {
            Some(value) => key::decode_commit_marker(&value)?,
            None => (0, 0),
        };
        Ok(Self {
            space_id,
            part_id,
            cluster_id,
            engine,
            wal: Mutex::new(wal),
            log_buffer: AtomicLogBuffer::with_default_capacity(),
            raft,
            listeners,
            blocking: AtomicBool::new(false),
            last_log_id: AtomicU64::new(last_log_id),
            last_log_term: AtomicU64::new(last_log_term),
            start_time_ms: now_millis(),
        })
    }

    /// The space this partition belongs to.
    pub fn space_id(&self) -> SpaceId {
        self.space_id
    }

    /// This partition's id.
    pub fn part_id(&self) -> PartitionId {
        self.part_id
    }

    /// The KV engine backing this partition. Used by write processors and
    /// the index-rebuild task, which read engine state directly and (for
    /// rebuild) write to it directly, bypassing `propose` for mutations that
    /// are a deterministic function of already-committed data.
    pub fn engine(&self) -> &Arc<dyn KvEngine> {
        &self.engine
    }

    /// The last log id this partition has durably committed.
    pub fn last_log_id(&self) -> LogId {
        self.last_log_id.load(Ordering::Acquire)
    }

    /// The term of the last log id this partition has durably committed.
    pub fn last_log_term(&self) -> TermId {
        self.last_log_term.load(Ordering::Acquire)
    }

    /// Whether this partition currently rejects non-heartbeat proposals.
    pub fn is_write_blocking(&self) -> bool {
        self.blocking.load(Ordering::Acquire)
    }

    /// Whether this node currently believes it is this partition's leader,
    /// per the underlying `RaftHandle`.
    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// Whether this node's leader lease is still valid. Used by
    /// `Store::check_leader` (`readFromFollower || (isLeader && leaseValid)`).
    pub fn lease_valid(&self) -> bool {
        self.raft.lease_valid()
    }

    /// Block (or unblock) non-heartbeat writes, e.g. while a leadership
    /// transfer or space drop is in flight.
    pub fn set_write_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Release);
    }

    /// Pre-process a log entry before it is counted toward commit: absorb
    /// membership changes (`AddPeer`/`AddLearner`) into the Raft layer's
    /// peer set immediately, rather than waiting for `commit_logs`.
    ///
    /// A membership change whose log timestamp predates this node's own
    /// startup is skipped: it was already reflected in the peer set this
    /// node booted with, and reapplying it during WAL replay would be
    /// redundant (or, for a peer later removed, actively wrong).
    pub fn pre_process_log(&self, timestamp: u64, payload: &LogPayload) {
        match payload {
            LogPayload::AddPeer { host } if timestamp > self.start_time_ms => {
                self.raft.add_peer(host.clone());
            }
            LogPayload::AddLearner { host } if timestamp > self.start_time_ms => {
                self.raft.add_learner(host.clone());
            }
            _ => {}
        }
    }

    /// Propose one record as the current leader: assign it the next log id
    /// at the Raft layer's current term, append it to the WAL and the
    /// in-memory log buffer, pre-process it, and commit it in place.
    ///
    /// There is no quorum to wait on in a single-node deployment, so
    /// `propose` folds what would otherwise be three separate RPC legs
    /// (append, replicate, commit) into one call.
    pub fn propose(&self, payload: LogPayload, wait: bool) -> Result<LogId> {
        if !self.raft.is_leader() {
            return Err(Error::LeaderChanged(self.part_id));
        }
        if self.is_write_blocking() && !matches!(payload, LogPayload::Heartbeat) {
            return Err(Error::BlockingWrite(self.part_id));
        }

        let timestamp = now_millis();
        let term = self.raft.term();
        let log_id = self.last_log_id() + 1;
        let record = LogRecord { timestamp, payload };
        let encoded = record.encode();

        {
            let mut wal = self.wal.lock();
            wal.append(log_id, term, self.cluster_id, encoded.clone())?;
        }
        self.log_buffer.push_fields(log_id, term, self.cluster_id, encoded);

        self.pre_process_log(timestamp, &record.payload);
        self.commit_logs(
            &[CommitEntry { log_id, term, record }],
            wait,
        )?;
        Ok(log_id)
    }

    /// Apply a batch of already-decided log entries to the engine: build
    /// one [`graphstore_storage::WriteBatch`], persist the commit marker
    /// alongside it, and commit atomically.
    ///
    /// `AddPeer`/`AddLearner` entries are no-ops here: they already took
    /// effect in [`Partition::pre_process_log`]. `RemovePeer`/`TransLeader`
    /// are finalized here instead, since unlike additions they are safe to
    /// apply only once the entry is truly committed.
    pub fn commit_logs(&self, entries: &[CommitEntry], wait: bool) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut batch = self.engine.write_batch();
        let mut payloads = Vec::with_capacity(entries.len());
        let mut last_id = self.last_log_id();
        let mut last_term = self.last_log_term();

        for entry in entries {
            last_id = entry.log_id;
            last_term = entry.term;
            match &entry.record.payload {
                LogPayload::Heartbeat => {}
                LogPayload::Put { key, value } => {
                    batch.put(key.clone(), value.clone());
                }
                LogPayload::MultiPut { pairs } => {
                    for (k, v) in pairs {
                        batch.put(k.clone(), v.clone());
                    }
                }
                LogPayload::Remove { key } => {
                    batch.remove(key.clone());
                }
                LogPayload::MultiRemove { keys } => {
                    for k in keys {
                        batch.remove(k.clone());
                    }
                }
                LogPayload::RemoveRange { start, end } => {
                    batch.remove_range(start.clone(), end.clone());
                }
                LogPayload::BatchWrite { ops } => {
                    batch.extend(graphstore_storage::WriteBatch::from_ops(ops.clone()));
                }
                LogPayload::AddPeer { .. } | LogPayload::AddLearner { .. } => {}
                LogPayload::RemovePeer { host } => {
                    self.raft.remove_peer(host.clone());
                }
                LogPayload::TransLeader { host } => {
                    self.raft.trans_leader(host.clone());
                }
            }
            payloads.push(entry.record.payload.clone());
        }

        batch.put(
            key::system_commit_key(self.part_id),
            key::encode_commit_marker(last_id, last_term),
        );
        self.engine.commit_batch_write(batch, false, false, wait)?;

        self.last_log_id.store(last_id, Ordering::Release);
        self.last_log_term.store(last_term, Ordering::Release);
        for listener in &self.listeners {
            listener.on_logs_committed(&payloads, last_id, last_term);
        }
        Ok(())
    }

    /// Apply one chunk of snapshot rows received during snapshot transfer.
    /// Always committed with `wait = true`: a snapshot install must be
    /// durable before the caller reports progress back to the snapshot
    /// source, unlike a normal log commit which may return early.
    ///
    /// When `finished` is set, this is the last chunk: the commit marker
    /// is written alongside the rows so recovery resumes exactly where the
    /// snapshot left off.
    pub fn commit_snapshot(
        &self,
        rows: &[(Vec<u8>, Vec<u8>)],
        committed_log_id: LogId,
        committed_log_term: TermId,
        finished: bool,
    ) -> Result<()> {
        let mut batch = self.engine.write_batch();
        for (k, v) in rows {
            batch.put(k.clone(), v.clone());
        }
        if finished {
            batch.put(
                key::system_commit_key(self.part_id),
                key::encode_commit_marker(committed_log_id, committed_log_term),
            );
        }
        self.engine.commit_batch_write(batch, false, false, true)?;

        if finished {
            self.last_log_id.store(committed_log_id, Ordering::Release);
            self.last_log_term.store(committed_log_term, Ordering::Release);
        }
        for listener in &self.listeners {
            listener.on_snapshot_committed(rows.len());
        }
        Ok(())
    }

    /// Remove every key this partition owns (all six key-type prefixes),
    /// leaving its engine-level partition marker in place — used by
    /// `clearSpace`, which empties data but preserves directory structure.
    pub fn clear_data(&self) -> Result<()> {
        let mut batch = self.engine.write_batch();
        for prefix in key::all_type_prefixes(self.part_id) {
            let mut upper = prefix.to_vec();
            *upper.last_mut().unwrap() += 1;
            batch.remove_range(prefix.to_vec(), upper);
        }
        self.engine.commit_batch_write(batch, false, false, true)
    }

    /// Remove every key this partition owns (all six key-type prefixes)
    /// and unregister it from the engine, used when a partition is removed
    /// from this node entirely.
    pub fn clear_and_remove(&self) -> Result<()> {
        self.clear_data()?;
        self.engine.remove_part(self.part_id)?;
        Ok(())
    }

    /// Borrow this partition's key type used to tag operation-log
    /// replay entries scoped to it (see `graphstore_primitives`).
    pub fn operation_prefix(&self) -> Vec<u8> {
        key::operation_prefix(self.part_id)
    }

    /// The key type byte space reserved for this partition's system
    /// commit marker, exposed for admin tooling that wants to inspect it
    /// directly rather than through `last_log_id`/`last_log_term`.
    pub fn system_commit_key_type() -> KeyType {
        KeyType::SystemCommit
    }

    /// Delete whole WAL segments entirely below `threshold`, never the
    /// currently active one. `threshold` is normally the minimum log id
    /// still required by any follower or listener of this partition.
    pub fn clean_wal(&self, threshold: LogId) -> Result<usize> {
        let mut wal = self.wal.lock();
        Ok(wal.clean_wal(threshold)?)
    }
}
