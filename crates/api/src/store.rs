//! `Store`: the per-node facade (§4.1) that owns every space this node
//! hosts, routes requests to the right partition, and runs the background
//! threads (WAL cleaner, checkpoint backup, memory-pressure monitor) that
//! keep the rest of the core honest.
//!
//! Grounded in the teacher's `Store`/`NebulaStore`: two top-level maps keyed
//! by `SpaceId`, guarded by a reader-writer lock so concurrent reads never
//! block each other, with partition lifecycle driven by a registered
//! [`MetaClient`] callback rather than polled.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use graphstore_core::key;
use graphstore_core::wire::LogPayload;
use graphstore_core::{ClusterId, Error, PartitionId, Result, SpaceId};
use graphstore_durability::WalPolicy;
use graphstore_engine::{LocalRaftHandle, Partition, RaftHandle};
use graphstore_primitives::{AdminTaskManager, ScanCollector};
use graphstore_storage::{KvEngine, WriteBatch};

use crate::config::StoreConfig;
use crate::meta::{MembershipChange, MetaClient};

/// Status of one key in a [`Store::multi_get`] response: whether it is
/// carried as an error label or as ordinary success, distinct from whether
/// the value itself was found (a `multiGet` with `return_partial_result`
/// never errors; it only changes the status it reports alongside whatever
/// it found).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiGetStatus {
    /// Every requested key was found.
    Success,
    /// At least one requested key was missing, and the caller did not opt
    /// in to partial results via `return_partial_result`.
    PartialResult,
}

/// Response to [`Store::multi_get`]: the values that were found, in
/// request order, alongside a status describing whether anything was
/// missing.
#[derive(Debug, Clone)]
pub struct MultiGetResponse {
    /// Status describing whether every key was found.
    pub status: MultiGetStatus,
    /// `(key, value)` pairs for every key that existed, preserving the
    /// order keys were requested in.
    pub values: Vec<(Vec<u8>, Vec<u8>)>,
}

/// Result of [`Store::create_checkpoint`]: per-leader-partition last
/// applied log id/term alongside the checkpoint's on-disk location, so a
/// caller can correlate a checkpoint with the log position it represents.
#[derive(Debug, Clone)]
pub struct CheckpointPartitionInfo {
    /// The checkpointed partition.
    pub part_id: PartitionId,
    /// Its last committed log id at the moment of the checkpoint.
    pub last_log_id: u64,
    /// Its last committed log term at the moment of the checkpoint.
    pub last_log_term: u64,
}

/// Full result of a [`Store::create_checkpoint`] call.
#[derive(Debug, Clone)]
pub struct CheckpointInfo {
    /// Directory the checkpoint was written under.
    pub path: PathBuf,
    /// Per-partition commit position, one entry per partition this node
    /// leads (followers are not checkpointed; their state is caught up
    /// from the leader via snapshot transfer instead).
    pub partitions: Vec<CheckpointPartitionInfo>,
}

struct SpaceHandle {
    engines: Vec<Arc<dyn KvEngine>>,
    parts: RwLock<FxHashMap<PartitionId, Arc<Partition>>>,
    listeners: RwLock<FxHashMap<PartitionId, Vec<Arc<dyn graphstore_engine::Listener>>>>,
}

impl SpaceHandle {
    fn least_loaded_engine(&self) -> Arc<dyn KvEngine> {
        self.engines
            .iter()
            .min_by_key(|e| e.parts().len())
            .cloned()
            .unwrap_or_else(|| self.engines[0].clone())
    }
}

struct BackgroundHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl BackgroundHandle {
    fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

/// The per-node storage facade (§4.1). Owns every space hosted locally,
/// dispatches requests to the owning partition, and runs the background
/// WAL-cleaner / checkpoint-backup / memory-monitor threads for the
/// lifetime of the `Store`.
pub struct Store {
    config: StoreConfig,
    meta: Arc<dyn MetaClient>,
    spaces: RwLock<FxHashMap<SpaceId, SpaceHandle>>,
    admin: Arc<AdminTaskManager>,
    scan: ScanCollector,
    memory_exceeded: Arc<AtomicBool>,
    cluster_id: ClusterId,
    backgrounds: std::sync::Mutex<Vec<BackgroundHandle>>,
}

impl Store {
    /// Open a `Store` rooted at `config.data_paths`, driven by `meta`.
    ///
    /// Startup order mirrors the teacher's `NebulaStore::init`: scan every
    /// data path for `spaceId`-named directories, open each space found,
    /// reconcile the on-disk partition set against what `meta` currently
    /// reports (deleting directories for spaces `meta` no longer lists, iff
    /// `auto_remove_invalid_space`), then register the membership-change
    /// callback so future `addPart`/`removePart` calls are driven by
    /// cluster reconfiguration rather than another startup scan.
    pub fn open(config: StoreConfig, meta: Arc<dyn MetaClient>) -> Result<Arc<Self>> {
        let admin = Arc::new(AdminTaskManager::new(config.admin_threads, config.admin_queue_depth));
        let scan = ScanCollector::new(config.query_concurrently);
        let store = Arc::new(Self {
            config,
            meta: Arc::clone(&meta),
            spaces: RwLock::new(FxHashMap::default()),
            admin,
            scan,
            memory_exceeded: Arc::new(AtomicBool::new(false)),
            cluster_id: 1,
            backgrounds: std::sync::Mutex::new(Vec::new()),
        });

        store.scan_data_paths_at_startup()?;
        store.reconcile_against_meta()?;
        store.register_meta_listener(Arc::clone(&meta));
        store.spawn_background_threads();
        Ok(store)
    }

    fn scan_data_paths_at_startup(self: &Arc<Self>) -> Result<()> {
        for data_path in self.config.data_paths.clone() {
            let root = data_path.join("nebula");
            let entries = match fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(space_id) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
                    continue;
                };
                let space_id = SpaceId::new(space_id);
                self.open_space_at(space_id, &data_path)?;
                for part_id in self.discover_persisted_parts(space_id) {
                    self.add_part(space_id, part_id)?;
                }
            }
        }
        Ok(())
    }

    fn discover_persisted_parts(&self, space_id: SpaceId) -> Vec<PartitionId> {
        let spaces = self.spaces.read();
        let Some(handle) = spaces.get(&space_id) else { return Vec::new() };
        let mut parts: Vec<PartitionId> = handle.engines.iter().flat_map(|e| e.parts()).collect();
        parts.sort();
        parts.dedup();
        parts
    }

    fn reconcile_against_meta(self: &Arc<Self>) -> Result<()> {
        for space_id in self.meta.spaces() {
            let wanted: std::collections::HashSet<PartitionId> = self.meta.parts_for_space(space_id).into_iter().collect();
            self.open_space(space_id)?;
            let hosted = self.discover_persisted_parts(space_id);
            for part_id in &hosted {
                if !wanted.contains(part_id) {
                    self.remove_part(space_id, *part_id)?;
                }
            }
            for part_id in wanted {
                self.add_part(space_id, part_id)?;
            }
        }

        if self.config.auto_remove_invalid_space {
            let known: std::collections::HashSet<SpaceId> = self.meta.spaces().into_iter().collect();
            let hosted: Vec<SpaceId> = self.spaces.read().keys().copied().collect();
            for space_id in hosted {
                if !known.contains(&space_id) {
                    warn!(space = space_id.get(), "auto_remove_invalid_space: dropping space meta no longer lists");
                    self.delete_space_directories(space_id);
                    self.spaces.write().remove(&space_id);
                }
            }
        }
        Ok(())
    }

    fn register_meta_listener(self: &Arc<Self>, meta: Arc<dyn MetaClient>) {
        let weak: Weak<Store> = Arc::downgrade(self);
        meta.register_listener(Arc::new(move |change: MembershipChange| {
            let Some(store) = weak.upgrade() else { return };
            let result = match change {
                MembershipChange::AddPart { space, part } => store.add_part(space, part),
                MembershipChange::RemovePart { space, part } => store.remove_part(space, part),
            };
            if let Err(err) = result {
                warn!(?change, %err, "membership-change callback failed");
            }
        }));
    }

    fn spawn_background_threads(self: &Arc<Self>) {
        let mut handles = self.backgrounds.lock().unwrap();
        if self.config.clean_wal_interval_secs > 0 {
            handles.push(self.spawn_wal_cleaner());
        }
        if self.config.checkpoint_backup_interval_secs > 0 {
            handles.push(self.spawn_checkpoint_backup());
        }
        if self.config.check_memory_interval_secs > 0 {
            handles.push(self.spawn_memory_monitor());
        }
    }

    fn spawn_wal_cleaner(self: &Arc<Self>) -> BackgroundHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let weak: Weak<Store> = Arc::downgrade(self);
        let interval = Duration::from_secs(self.config.clean_wal_interval_secs);
        let flag = Arc::clone(&shutdown);
        let join = std::thread::Builder::new()
            .name("wal-cleaner".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(store) = weak.upgrade() else { break };
                    store.run_wal_cleaner_pass();
                }
            })
            .expect("spawning wal-cleaner thread");
        BackgroundHandle { shutdown, join: Some(join) }
    }

    fn run_wal_cleaner_pass(&self) {
        let ttl = self.config.wal_ttl_secs;
        let spaces = self.spaces.read();
        for handle in spaces.values() {
            let parts = handle.parts.read();
            for partition in parts.values() {
                // Threshold is the earliest log id still required by any
                // follower/listener; with no follower tracking in this
                // single-node deployment that reduces to "everything
                // already committed before the WAL's own TTL window",
                // i.e. clean purely by age.
                let threshold = partition.last_log_id().saturating_sub(1);
                let _ = ttl;
                if let Err(err) = partition.clean_wal(threshold) {
                    warn!(part = partition.part_id().get(), %err, "wal cleaner pass failed");
                }
            }
        }
    }

    fn spawn_checkpoint_backup(self: &Arc<Self>) -> BackgroundHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let weak: Weak<Store> = Arc::downgrade(self);
        let interval = Duration::from_secs(self.config.checkpoint_backup_interval_secs);
        let flag = Arc::clone(&shutdown);
        let join = std::thread::Builder::new()
            .name("checkpoint-backup".into())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    if flag.load(Ordering::Acquire) {
                        break;
                    }
                    let Some(store) = weak.upgrade() else { break };
                    let spaces: Vec<SpaceId> = store.spaces.read().keys().copied().collect();
                    for space_id in spaces {
                        if let Err(err) = store.create_checkpoint(space_id, "periodic") {
                            warn!(space = space_id.get(), %err, "periodic checkpoint backup failed");
                        }
                    }
                }
            })
            .expect("spawning checkpoint-backup thread");
        BackgroundHandle { shutdown, join: Some(join) }
    }

    fn spawn_memory_monitor(self: &Arc<Self>) -> BackgroundHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let interval = Duration::from_secs(self.config.check_memory_interval_secs);
        let flag = Arc::clone(&shutdown);
        let flag_ref = Arc::clone(&flag);
        let memory_exceeded = Arc::clone(&self.memory_exceeded);
        let ratio = self.config.system_memory_high_watermark_ratio;
        let join = std::thread::Builder::new()
            .name("memory-monitor".into())
            .spawn(move || {
                while !flag_ref.load(Ordering::Acquire) {
                    std::thread::sleep(interval);
                    if flag_ref.load(Ordering::Acquire) {
                        break;
                    }
                    let exceeded = sample_resident_set_ratio() > ratio;
                    memory_exceeded.store(exceeded, Ordering::Release);
                }
            })
            .expect("spawning memory-monitor thread");
        BackgroundHandle { shutdown: flag, join: Some(join) }
    }

    /// Whether the memory-pressure monitor currently believes this node is
    /// over its configured high watermark. Write processors consult this
    /// (via [`Store::admit_write`]) to fail fast rather than accept more
    /// load they cannot durably absorb.
    pub fn memory_exceeded(&self) -> bool {
        self.memory_exceeded.load(Ordering::Acquire)
    }

    /// Fail fast with [`Error::MemoryExceeded`] if the memory monitor has
    /// tripped; otherwise a no-op. Call before accepting a new write.
    pub fn admit_write(&self) -> Result<()> {
        if self.memory_exceeded() {
            return Err(Error::MemoryExceeded);
        }
        Ok(())
    }

    fn space_dir(&self, data_path: &Path, space_id: SpaceId) -> PathBuf {
        data_path.join("nebula").join(space_id.get().to_string())
    }

    fn open_space_at(&self, space_id: SpaceId, data_path: &Path) -> Result<()> {
        if self.spaces.read().contains_key(&space_id) {
            return Ok(());
        }
        let data_dir = self.space_dir(data_path, space_id).join("data");
        fs::create_dir_all(&data_dir)?;
        let engine: Arc<dyn KvEngine> = Arc::new(graphstore_storage::MemEngine::new());
        info!(space = space_id.get(), path = %data_dir.display(), "opened space engine");
        self.spaces.write().insert(
            space_id,
            SpaceHandle {
                engines: vec![engine],
                parts: RwLock::new(FxHashMap::default()),
                listeners: RwLock::new(FxHashMap::default()),
            },
        );
        Ok(())
    }

    /// Ensure `space_id` has an open engine on this node's first configured
    /// data path, creating its directory layout if this is the first time
    /// this space has been seen. Idempotent.
    pub fn open_space(&self, space_id: SpaceId) -> Result<()> {
        let data_path = self
            .config
            .data_paths
            .first()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("."));
        self.open_space_at(space_id, &data_path)
    }

    fn delete_space_directories(&self, space_id: SpaceId) {
        for data_path in &self.config.data_paths {
            let dir = self.space_dir(data_path, space_id);
            if let Err(err) = fs::remove_dir_all(&dir) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(space = space_id.get(), %err, "failed removing space directory");
                }
            }
        }
    }

    fn wal_dir(&self, space_id: SpaceId, part_id: PartitionId) -> PathBuf {
        let data_path = self.config.data_paths.first().cloned().unwrap_or_else(|| PathBuf::from("."));
        self.space_dir(&data_path, space_id).join("wal").join(part_id.get().to_string())
    }

    /// Add a partition to this node: open its WAL, register it with the
    /// least-loaded engine in its space, and recover its commit marker.
    /// Idempotent — re-adding an already-hosted partition is a no-op.
    pub fn add_part(&self, space_id: SpaceId, part_id: PartitionId) -> Result<()> {
        self.open_space(space_id)?;
        {
            let spaces = self.spaces.read();
            let handle = spaces.get(&space_id).ok_or(Error::SpaceNotFound(space_id))?;
            if handle.parts.read().contains_key(&part_id) {
                return Ok(());
            }
        }

        let wal_policy = WalPolicy {
            file_size: self.config.wal_file_size,
            buffer_size: self.config.wal_buffer_size,
            sync: self.config.wal_sync,
        };
        let wal_dir = self.wal_dir(space_id, part_id);
        fs::create_dir_all(&wal_dir)?;

        let (engine, listeners) = {
            let spaces = self.spaces.read();
            let handle = spaces.get(&space_id).ok_or(Error::SpaceNotFound(space_id))?;
            let engine = handle.least_loaded_engine();
            let listeners = handle.listeners.read().get(&part_id).cloned().unwrap_or_default();
            (engine, listeners)
        };

        let raft: Arc<dyn RaftHandle> = Arc::new(LocalRaftHandle::new(1));
        let partition = Partition::open(space_id, part_id, self.cluster_id, engine, wal_dir, wal_policy, raft, listeners)?;
        info!(space = space_id.get(), part = part_id.get(), "partition added");

        let spaces = self.spaces.read();
        let handle = spaces.get(&space_id).ok_or(Error::SpaceNotFound(space_id))?;
        handle.parts.write().insert(part_id, Arc::new(partition));
        Ok(())
    }

    /// Remove a partition from this node: clear its key range, unregister
    /// it from its engine, and drop the in-memory `Partition`. Idempotent.
    pub fn remove_part(&self, space_id: SpaceId, part_id: PartitionId) -> Result<()> {
        let partition = {
            let spaces = self.spaces.read();
            let Some(handle) = spaces.get(&space_id) else { return Ok(()) };
            handle.parts.write().remove(&part_id)
        };
        if let Some(partition) = partition {
            partition.clear_and_remove()?;
            info!(space = space_id.get(), part = part_id.get(), "partition removed");
        }
        Ok(())
    }

    /// Register a listener against `(space, part)`, taking effect the next
    /// time that partition is (re-)opened via [`Store::add_part`]. Used to
    /// wire a full-text-index feed onto a partition before it starts
    /// committing.
    pub fn register_listener(&self, space_id: SpaceId, part_id: PartitionId, listener: Arc<dyn graphstore_engine::Listener>) -> Result<()> {
        self.open_space(space_id)?;
        let spaces = self.spaces.read();
        let handle = spaces.get(&space_id).ok_or(Error::SpaceNotFound(space_id))?;
        handle.listeners.write().entry(part_id).or_default().push(listener);
        Ok(())
    }

    fn partition(&self, space_id: SpaceId, part_id: PartitionId) -> Result<Arc<Partition>> {
        let spaces = self.spaces.read();
        let handle = spaces.get(&space_id).ok_or(Error::SpaceNotFound(space_id))?;
        handle
            .parts
            .read()
            .get(&part_id)
            .cloned()
            .ok_or(Error::PartNotFound(space_id, part_id))
    }

    /// `readFromFollower || (isLeader && leaseValid)` (§4.1): whether a
    /// read may be served locally without risking staleness from an
    /// unnoticed leadership change.
    pub fn check_leader(&self, partition: &Partition, read_from_follower: bool) -> Result<()> {
        if read_from_follower {
            return Ok(());
        }
        if !partition.is_leader() {
            return Err(Error::LeaderChanged(partition.part_id()));
        }
        if !partition.lease_valid() {
            return Err(Error::LeaderLeaseFailed(partition.part_id()));
        }
        Ok(())
    }

    /// Point read of `key`. `E_KEY_NOT_FOUND` if absent.
    pub fn get(&self, space_id: SpaceId, part_id: PartitionId, key: &[u8], read_from_follower: bool) -> Result<Vec<u8>> {
        let partition = self.partition(space_id, part_id)?;
        self.check_leader(&partition, read_from_follower)?;
        partition.engine().get(key)?.ok_or(Error::KeyNotFound)
    }

    /// Point read of several keys at once. Never errors on a missing key:
    /// the response's `status` flags whether anything was missing, and
    /// `return_partial_result` only controls whether that's reported as
    /// `PartialResult` or (when the caller opted in) `Success`.
    pub fn multi_get(
        &self,
        space_id: SpaceId,
        part_id: PartitionId,
        keys: &[Vec<u8>],
        read_from_follower: bool,
        return_partial_result: bool,
    ) -> Result<MultiGetResponse> {
        let partition = self.partition(space_id, part_id)?;
        self.check_leader(&partition, read_from_follower)?;
        let mut values = Vec::with_capacity(keys.len());
        let mut missing = false;
        for key in keys {
            match partition.engine().get(key)? {
                Some(value) => values.push((key.clone(), value)),
                None => missing = true,
            }
        }
        if !missing {
            return Ok(MultiGetResponse { status: MultiGetStatus::Success, values });
        }
        // A caller that did not opt in to partial results gets the partial
        // status without the values that did resolve, so it cannot mistake
        // a partial read for a complete one by only checking `values`.
        if !return_partial_result {
            values.clear();
        }
        Ok(MultiGetResponse { status: MultiGetStatus::PartialResult, values })
    }

    /// Iterate `[start, end)`, materialized eagerly over a point-in-time
    /// snapshot (mirrors [`graphstore_primitives::scan`]'s choice to take a
    /// fresh snapshot per page rather than hold one across an unbounded
    /// caller-driven cursor lifetime).
    pub fn range(&self, space_id: SpaceId, part_id: PartitionId, start: &[u8], end: &[u8], read_from_follower: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let partition = self.partition(space_id, part_id)?;
        self.check_leader(&partition, read_from_follower)?;
        let snapshot = partition.engine().get_snapshot();
        let mut rows = Vec::new();
        let mut it = snapshot.range(start, end);
        while it.valid() {
            rows.push((it.key().to_vec(), it.value().to_vec()));
            it.next();
        }
        Ok(rows)
    }

    /// Iterate every key sharing `prefix`, optionally against a
    /// caller-acquired snapshot rather than the live state (`use_snapshot`).
    pub fn prefix(&self, space_id: SpaceId, part_id: PartitionId, prefix: &[u8], use_snapshot: bool, read_from_follower: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let partition = self.partition(space_id, part_id)?;
        self.check_leader(&partition, read_from_follower)?;
        let engine = partition.engine();
        let mut rows = Vec::new();
        if use_snapshot {
            let snapshot = engine.get_snapshot();
            let mut it = snapshot.prefix(prefix);
            while it.valid() {
                rows.push((it.key().to_vec(), it.value().to_vec()));
                it.next();
            }
        } else {
            let mut it = engine.prefix(prefix);
            while it.valid() {
                rows.push((it.key().to_vec(), it.value().to_vec()));
                it.next();
            }
        }
        Ok(rows)
    }

    /// Leader-only cursored scan across several partitions of one space,
    /// delegating to [`graphstore_primitives::ScanCollector`].
    pub fn scan(&self, space_id: SpaceId, request: &graphstore_primitives::ScanRequest, range_for: impl Fn(PartitionId) -> (Vec<u8>, Vec<u8>) + Sync) -> Result<graphstore_primitives::ScanResult> {
        let spaces = self.spaces.read();
        let handle = spaces.get(&space_id).ok_or(Error::SpaceNotFound(space_id))?;
        let parts = handle.parts.read();
        self.scan.scan(&parts, range_for, request)
    }

    /// Propose a single put as the current leader.
    pub fn async_multi_put(&self, space_id: SpaceId, part_id: PartitionId, pairs: Vec<(Vec<u8>, Vec<u8>)>, wait: bool) -> Result<()> {
        self.admit_write()?;
        let partition = self.partition(space_id, part_id)?;
        let payload = if pairs.len() == 1 {
            let (key, value) = pairs.into_iter().next().unwrap();
            LogPayload::Put { key, value }
        } else {
            LogPayload::MultiPut { pairs }
        };
        partition.propose(payload, wait)?;
        Ok(())
    }

    /// Propose removal of one or more keys as the current leader.
    pub fn async_remove(&self, space_id: SpaceId, part_id: PartitionId, keys: Vec<Vec<u8>>, wait: bool) -> Result<()> {
        self.admit_write()?;
        let partition = self.partition(space_id, part_id)?;
        let payload = if keys.len() == 1 {
            LogPayload::Remove { key: keys.into_iter().next().unwrap() }
        } else {
            LogPayload::MultiRemove { keys }
        };
        partition.propose(payload, wait)?;
        Ok(())
    }

    /// Propose a `[start, end)` range removal as the current leader.
    pub fn async_remove_range(&self, space_id: SpaceId, part_id: PartitionId, start: Vec<u8>, end: Vec<u8>, wait: bool) -> Result<()> {
        self.admit_write()?;
        let partition = self.partition(space_id, part_id)?;
        partition.propose(LogPayload::RemoveRange { start, end }, wait)?;
        Ok(())
    }

    /// Run `op` against a read-only view of the partition's current state
    /// to produce a batch, then propose that batch as one atomic
    /// `OP_BATCH_WRITE` entry. `op` may be re-invoked by the caller if this
    /// returns [`Error::RaftAtomicOpFailed`] — it must be idempotent or
    /// safely re-derivable from the (unchanged, on failure) engine state.
    pub fn async_atomic_op(
        &self,
        space_id: SpaceId,
        part_id: PartitionId,
        wait: bool,
        op: impl FnOnce(&dyn KvEngine) -> Result<WriteBatch>,
    ) -> Result<()> {
        self.admit_write()?;
        let partition = self.partition(space_id, part_id)?;
        if !partition.is_leader() {
            return Err(Error::LeaderChanged(part_id));
        }
        let batch = op(partition.engine().as_ref()).map_err(|e| Error::RaftAtomicOpFailed(e.to_string()))?;
        if batch.is_empty() {
            return Ok(());
        }
        partition.propose(LogPayload::BatchWrite { ops: batch.into_ops() }, wait)?;
        Ok(())
    }

    /// Bulk-load every `.sst` file found under `<space>/download/<part>/`
    /// into the matching partition's engine, deleting each file as it is
    /// successfully adopted (mirrors the teacher's `ingest` cleanup of its
    /// staging directory).
    pub fn ingest(&self, space_id: SpaceId) -> Result<()> {
        let part_ids: Vec<PartitionId> = {
            let spaces = self.spaces.read();
            let handle = spaces.get(&space_id).ok_or(Error::SpaceNotFound(space_id))?;
            handle.parts.read().keys().copied().collect()
        };
        for part_id in part_ids {
            self.ingest_partition(space_id, part_id)?;
        }
        Ok(())
    }

    fn ingest_partition(&self, space_id: SpaceId, part_id: PartitionId) -> Result<()> {
        let partition = self.partition(space_id, part_id)?;
        for data_path in &self.config.data_paths {
            let download_dir = self.space_dir(data_path, space_id).join("download").join(part_id.get().to_string());
            let Ok(entries) = fs::read_dir(&download_dir) else { continue };
            let files: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().map(|ext| ext == "sst").unwrap_or(false))
                .collect();
            if files.is_empty() {
                continue;
            }
            partition.engine().ingest(&files, true)?;
            for file in files {
                let _ = fs::remove_file(file);
            }
        }
        Ok(())
    }

    /// Create a named checkpoint: a full snapshot of every leader
    /// partition's engine state under `<space>/checkpoints/<name>/data/`,
    /// plus a hard-linked copy of each such partition's WAL directory and
    /// its last committed log position.
    pub fn create_checkpoint(&self, space_id: SpaceId, name: &str) -> Result<CheckpointInfo> {
        let data_path = self.config.data_paths.first().cloned().unwrap_or_else(|| PathBuf::from("."));
        let checkpoint_dir = self.space_dir(&data_path, space_id).join("checkpoints").join(name);
        let data_dir = checkpoint_dir.join("data");
        fs::create_dir_all(&data_dir).map_err(|e| Error::FailedToCheckpoint(e.to_string()))?;

        let spaces = self.spaces.read();
        let handle = spaces.get(&space_id).ok_or(Error::SpaceNotFound(space_id))?;
        for (idx, engine) in handle.engines.iter().enumerate() {
            let path = data_dir.join(format!("engine-{idx}.sst"));
            engine.create_checkpoint(&path).map_err(|e| Error::FailedToCheckpoint(e.to_string()))?;
        }

        let mut partitions = Vec::new();
        for (part_id, partition) in handle.parts.read().iter() {
            if !partition.is_leader() {
                continue;
            }
            let wal_src = self.wal_dir(space_id, *part_id);
            let wal_dst = checkpoint_dir.join("wal").join(part_id.get().to_string());
            fs::create_dir_all(&wal_dst).map_err(|e| Error::FailedToCheckpoint(e.to_string()))?;
            if let Ok(entries) = fs::read_dir(&wal_src) {
                for entry in entries.flatten() {
                    let dst = wal_dst.join(entry.file_name());
                    if fs::hard_link(entry.path(), &dst).is_err() {
                        let _ = fs::copy(entry.path(), &dst);
                    }
                }
            }
            partitions.push(CheckpointPartitionInfo {
                part_id: *part_id,
                last_log_id: partition.last_log_id(),
                last_log_term: partition.last_log_term(),
            });
        }
        debug!(space = space_id.get(), name, partitions = partitions.len(), "checkpoint created");
        Ok(CheckpointInfo { path: checkpoint_dir, partitions })
    }

    /// Delete every row owned by every partition of `space_id`, preserving
    /// directory structure and partition membership (distinct from
    /// removing the space entirely).
    pub fn clear_space(&self, space_id: SpaceId) -> Result<()> {
        let spaces = self.spaces.read();
        let handle = spaces.get(&space_id).ok_or(Error::SpaceNotFound(space_id))?;
        for partition in handle.parts.read().values() {
            partition.clear_data()?;
        }
        info!(space = space_id.get(), "space cleared");
        Ok(())
    }

    /// Toggle write-blocking on every partition of `space_id` (only
    /// heartbeats replicate while blocked).
    pub fn set_write_blocking(&self, space_id: SpaceId, blocking: bool) -> Result<()> {
        let spaces = self.spaces.read();
        let handle = spaces.get(&space_id).ok_or(Error::SpaceNotFound(space_id))?;
        for partition in handle.parts.read().values() {
            partition.set_write_blocking(blocking);
        }
        Ok(())
    }

    /// Every engine hosting `space_id`, for admin tasks (`COMPACT`/
    /// `FLUSH`) that operate per engine rather than per partition.
    pub fn engines_for_space(&self, space_id: SpaceId) -> Result<Vec<Arc<dyn KvEngine>>> {
        let spaces = self.spaces.read();
        let handle = spaces.get(&space_id).ok_or(Error::SpaceNotFound(space_id))?;
        Ok(handle.engines.clone())
    }

    /// Every partition this node currently hosts for `space_id`.
    pub fn partitions_for_space(&self, space_id: SpaceId) -> Result<Vec<Arc<Partition>>> {
        let spaces = self.spaces.read();
        let handle = spaces.get(&space_id).ok_or(Error::SpaceNotFound(space_id))?;
        Ok(handle.parts.read().values().cloned().collect())
    }

    /// Borrow one partition directly, e.g. to hand to a write processor or
    /// the index-rebuild task, which operate on `&Partition`/`Arc<Partition>`
    /// rather than going through `Store`'s own request-shaped methods.
    pub fn get_partition(&self, space_id: SpaceId, part_id: PartitionId) -> Result<Arc<Partition>> {
        self.partition(space_id, part_id)
    }

    /// Handle to the admin task manager backing `COMPACT`/`FLUSH`/
    /// `REBUILD_*`/`STATS` (§4.6).
    pub fn admin(&self) -> &Arc<AdminTaskManager> {
        &self.admin
    }

    /// This node's configuration, as passed to [`Store::open`].
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Shut down every background thread and the admin task manager,
    /// blocking until all have exited. Safe to call once; subsequent calls
    /// are no-ops since the thread list is drained.
    pub fn shutdown(&self) {
        let handles: Vec<BackgroundHandle> = std::mem::take(&mut *self.backgrounds.lock().unwrap());
        for handle in handles {
            handle.stop();
        }
        self.admin.shutdown();
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let handles: Vec<BackgroundHandle> = std::mem::take(&mut *self.backgrounds.lock().unwrap());
        for handle in handles {
            handle.stop();
        }
    }
}

/// Best-effort resident-set-to-total-memory ratio, used by the
/// memory-pressure monitor. Reads `/proc/self/status` and `/proc/meminfo`
/// on Linux; falls back to `0.0` (never trips the watermark) on any
/// platform or read failure, matching the source's documented fail-open
/// stance for an ambient monitor that must never itself become a
/// correctness dependency.
fn sample_resident_set_ratio() -> f64 {
    let vm_rss_kb = read_proc_field("/proc/self/status", "VmRSS:");
    let mem_total_kb = read_proc_field("/proc/meminfo", "MemTotal:");
    match (vm_rss_kb, mem_total_kb) {
        (Some(rss), Some(total)) if total > 0.0 => rss / total,
        _ => 0.0,
    }
}

fn read_proc_field(path: &str, label: &str) -> Option<f64> {
    let contents = fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix(label) {
            return rest.split_whitespace().next()?.parse::<f64>().ok();
        }
    }
    None
}
