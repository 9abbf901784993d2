//! Online index rebuild (§4.7), the five-step protocol: legacy cleanup,
//! `Building` + operation-log writes (handled by
//! [`crate::write_processors::mutate_index`] via [`IndexStateTable`]), base
//! scan, operation-log replay, `Locked` drain, `Finished`.
//!
//! Grounded in `examples/original_source/src/storage/admin/RebuildIndexTask.cpp`'s
//! `processTagRebuild`/`processEdgeRebuild`: the base scan derives an index
//! key per row via `IndexKeyUtils`, flushes on a byte-size threshold through
//! a rate limiter, then the replay loop drains the operation log until two
//! consecutive passes come back empty, locking writers out in between.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use graphstore_core::key::{self, KeyType};
use graphstore_core::{EdgeType, Error, Result, TagId, VertexId};
use graphstore_concurrency::TokenBucket;
use graphstore_engine::Partition;
use graphstore_storage::{EngineIterator, KvEngine};

use crate::index_state::{IndexState, IndexStateTable};
use crate::operation_log::{decode_operation_entry, OperationEntry};
use crate::schema::{encode_field_values_ordered, project_index_fields, FieldValue, IndexDef};
use crate::write_processors::RowCodec;

/// Tunables for one rebuild subtask (`rebuildBatchSize`/`rebuildPartRateLimit`, §4.7 step 3).
#[derive(Debug, Clone, Copy)]
pub struct RebuildConfig {
    /// Flush the accumulated batch once its approximate size exceeds this
    /// many bytes. Default 128 KiB.
    pub batch_size_bytes: usize,
    /// Token-bucket rate for flushed bytes, bytes/sec. Default 512 KiB/s.
    pub rate_limit_bytes_per_sec: f64,
    /// How long to sleep between polls of the in-flight writer count while
    /// draining into `Locked`.
    pub drain_poll_interval: Duration,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            batch_size_bytes: 128 * 1024,
            rate_limit_bytes_per_sec: 512.0 * 1024.0,
            drain_poll_interval: Duration::from_millis(20),
        }
    }
}

fn vid_from_tag_key(key: &[u8], vid_len: usize) -> VertexId {
    VertexId::Bytes(key[4..4 + vid_len].to_vec())
}

fn tag_id_from_tag_key(key: &[u8]) -> TagId {
    TagId::new(BigEndian::read_u32(&key[key.len() - 4..]))
}

fn ttl_value_for(def: &IndexDef, fields: &[FieldValue]) -> Vec<u8> {
    match def.ttl_field_offset {
        Some(offset) => fields
            .get(offset)
            .map(|f| encode_field_values_ordered(std::slice::from_ref(f)))
            .unwrap_or_default(),
        None => Vec::new(),
    }
}

/// Rebuild one tag index against a partition's current data, online.
pub fn rebuild_tag_index(
    partition: &Partition,
    index_state: &IndexStateTable,
    codec: &dyn RowCodec,
    def: &IndexDef,
    vid_len: usize,
    canceled: &AtomicBool,
    config: RebuildConfig,
) -> Result<()> {
    let tag_id = def.tag_id.expect("rebuild_tag_index requires a tag-scoped IndexDef");
    let part_id = partition.part_id();
    let space = partition.space_id();

    cleanup_legacy_operation_log(partition)?;
    index_state.set_state(space, part_id, IndexState::Building);

    base_scan(partition, config, canceled, KeyType::Tag, |key| {
        if tag_id_from_tag_key(key) != tag_id {
            return Ok(None);
        }
        let value = partition.engine().get(key)?.unwrap_or_default();
        let fields = codec.decode_fields(&value)?;
        let vid = vid_from_tag_key(key, vid_len);
        let projected = project_index_fields(def, &fields)?;
        let encoded = encode_field_values_ordered(&projected);
        let index_key = key::tag_index_key(part_id, def.index_id, &encoded, &vid, vid_len)?;
        Ok(Some((index_key, ttl_value_for(def, &fields))))
    })?;

    replay_operation_log(partition, index_state, canceled, config)?;

    index_state.set_state(space, part_id, IndexState::Finished);
    Ok(())
}

/// Rebuild one edge index against a partition's current data, online.
pub fn rebuild_edge_index(
    partition: &Partition,
    index_state: &IndexStateTable,
    codec: &dyn RowCodec,
    def: &IndexDef,
    edge_type: EdgeType,
    vid_len: usize,
    canceled: &AtomicBool,
    config: RebuildConfig,
) -> Result<()> {
    let part_id = partition.part_id();
    let space = partition.space_id();

    cleanup_legacy_operation_log(partition)?;
    index_state.set_state(space, part_id, IndexState::Building);

    base_scan(partition, config, canceled, KeyType::Edge, |key| {
        let (src, row_type, rank, dst) = key::decode_edge_key(key, vid_len)?;
        if row_type != edge_type {
            return Ok(None);
        }
        let value = partition.engine().get(key)?.unwrap_or_default();
        if value.is_empty() {
            // The in-edge mirror row carries no payload; only the
            // out-edge row's fields are indexed.
            return Ok(None);
        }
        let fields = codec.decode_fields(&value)?;
        let projected = project_index_fields(def, &fields)?;
        let encoded = encode_field_values_ordered(&projected);
        let index_key = key::edge_index_key(part_id, def.index_id, &encoded, &src, rank, &dst, vid_len)?;
        Ok(Some((index_key, ttl_value_for(def, &fields))))
    })?;

    replay_operation_log(partition, index_state, canceled, config)?;

    index_state.set_state(space, part_id, IndexState::Finished);
    Ok(())
}

fn cleanup_legacy_operation_log(partition: &Partition) -> Result<()> {
    let part_id = partition.part_id();
    let prefix = key::operation_prefix(part_id);
    let mut upper = prefix.clone();
    *upper.last_mut().unwrap() += 1;
    let mut batch = partition.engine().write_batch();
    batch.remove_range(prefix, upper);
    partition.engine().commit_batch_write(batch, false, false, true)
}

/// Step 3: scan every row of `key_type` in the partition, deriving an
/// index entry via `derive` (returning `None` to skip rows outside the
/// index's schema), flushing a batch once it exceeds
/// `config.batch_size_bytes` under a rate limiter.
fn base_scan(
    partition: &Partition,
    config: RebuildConfig,
    canceled: &AtomicBool,
    key_type: KeyType,
    mut derive: impl FnMut(&[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>,
) -> Result<()> {
    let prefix = key::prefix(partition.part_id(), key_type);
    let mut bucket = TokenBucket::new();
    let mut batch = partition.engine().write_batch();

    let mut it = partition.engine().prefix(&prefix);
    while it.valid() {
        if canceled.load(Ordering::Acquire) {
            return Err(Error::UserCanceled);
        }
        if let Some((index_key, index_value)) = derive(it.key())? {
            batch.put(index_key, index_value);
        }
        it.next();

        if batch.approx_size_bytes() >= config.batch_size_bytes {
            flush_batch(partition, &mut bucket, &mut batch, config)?;
        }
    }
    if !batch.is_empty() {
        flush_batch(partition, &mut bucket, &mut batch, config)?;
    }
    Ok(())
}

fn flush_batch(
    partition: &Partition,
    bucket: &mut TokenBucket,
    batch: &mut graphstore_storage::WriteBatch,
    config: RebuildConfig,
) -> Result<()> {
    let size = batch.approx_size_bytes() as f64;
    bucket.consume(size, config.rate_limit_bytes_per_sec, config.rate_limit_bytes_per_sec);
    let taken = std::mem::replace(batch, partition.engine().write_batch());
    partition.engine().commit_batch_write(taken, false, false, true)
}

/// One operation-log replay pass: scans the current operation-log prefix
/// (a point-in-time view), applies each entry plus removes it from the log
/// in the same flushed batch, and reports how many entries it saw — used
/// by the caller to decide whether the queue has drained.
fn replay_pass(partition: &Partition, config: RebuildConfig) -> Result<usize> {
    let part_id = partition.part_id();
    let mut bucket = TokenBucket::new();
    let mut batch = partition.engine().write_batch();
    let mut seen = 0usize;

    let mut it = partition.engine().prefix(&key::operation_prefix(part_id));
    while it.valid() {
        let op_key = it.key().to_vec();
        let op_value = it.value().to_vec();
        match decode_operation_entry(&op_key, &op_value)? {
            OperationEntry::Modify { index_key } => {
                batch.put(index_key, Vec::new());
            }
            OperationEntry::Delete { index_key } => {
                batch.remove(index_key);
            }
        }
        batch.remove(op_key);
        seen += 1;
        it.next();

        if batch.approx_size_bytes() >= config.batch_size_bytes {
            flush_batch(partition, &mut bucket, &mut batch, config)?;
        }
    }
    if !batch.is_empty() {
        flush_batch(partition, &mut bucket, &mut batch, config)?;
    }
    Ok(seen)
}

/// Steps 4-5: replay the operation log to convergence, drain in-flight
/// writers under `Locked`, and replay once more before declaring the
/// rebuild caught up. The caller transitions to `Finished` afterward.
fn replay_operation_log(
    partition: &Partition,
    index_state: &IndexStateTable,
    canceled: &AtomicBool,
    config: RebuildConfig,
) -> Result<()> {
    let space = partition.space_id();
    let part_id = partition.part_id();
    let mut locked = false;

    loop {
        if canceled.load(Ordering::Acquire) {
            return Err(Error::UserCanceled);
        }
        let seen = replay_pass(partition, config)?;
        let drained = seen == 0;

        if drained && locked {
            return Ok(());
        }
        if drained && !locked {
            index_state.set_state(space, part_id, IndexState::Locked);
            locked = true;
            while index_state.in_flight(space, part_id) > 0 {
                if canceled.load(Ordering::Acquire) {
                    return Err(Error::UserCanceled);
                }
                std::thread::sleep(config.drain_poll_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphstore_core::{IndexId, PartitionId, SpaceId};
    use graphstore_durability::WalPolicy;
    use graphstore_engine::LocalRaftHandle;
    use graphstore_storage::MemEngine;

    struct IntCodec;
    impl RowCodec for IntCodec {
        fn decode_fields(&self, raw: &[u8]) -> Result<Vec<FieldValue>> {
            Ok(vec![FieldValue::Int(i64::from_be_bytes(raw.try_into().unwrap()))])
        }
    }

    fn open_partition(dir: &std::path::Path) -> Partition {
        let engine: Arc<dyn graphstore_storage::KvEngine> = Arc::new(MemEngine::new());
        let raft = Arc::new(LocalRaftHandle::new(1));
        Partition::open(SpaceId::new(1), PartitionId::new(1), 1, engine, dir.to_path_buf(), WalPolicy::for_testing(), raft, vec![]).unwrap()
    }

    fn put_tag_row(partition: &Partition, vid: &str, tag: TagId, value: i64) {
        let key = key::tag_key(partition.part_id(), &VertexId::Bytes(vid.as_bytes().to_vec()), 8, tag).unwrap();
        let mut batch = partition.engine().write_batch();
        batch.put(key, value.to_be_bytes().to_vec());
        partition.engine().commit_batch_write(batch, false, false, true).unwrap();
    }

    #[test]
    fn base_scan_indexes_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let partition = open_partition(dir.path());
        let tag = TagId::new(1);
        put_tag_row(&partition, "a", tag, 10);
        put_tag_row(&partition, "b", tag, 20);

        let index_state = IndexStateTable::new();
        let def = IndexDef { index_id: IndexId::new(7), tag_id: Some(tag), fields: vec![crate::schema::IndexField { field_offset: 0 }], ttl_field_offset: None };
        let canceled = AtomicBool::new(false);
        rebuild_tag_index(&partition, &index_state, &IntCodec, &def, 8, &canceled, RebuildConfig::default()).unwrap();

        assert_eq!(index_state.state(partition.space_id(), partition.part_id()), IndexState::Finished);

        let expected_a = key::tag_index_key(
            partition.part_id(),
            def.index_id,
            &encode_field_values_ordered(&[FieldValue::Int(10)]),
            &VertexId::Bytes(b"a\0\0\0\0\0\0\0".to_vec()),
            8,
        )
        .unwrap();
        assert_eq!(partition.engine().get(&expected_a).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn writes_during_building_are_replayed_into_index() {
        use crate::write_processors::{AddVerticesProcessor, VertexWrite, WriteContext};

        let dir = tempfile::tempdir().unwrap();
        let partition = open_partition(dir.path());
        let tag = TagId::new(1);
        put_tag_row(&partition, "a", tag, 10);

        let index_state = IndexStateTable::new();
        // Simulate a concurrent writer by driving the Building transition
        // ourselves and issuing a write through the normal write-processor
        // path before the rebuild's base scan/replay run.
        index_state.set_state(partition.space_id(), partition.part_id(), IndexState::Building);

        let mut ctx = WriteContext::new(8, Box::new(IntCodec));
        let def = IndexDef { index_id: IndexId::new(7), tag_id: Some(tag), fields: vec![crate::schema::IndexField { field_offset: 0 }], ttl_field_offset: None };
        ctx.catalog.add_tag_index(tag, def.clone());
        let concurrent_write = VertexWrite { vid: VertexId::Bytes(b"b".to_vec()), tag_id: tag, value: 99i64.to_be_bytes().to_vec() };
        AddVerticesProcessor.apply(&partition, &ctx, vec![concurrent_write], false, true).unwrap();

        index_state.set_state(partition.space_id(), partition.part_id(), IndexState::Starting);
        let canceled = AtomicBool::new(false);
        rebuild_tag_index(&partition, &index_state, &IntCodec, &def, 8, &canceled, RebuildConfig::default()).unwrap();

        let expected_b = key::tag_index_key(
            partition.part_id(),
            def.index_id,
            &encode_field_values_ordered(&[FieldValue::Int(99)]),
            &VertexId::Bytes(b"b\0\0\0\0\0\0\0".to_vec()),
            8,
        )
        .unwrap();
        assert_eq!(partition.engine().get(&expected_b).unwrap(), Some(Vec::new()), "operation log entry from the Building-state write must be replayed");
    }

    #[test]
    fn cancellation_during_base_scan_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let partition = open_partition(dir.path());
        let tag = TagId::new(1);
        for i in 0..10 {
            put_tag_row(&partition, &format!("v{i}"), tag, i);
        }
        let index_state = IndexStateTable::new();
        let def = IndexDef { index_id: IndexId::new(1), tag_id: Some(tag), fields: vec![crate::schema::IndexField { field_offset: 0 }], ttl_field_offset: None };
        let canceled = AtomicBool::new(true);
        let err = rebuild_tag_index(&partition, &index_state, &IntCodec, &def, 8, &canceled, RebuildConfig::default()).unwrap_err();
        assert!(matches!(err, Error::UserCanceled));
    }
}
