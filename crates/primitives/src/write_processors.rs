//! Write processors: transactional mutation + index maintenance (§4.8).
//!
//! Each processor locks the rows it touches via a striped [`MemLock`],
//! reads whatever prior state it needs to compute stale index keys,
//! assembles one [`WriteBatch`], and commits it through
//! [`Partition::propose`] as a single `OP_BATCH_WRITE` entry — the "atomic
//! operation" of §4.8 collapses into a single-node `propose` call here,
//! since there is no separate Raft leg to bridge a callback across.
//!
//! Edges are stored as a pair of rows per the source's dual in/out
//! convention (`graphstore_core::ids::EdgeType::reversed`): an out-edge row
//! `(src, edgeType, rank, dst)` carrying the real value, and an in-edge
//! mirror `(dst, -edgeType, rank, src)` carrying an empty value, so that a
//! prefix scan keyed by either endpoint's VID finds every edge touching it
//! in one pass.

use std::collections::HashSet;

use byteorder::{BigEndian, ByteOrder};
use rustc_hash::FxHashMap;

use graphstore_core::key::{self, KeyType};
use graphstore_core::wire::LogPayload;
use graphstore_core::{EdgeType, Error, PartitionId, Result, TagId, VertexId};
use graphstore_engine::Partition;
use graphstore_storage::{EngineIterator, KvEngine, WriteBatch};
use graphstore_concurrency::MemLock;

use crate::index_state::{IndexState, IndexStateTable};
use crate::operation_log::{encode_delete_entry, encode_modify_entry, OperationClock};
use crate::schema::{encode_field_values_ordered, project_index_fields, FieldValue, IndexDef};

/// Decodes a row's raw stored bytes into the field values an index might
/// project from it. The row codec itself (schema registry, column layout)
/// is an external collaborator (§1); this is the minimum surface a write
/// processor needs from it.
pub trait RowCodec: Send + Sync {
    /// Decode `raw` into its field-value tuple, in schema column order.
    fn decode_fields(&self, raw: &[u8]) -> Result<Vec<FieldValue>>;
}

/// Maps tag/edge types to the index definitions that cover them.
#[derive(Default)]
pub struct IndexCatalog {
    tag_indexes: FxHashMap<TagId, Vec<IndexDef>>,
    edge_indexes: FxHashMap<EdgeType, Vec<IndexDef>>,
}

impl IndexCatalog {
    /// An empty catalog (no indexes defined).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `def` against `tag_id`.
    pub fn add_tag_index(&mut self, tag_id: TagId, def: IndexDef) {
        self.tag_indexes.entry(tag_id).or_default().push(def);
    }

    /// Register `def` against `edge_type` (the outbound/positive direction).
    pub fn add_edge_index(&mut self, edge_type: EdgeType, def: IndexDef) {
        self.edge_indexes.entry(edge_type).or_default().push(def);
    }

    /// Index definitions covering `tag_id`, if any.
    pub fn tag_indexes(&self, tag_id: TagId) -> &[IndexDef] {
        self.tag_indexes.get(&tag_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Index definitions covering `edge_type` (looked up by its outbound
    /// form regardless of the sign the caller passes).
    pub fn edge_indexes(&self, edge_type: EdgeType) -> &[IndexDef] {
        let outbound = if edge_type.is_outbound() { edge_type } else { edge_type.reversed() };
        self.edge_indexes.get(&outbound).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Shared state every write processor needs: lock tables, rebuild state,
/// the operation clock, the index catalog and the row codec.
pub struct WriteContext {
    /// Striped lock table over both tag and edge keys (distinct `KeyType`
    /// prefixes never collide, so one table suffices for both).
    pub locks: MemLock<Vec<u8>>,
    /// Per-`(space, part)` index-rebuild state.
    pub index_state: IndexStateTable,
    /// Monotonic timestamp source for operation-log entries.
    pub clock: OperationClock,
    /// Tag/edge → index definitions.
    pub catalog: IndexCatalog,
    /// Row codec used to project index fields out of stored row bytes.
    pub codec: Box<dyn RowCodec>,
    /// The space's configured VID width.
    pub vid_len: usize,
}

impl WriteContext {
    /// Construct a context with no indexes defined; indexes are added via
    /// [`IndexCatalog::add_tag_index`]/[`IndexCatalog::add_edge_index`]
    /// after construction.
    pub fn new(vid_len: usize, codec: Box<dyn RowCodec>) -> Self {
        Self {
            locks: MemLock::new(),
            index_state: IndexStateTable::new(),
            clock: OperationClock::new(),
            catalog: IndexCatalog::new(),
            codec,
            vid_len,
        }
    }
}

/// Emit the index-key mutations implied by replacing `old_key` with
/// `new_key` for one index, honoring the partition's current rebuild
/// state (§4.7 step 2): direct mutation when not rebuilding, operation-log
/// entries while `Building`, hard failure while `Locked`.
fn mutate_index(
    batch: &mut WriteBatch,
    part_id: PartitionId,
    state: IndexState,
    clock: &OperationClock,
    old_key: Option<&[u8]>,
    new_key: Option<&[u8]>,
) -> Result<()> {
    match state {
        IndexState::Locked => Err(Error::DataConflict("index rebuild is draining; write rejected".into())),
        IndexState::Building => {
            if let Some(k) = old_key {
                let (entry_key, entry_value) = encode_delete_entry(part_id, clock.next(), k);
                batch.put(entry_key, entry_value);
            }
            if let Some(k) = new_key {
                let (entry_key, entry_value) = encode_modify_entry(part_id, clock.next(), k);
                batch.put(entry_key, entry_value);
            }
            Ok(())
        }
        IndexState::Starting | IndexState::Finished => {
            if let Some(k) = old_key {
                batch.remove(k.to_vec());
            }
            if let Some(k) = new_key {
                batch.put(k.to_vec(), Vec::new());
            }
            Ok(())
        }
    }
}

fn tag_index_key_for(def: &IndexDef, fields: &[FieldValue], vid: &VertexId, vid_len: usize, part_id: PartitionId) -> Result<Vec<u8>> {
    let projected = project_index_fields(def, fields)?;
    let encoded = encode_field_values_ordered(&projected);
    key::tag_index_key(part_id, def.index_id, &encoded, vid, vid_len)
}

fn edge_index_key_for(
    def: &IndexDef,
    fields: &[FieldValue],
    src: &VertexId,
    rank: i64,
    dst: &VertexId,
    vid_len: usize,
    part_id: PartitionId,
) -> Result<Vec<u8>> {
    let projected = project_index_fields(def, fields)?;
    let encoded = encode_field_values_ordered(&projected);
    key::edge_index_key(part_id, def.index_id, &encoded, src, rank, dst, vid_len)
}

/// Reconcile old/new tag-index keys for one row's affected indexes into
/// `batch`, skipping indexes whose key did not change.
fn apply_tag_index_deltas(
    batch: &mut WriteBatch,
    ctx: &WriteContext,
    part_id: PartitionId,
    state: IndexState,
    vid: &VertexId,
    tag_id: TagId,
    old_fields: Option<&[FieldValue]>,
    new_fields: Option<&[FieldValue]>,
) -> Result<()> {
    for def in ctx.catalog.tag_indexes(tag_id) {
        let old_key = old_fields.map(|f| tag_index_key_for(def, f, vid, ctx.vid_len, part_id)).transpose()?;
        let new_key = new_fields.map(|f| tag_index_key_for(def, f, vid, ctx.vid_len, part_id)).transpose()?;
        if old_key == new_key {
            continue;
        }
        mutate_index(batch, part_id, state, &ctx.clock, old_key.as_deref(), new_key.as_deref())?;
    }
    Ok(())
}

fn dedup_keep_first_or_last<T, K: Eq + std::hash::Hash>(rows: Vec<T>, if_not_exists: bool, key_of: impl Fn(&T) -> K) -> Vec<T> {
    if !if_not_exists {
        return rows;
    }
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if seen.insert(key_of(&row)) {
            out.push(row);
        }
    }
    out
}

/// One vertex tag write: the VID/tag being written and the row's encoded
/// bytes (schema-specific, opaque to this layer).
pub struct VertexWrite {
    /// Target vertex.
    pub vid: VertexId,
    /// Target tag.
    pub tag_id: TagId,
    /// Encoded row bytes.
    pub value: Vec<u8>,
}

/// `AddVertices` (§4.8): inserts or overwrites tag rows, maintaining every
/// index defined over the affected tags.
pub struct AddVerticesProcessor;

impl AddVerticesProcessor {
    /// Apply `rows` to `partition`. `if_not_exists`, when true, drops any
    /// row whose `(vid, tag_id)` already has a stored value — the *first*
    /// occurrence within `rows` wins when several share a key; otherwise
    /// the *last* wins (§8 boundary behavior).
    pub fn apply(&self, partition: &Partition, ctx: &WriteContext, rows: Vec<VertexWrite>, if_not_exists: bool, wait: bool) -> Result<()> {
        let rows = dedup_keep_first_or_last(rows, if_not_exists, |r| (r.vid.clone(), r.tag_id));
        if rows.is_empty() {
            return Ok(());
        }

        let space = partition.space_id();
        let part_id = partition.part_id();
        let _in_flight = ctx.index_state.begin_request(space, part_id);
        let state = ctx.index_state.state(space, part_id);

        let keys = rows
            .iter()
            .map(|r| key::tag_key(part_id, &r.vid, ctx.vid_len, r.tag_id))
            .collect::<Result<Vec<_>>>()?;
        let _guard = ctx
            .locks
            .try_lock_all(keys.clone())
            .ok_or_else(|| Error::DataConflict("vertex write conflicted with an in-flight writer".into()))?;

        let mut batch = partition.engine().write_batch();
        // A later row in the same request that shares a key with an earlier
        // one must see the earlier row's value as "existing", not whatever
        // was committed before this call started — otherwise both rows
        // would derive their old index keys from the same stale row and
        // leave an orphan entry for the one that doesn't win (§8, "last
        // wins" boundary behavior).
        let mut staged: FxHashMap<&[u8], &[u8]> = FxHashMap::default();
        for (row, tag_key) in rows.iter().zip(keys.iter()) {
            let existing = match staged.get(tag_key.as_slice()) {
                Some(v) => Some(v.to_vec()),
                None => partition.engine().get(tag_key)?,
            };
            if if_not_exists && existing.is_some() {
                continue;
            }
            let new_fields = ctx.codec.decode_fields(&row.value)?;
            let old_fields = existing.as_deref().map(|v| ctx.codec.decode_fields(v)).transpose()?;
            apply_tag_index_deltas(
                &mut batch,
                ctx,
                part_id,
                state,
                &row.vid,
                row.tag_id,
                old_fields.as_deref(),
                Some(&new_fields),
            )?;
            batch.put(tag_key.clone(), row.value.clone());
            staged.insert(tag_key.as_slice(), row.value.as_slice());
        }

        partition.propose(LogPayload::BatchWrite { ops: batch.into_ops() }, wait)?;
        Ok(())
    }
}

/// `UpdateVertex` (§4.8): like [`AddVerticesProcessor`], but `insertable`
/// controls whether a row with no existing value is inserted (`true`) or
/// silently dropped (`false`) — the spec leaves exact upsert semantics
/// open; this is the resolution recorded in `DESIGN.md`.
pub struct UpdateVertexProcessor;

impl UpdateVertexProcessor {
    /// Apply one vertex update.
    pub fn apply(&self, partition: &Partition, ctx: &WriteContext, row: VertexWrite, insertable: bool, wait: bool) -> Result<()> {
        let space = partition.space_id();
        let part_id = partition.part_id();
        let _in_flight = ctx.index_state.begin_request(space, part_id);
        let state = ctx.index_state.state(space, part_id);

        let tag_key = key::tag_key(part_id, &row.vid, ctx.vid_len, row.tag_id)?;
        let _guard = ctx
            .locks
            .try_lock_all(vec![tag_key.clone()])
            .ok_or_else(|| Error::DataConflict("vertex write conflicted with an in-flight writer".into()))?;

        let existing = partition.engine().get(&tag_key)?;
        if existing.is_none() && !insertable {
            return Ok(());
        }

        let mut batch = partition.engine().write_batch();
        let new_fields = ctx.codec.decode_fields(&row.value)?;
        let old_fields = existing.as_deref().map(|v| ctx.codec.decode_fields(v)).transpose()?;
        apply_tag_index_deltas(&mut batch, ctx, part_id, state, &row.vid, row.tag_id, old_fields.as_deref(), Some(&new_fields))?;
        batch.put(tag_key, row.value);

        partition.propose(LogPayload::BatchWrite { ops: batch.into_ops() }, wait)?;
        Ok(())
    }
}

/// `DeleteTags` (§4.8): removes specific `(vid, tag_id)` rows (not the
/// whole vertex).
pub struct DeleteTagsProcessor;

impl DeleteTagsProcessor {
    /// Delete the given `(vid, tag_id)` pairs.
    pub fn apply(&self, partition: &Partition, ctx: &WriteContext, targets: Vec<(VertexId, TagId)>, wait: bool) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let space = partition.space_id();
        let part_id = partition.part_id();
        let _in_flight = ctx.index_state.begin_request(space, part_id);
        let state = ctx.index_state.state(space, part_id);

        let keys = targets
            .iter()
            .map(|(vid, tag_id)| key::tag_key(part_id, vid, ctx.vid_len, *tag_id))
            .collect::<Result<Vec<_>>>()?;
        let _guard = ctx
            .locks
            .try_lock_all(keys.clone())
            .ok_or_else(|| Error::DataConflict("tag delete conflicted with an in-flight writer".into()))?;

        let mut batch = partition.engine().write_batch();
        for ((vid, tag_id), tag_key) in targets.iter().zip(keys.iter()) {
            if let Some(existing) = partition.engine().get(tag_key)? {
                let old_fields = ctx.codec.decode_fields(&existing)?;
                apply_tag_index_deltas(&mut batch, ctx, part_id, state, vid, *tag_id, Some(&old_fields), None)?;
                batch.remove(tag_key.clone());
            }
        }

        partition.propose(LogPayload::BatchWrite { ops: batch.into_ops() }, wait)?;
        Ok(())
    }
}

/// One edge write: both endpoints, the edge type and rank (outbound/
/// positive direction as supplied by the caller), and the row bytes.
pub struct EdgeWrite {
    /// Source vertex.
    pub src: VertexId,
    /// Edge type, outbound (positive) direction.
    pub edge_type: EdgeType,
    /// Rank (disambiguates parallel edges between the same endpoints).
    pub rank: i64,
    /// Destination vertex.
    pub dst: VertexId,
    /// Encoded row bytes.
    pub value: Vec<u8>,
}

fn edge_row_keys(ctx: &WriteContext, part_id: PartitionId, w: &EdgeWrite) -> Result<(Vec<u8>, Vec<u8>)> {
    let out_key = key::edge_key(part_id, &w.src, w.edge_type, w.rank, &w.dst, ctx.vid_len)?;
    let in_key = key::edge_key(part_id, &w.dst, w.edge_type.reversed(), w.rank, &w.src, ctx.vid_len)?;
    Ok((out_key, in_key))
}

/// `AddEdges` (§4.8): writes both the out-edge row and its in-edge mirror,
/// maintaining every index defined over the edge type.
pub struct AddEdgesProcessor;

impl AddEdgesProcessor {
    /// Apply `rows`. `if_not_exists`, when true, drops any row whose
    /// out-edge key already has a stored value; first occurrence wins
    /// among duplicates in `rows`, else last.
    pub fn apply(&self, partition: &Partition, ctx: &WriteContext, rows: Vec<EdgeWrite>, if_not_exists: bool, wait: bool) -> Result<()> {
        let part_id = partition.part_id();
        let rows = dedup_keep_first_or_last(rows, if_not_exists, |w| {
            key::edge_key(part_id, &w.src, w.edge_type, w.rank, &w.dst, ctx.vid_len).unwrap_or_default()
        });
        if rows.is_empty() {
            return Ok(());
        }

        let space = partition.space_id();
        let _in_flight = ctx.index_state.begin_request(space, part_id);
        let state = ctx.index_state.state(space, part_id);

        let mut lock_keys = Vec::with_capacity(rows.len() * 2);
        let mut row_keys = Vec::with_capacity(rows.len());
        for row in &rows {
            let (out_key, in_key) = edge_row_keys(ctx, part_id, row)?;
            lock_keys.push(out_key.clone());
            lock_keys.push(in_key.clone());
            row_keys.push((out_key, in_key));
        }
        let _guard = ctx
            .locks
            .try_lock_all(lock_keys)
            .ok_or_else(|| Error::DataConflict("edge write conflicted with an in-flight writer".into()))?;

        let mut batch = partition.engine().write_batch();
        // Same staged-overlay reasoning as `AddVerticesProcessor::apply`:
        // duplicate out-edge keys within one request must chain through
        // each other's staged value rather than all reading the same
        // pre-batch "existing" row.
        let mut staged: FxHashMap<&[u8], &[u8]> = FxHashMap::default();
        for (row, (out_key, in_key)) in rows.iter().zip(row_keys.iter()) {
            let existing = match staged.get(out_key.as_slice()) {
                Some(v) => Some(v.to_vec()),
                None => partition.engine().get(out_key)?,
            };
            if if_not_exists && existing.is_some() {
                continue;
            }
            let new_fields = ctx.codec.decode_fields(&row.value)?;
            let old_fields = existing.as_deref().map(|v| ctx.codec.decode_fields(v)).transpose()?;
            for def in ctx.catalog.edge_indexes(row.edge_type) {
                let new_key = edge_index_key_for(def, &new_fields, &row.src, row.rank, &row.dst, ctx.vid_len, part_id)?;
                let old_key = old_fields
                    .as_ref()
                    .map(|f| edge_index_key_for(def, f, &row.src, row.rank, &row.dst, ctx.vid_len, part_id))
                    .transpose()?;
                if old_key.as_deref() == Some(new_key.as_slice()) {
                    continue;
                }
                mutate_index(&mut batch, part_id, state, &ctx.clock, old_key.as_deref(), Some(&new_key))?;
            }
            batch.put(out_key.clone(), row.value.clone());
            batch.put(in_key.clone(), Vec::new());
            staged.insert(out_key.as_slice(), row.value.as_slice());
        }

        partition.propose(LogPayload::BatchWrite { ops: batch.into_ops() }, wait)?;
        Ok(())
    }
}

/// `UpdateEdge` (§4.8): like [`AddEdgesProcessor`] for one edge, with an
/// `insertable` upsert flag mirroring [`UpdateVertexProcessor`].
pub struct UpdateEdgeProcessor;

impl UpdateEdgeProcessor {
    /// Apply one edge update.
    pub fn apply(&self, partition: &Partition, ctx: &WriteContext, row: EdgeWrite, insertable: bool, wait: bool) -> Result<()> {
        let part_id = partition.part_id();
        let space = partition.space_id();
        let _in_flight = ctx.index_state.begin_request(space, part_id);
        let state = ctx.index_state.state(space, part_id);

        let (out_key, in_key) = edge_row_keys(ctx, part_id, &row)?;
        let _guard = ctx
            .locks
            .try_lock_all(vec![out_key.clone(), in_key.clone()])
            .ok_or_else(|| Error::DataConflict("edge write conflicted with an in-flight writer".into()))?;

        let existing = partition.engine().get(&out_key)?;
        if existing.is_none() && !insertable {
            return Ok(());
        }

        let mut batch = partition.engine().write_batch();
        let new_fields = ctx.codec.decode_fields(&row.value)?;
        let old_fields = existing.as_deref().map(|v| ctx.codec.decode_fields(v)).transpose()?;
        for def in ctx.catalog.edge_indexes(row.edge_type) {
            let new_key = edge_index_key_for(def, &new_fields, &row.src, row.rank, &row.dst, ctx.vid_len, part_id)?;
            let old_key = old_fields
                .as_ref()
                .map(|f| edge_index_key_for(def, f, &row.src, row.rank, &row.dst, ctx.vid_len, part_id))
                .transpose()?;
            if old_key.as_deref() == Some(new_key.as_slice()) {
                continue;
            }
            mutate_index(&mut batch, part_id, state, &ctx.clock, old_key.as_deref(), Some(&new_key))?;
        }
        batch.put(out_key, row.value);
        batch.put(in_key, Vec::new());

        partition.propose(LogPayload::BatchWrite { ops: batch.into_ops() }, wait)?;
        Ok(())
    }
}

/// One edge deletion target, identified the same way as an [`EdgeWrite`]
/// minus its value.
pub struct EdgeDelete {
    /// Source vertex.
    pub src: VertexId,
    /// Edge type, outbound (positive) direction.
    pub edge_type: EdgeType,
    /// Rank.
    pub rank: i64,
    /// Destination vertex.
    pub dst: VertexId,
}

/// `DeleteEdges` (§4.8): removes both rows of each targeted edge and its
/// index entries.
pub struct DeleteEdgesProcessor;

impl DeleteEdgesProcessor {
    /// Delete the given edges.
    pub fn apply(&self, partition: &Partition, ctx: &WriteContext, targets: Vec<EdgeDelete>, wait: bool) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let part_id = partition.part_id();
        let space = partition.space_id();
        let _in_flight = ctx.index_state.begin_request(space, part_id);
        let state = ctx.index_state.state(space, part_id);

        let mut lock_keys = Vec::with_capacity(targets.len() * 2);
        let mut row_keys = Vec::with_capacity(targets.len());
        for t in &targets {
            let out_key = key::edge_key(part_id, &t.src, t.edge_type, t.rank, &t.dst, ctx.vid_len)?;
            let in_key = key::edge_key(part_id, &t.dst, t.edge_type.reversed(), t.rank, &t.src, ctx.vid_len)?;
            lock_keys.push(out_key.clone());
            lock_keys.push(in_key.clone());
            row_keys.push((out_key, in_key));
        }
        let _guard = ctx
            .locks
            .try_lock_all(lock_keys)
            .ok_or_else(|| Error::DataConflict("edge delete conflicted with an in-flight writer".into()))?;

        let mut batch = partition.engine().write_batch();
        for (t, (out_key, in_key)) in targets.iter().zip(row_keys.iter()) {
            if let Some(existing) = partition.engine().get(out_key)? {
                let old_fields = ctx.codec.decode_fields(&existing)?;
                for def in ctx.catalog.edge_indexes(t.edge_type) {
                    let old_key = edge_index_key_for(def, &old_fields, &t.src, t.rank, &t.dst, ctx.vid_len, part_id)?;
                    mutate_index(&mut batch, part_id, state, &ctx.clock, Some(&old_key), None)?;
                }
                batch.remove(out_key.clone());
                batch.remove(in_key.clone());
            }
        }

        partition.propose(LogPayload::BatchWrite { ops: batch.into_ops() }, wait)?;
        Ok(())
    }
}

/// `DeleteVertices` (§4.8, extended per `DESIGN.md`): removes every tag
/// row and every edge touching the vertex (cascading to both rows of each
/// edge), plus the vertex-existence marker if present.
pub struct DeleteVerticesProcessor;

impl DeleteVerticesProcessor {
    /// Delete the given vertices and everything attached to them.
    pub fn apply(&self, partition: &Partition, ctx: &WriteContext, vids: Vec<VertexId>, wait: bool) -> Result<()> {
        if vids.is_empty() {
            return Ok(());
        }
        let part_id = partition.part_id();
        let space = partition.space_id();
        let _in_flight = ctx.index_state.begin_request(space, part_id);
        let state = ctx.index_state.state(space, part_id);

        let mut batch = partition.engine().write_batch();
        let mut removed_edge_keys: HashSet<Vec<u8>> = HashSet::new();

        for vid in &vids {
            let vid_bytes = vid.encode(ctx.vid_len)?;

            let tag_prefix = {
                let mut p = key::prefix(part_id, KeyType::Tag).to_vec();
                p.extend_from_slice(&vid_bytes);
                p
            };
            let mut tag_rows = Vec::new();
            {
                let mut it = partition.engine().prefix(&tag_prefix);
                while it.valid() {
                    tag_rows.push((it.key().to_vec(), it.value().to_vec()));
                    it.next();
                }
            }
            for (tag_key, value) in tag_rows {
                if tag_key.len() < 4 {
                    continue;
                }
                let tag_id = TagId::new(byteorder::BigEndian::read_u32(&tag_key[tag_key.len() - 4..]));
                let old_fields = ctx.codec.decode_fields(&value)?;
                apply_tag_index_deltas(&mut batch, ctx, part_id, state, vid, tag_id, Some(&old_fields), None)?;
                batch.remove(tag_key);
            }

            let edge_prefix = {
                let mut p = key::prefix(part_id, KeyType::Edge).to_vec();
                p.extend_from_slice(&vid_bytes);
                p
            };
            let mut edge_rows = Vec::new();
            {
                let mut it = partition.engine().prefix(&edge_prefix);
                while it.valid() {
                    edge_rows.push((it.key().to_vec(), it.value().to_vec()));
                    it.next();
                }
            }
            for (edge_key_bytes, value) in edge_rows {
                if !removed_edge_keys.insert(edge_key_bytes.clone()) {
                    continue;
                }
                let (row_src, row_type, rank, row_dst) = key::decode_edge_key(&edge_key_bytes, ctx.vid_len)?;
                let mirror_key = key::edge_key(part_id, &row_dst, row_type.reversed(), rank, &row_src, ctx.vid_len)?;
                removed_edge_keys.insert(mirror_key.clone());

                if row_type.is_outbound() && !value.is_empty() {
                    let old_fields = ctx.codec.decode_fields(&value)?;
                    for def in ctx.catalog.edge_indexes(row_type) {
                        let old_index_key = edge_index_key_for(def, &old_fields, &row_src, rank, &row_dst, ctx.vid_len, part_id)?;
                        mutate_index(&mut batch, part_id, state, &ctx.clock, Some(&old_index_key), None)?;
                    }
                }
                batch.remove(edge_key_bytes);
                batch.remove(mirror_key);
            }

            batch.remove(key::vertex_key(part_id, vid, ctx.vid_len)?);
        }

        partition.propose(LogPayload::BatchWrite { ops: batch.into_ops() }, wait)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphstore_engine::LocalRaftHandle;
    use graphstore_durability::WalPolicy;
    use graphstore_storage::MemEngine;
    use graphstore_core::SpaceId;
    use std::sync::Arc;

    struct JsonRowCodec;

    impl RowCodec for JsonRowCodec {
        fn decode_fields(&self, raw: &[u8]) -> Result<Vec<FieldValue>> {
            // Test rows are a single encoded int field for simplicity.
            if raw.len() != 8 {
                return Err(Error::InvalidFieldValue("expected 8-byte int row".into()));
            }
            let v = i64::from_be_bytes(raw.try_into().unwrap());
            Ok(vec![FieldValue::Int(v)])
        }
    }

    fn open_partition(dir: &std::path::Path) -> Partition {
        let engine: Arc<dyn graphstore_storage::KvEngine> = Arc::new(MemEngine::new());
        let raft = Arc::new(LocalRaftHandle::new(1));
        Partition::open(SpaceId::new(1), graphstore_core::PartitionId::new(1), 1, engine, dir.to_path_buf(), WalPolicy::for_testing(), raft, vec![]).unwrap()
    }

    fn ctx_with_tag_index(tag: TagId) -> WriteContext {
        let mut ctx = WriteContext::new(8, Box::new(JsonRowCodec));
        ctx.catalog.add_tag_index(
            tag,
            IndexDef { index_id: graphstore_core::IndexId::new(1), tag_id: Some(tag), fields: vec![crate::schema::IndexField { field_offset: 0 }], ttl_field_offset: None },
        );
        ctx
    }

    #[test]
    fn add_vertices_writes_row_and_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let partition = open_partition(dir.path());
        let tag = TagId::new(1);
        let ctx = ctx_with_tag_index(tag);

        let vid = VertexId::Bytes(b"alice".to_vec());
        let row = VertexWrite { vid: vid.clone(), tag_id: tag, value: 42i64.to_be_bytes().to_vec() };
        AddVerticesProcessor.apply(&partition, &ctx, vec![row], false, true).unwrap();

        let tag_key = key::tag_key(partition.part_id(), &vid, 8, tag).unwrap();
        assert_eq!(partition.engine().get(&tag_key).unwrap(), Some(42i64.to_be_bytes().to_vec()));

        let expected_index_key = tag_index_key_for(
            &IndexDef { index_id: graphstore_core::IndexId::new(1), tag_id: Some(tag), fields: vec![crate::schema::IndexField { field_offset: 0 }], ttl_field_offset: None },
            &[FieldValue::Int(42)],
            &vid,
            8,
            partition.part_id(),
        )
        .unwrap();
        assert_eq!(partition.engine().get(&expected_index_key).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn add_vertices_if_not_exists_keeps_first_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let partition = open_partition(dir.path());
        let tag = TagId::new(1);
        let ctx = ctx_with_tag_index(tag);

        let vid = VertexId::Bytes(b"bob".to_vec());
        let rows = vec![
            VertexWrite { vid: vid.clone(), tag_id: tag, value: 1i64.to_be_bytes().to_vec() },
            VertexWrite { vid: vid.clone(), tag_id: tag, value: 2i64.to_be_bytes().to_vec() },
        ];
        AddVerticesProcessor.apply(&partition, &ctx, rows, true, true).unwrap();

        let tag_key = key::tag_key(partition.part_id(), &vid, 8, tag).unwrap();
        assert_eq!(partition.engine().get(&tag_key).unwrap(), Some(1i64.to_be_bytes().to_vec()));
    }

    #[test]
    fn add_vertices_duplicate_keys_without_if_not_exists_leave_no_orphan_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let partition = open_partition(dir.path());
        let tag = TagId::new(1);
        let ctx = ctx_with_tag_index(tag);
        let def = IndexDef { index_id: graphstore_core::IndexId::new(1), tag_id: Some(tag), fields: vec![crate::schema::IndexField { field_offset: 0 }], ttl_field_offset: None };

        let vid = VertexId::Bytes(b"dave".to_vec());
        let rows = vec![
            VertexWrite { vid: vid.clone(), tag_id: tag, value: 1i64.to_be_bytes().to_vec() },
            VertexWrite { vid: vid.clone(), tag_id: tag, value: 2i64.to_be_bytes().to_vec() },
        ];
        AddVerticesProcessor.apply(&partition, &ctx, rows, false, true).unwrap();

        let tag_key = key::tag_key(partition.part_id(), &vid, 8, tag).unwrap();
        assert_eq!(partition.engine().get(&tag_key).unwrap(), Some(2i64.to_be_bytes().to_vec()), "later row in the same request wins the data row");

        let stale_index_key = tag_index_key_for(&def, &[FieldValue::Int(1)], &vid, 8, partition.part_id()).unwrap();
        assert_eq!(partition.engine().get(&stale_index_key).unwrap(), None, "the first row's index entry must not survive as an orphan");

        let live_index_key = tag_index_key_for(&def, &[FieldValue::Int(2)], &vid, 8, partition.part_id()).unwrap();
        assert_eq!(partition.engine().get(&live_index_key).unwrap(), Some(Vec::new()), "the winning row's index entry must be present");
    }

    #[test]
    fn building_state_emits_operation_log_instead_of_direct_index_write() {
        let dir = tempfile::tempdir().unwrap();
        let partition = open_partition(dir.path());
        let tag = TagId::new(1);
        let ctx = ctx_with_tag_index(tag);
        ctx.index_state.set_state(partition.space_id(), partition.part_id(), IndexState::Building);

        let vid = VertexId::Bytes(b"carol".to_vec());
        let row = VertexWrite { vid: vid.clone(), tag_id: tag, value: 7i64.to_be_bytes().to_vec() };
        AddVerticesProcessor.apply(&partition, &ctx, vec![row], false, true).unwrap();

        let expected_index_key = tag_index_key_for(
            &IndexDef { index_id: graphstore_core::IndexId::new(1), tag_id: Some(tag), fields: vec![crate::schema::IndexField { field_offset: 0 }], ttl_field_offset: None },
            &[FieldValue::Int(7)],
            &vid,
            8,
            partition.part_id(),
        )
        .unwrap();
        assert_eq!(partition.engine().get(&expected_index_key).unwrap(), None, "index should not be mutated directly while Building");

        let mut op_count = 0;
        let mut it = partition.engine().prefix(&key::operation_prefix(partition.part_id()));
        while it.valid() {
            op_count += 1;
            it.next();
        }
        assert_eq!(op_count, 1);
    }

    #[test]
    fn locked_state_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let partition = open_partition(dir.path());
        let tag = TagId::new(1);
        let ctx = ctx_with_tag_index(tag);
        ctx.index_state.set_state(partition.space_id(), partition.part_id(), IndexState::Locked);

        let vid = VertexId::Bytes(b"dave".to_vec());
        let row = VertexWrite { vid, tag_id: tag, value: 1i64.to_be_bytes().to_vec() };
        let err = AddVerticesProcessor.apply(&partition, &ctx, vec![row], false, true).unwrap_err();
        assert!(matches!(err, Error::DataConflict(_)));
    }

    #[test]
    fn add_edges_writes_both_rows() {
        let dir = tempfile::tempdir().unwrap();
        let partition = open_partition(dir.path());
        let ctx = WriteContext::new(8, Box::new(JsonRowCodec));

        let src = VertexId::Bytes(b"a".to_vec());
        let dst = VertexId::Bytes(b"b".to_vec());
        let edge_type = EdgeType::new(5);
        let row = EdgeWrite { src: src.clone(), edge_type, rank: 0, dst: dst.clone(), value: 9i64.to_be_bytes().to_vec() };
        AddEdgesProcessor.apply(&partition, &ctx, vec![row], false, true).unwrap();

        let out_key = key::edge_key(partition.part_id(), &src, edge_type, 0, &dst, 8).unwrap();
        let in_key = key::edge_key(partition.part_id(), &dst, edge_type.reversed(), 0, &src, 8).unwrap();
        assert_eq!(partition.engine().get(&out_key).unwrap(), Some(9i64.to_be_bytes().to_vec()));
        assert_eq!(partition.engine().get(&in_key).unwrap(), Some(Vec::new()));
    }

    #[test]
    fn delete_vertices_cascades_to_edges() {
        let dir = tempfile::tempdir().unwrap();
        let partition = open_partition(dir.path());
        let ctx = WriteContext::new(8, Box::new(JsonRowCodec));

        let a = VertexId::Bytes(b"a".to_vec());
        let b = VertexId::Bytes(b"b".to_vec());
        let edge_type = EdgeType::new(1);
        let row = EdgeWrite { src: a.clone(), edge_type, rank: 0, dst: b.clone(), value: 1i64.to_be_bytes().to_vec() };
        AddEdgesProcessor.apply(&partition, &ctx, vec![row], false, true).unwrap();

        DeleteVerticesProcessor.apply(&partition, &ctx, vec![a.clone()], true).unwrap();

        let out_key = key::edge_key(partition.part_id(), &a, edge_type, 0, &b, 8).unwrap();
        let in_key = key::edge_key(partition.part_id(), &b, edge_type.reversed(), 0, &a, 8).unwrap();
        assert_eq!(partition.engine().get(&out_key).unwrap(), None);
        assert_eq!(partition.engine().get(&in_key).unwrap(), None, "mirror row on the other endpoint must be removed too");
    }
}
