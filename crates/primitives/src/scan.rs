//! Scan collectors (§4.9): cursored, partition-parallel range scans over a
//! space's partitions.
//!
//! Kept as its own module because its concurrency contract with the KV
//! engine is subtle: each per-partition page is read off a snapshot taken
//! just for that page (`KvEngine::get_snapshot`), not one snapshot held
//! across pages, since a cursor can resume an arbitrary amount of wall-clock
//! time after the page that produced it and nothing guarantees the engine
//! still has that exact point-in-time view retained.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use graphstore_core::{PartitionId, Result};
use graphstore_engine::Partition;
use graphstore_storage::{EngineIterator, EngineSnapshot, KvEngine};

/// Where a partition's scan left off. Absent in a request means start from
/// the beginning of the requested range; present in a response means the
/// limit cut the scan short and more rows remain from this key on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    /// Exclusive resume key: the next page's range starts here, inclusive
    /// (constructed as the last returned key plus a trailing zero byte, so
    /// it sorts immediately after it without needing to know the key
    /// encoding).
    pub next_cursor: Vec<u8>,
}

/// A scan request spanning some subset of a space's partitions, each
/// potentially resuming from a prior page's cursor.
#[derive(Debug, Default)]
pub struct ScanRequest {
    /// Per-partition resume point; partitions absent from a prior
    /// response's cursor map are done and should not be included again.
    pub parts: FxHashMap<PartitionId, Option<ScanCursor>>,
    /// Maximum rows to return per partition in this page.
    pub limit: usize,
}

/// One partition's page of a scan.
#[derive(Debug)]
pub struct PartitionScanResult {
    /// Rows in key order.
    pub rows: Vec<(Vec<u8>, Vec<u8>)>,
    /// `Some` if `limit` cut the scan short and more rows remain.
    pub cursor: Option<ScanCursor>,
}

/// A full scan response, results merged preserving partition boundaries
/// (never interleaved into one flat row list — callers that want a single
/// ordered stream re-merge per their own key-range semantics).
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Per-partition pages.
    pub parts: FxHashMap<PartitionId, PartitionScanResult>,
}

fn bump_key(mut key: Vec<u8>) -> Vec<u8> {
    key.push(0);
    key
}

fn run_partition_scan(partition: &Partition, start: &[u8], end: &[u8], cursor: Option<&ScanCursor>, limit: usize) -> PartitionScanResult {
    let effective_start: Vec<u8> = cursor.map(|c| c.next_cursor.clone()).unwrap_or_else(|| start.to_vec());

    let snapshot = partition.engine().get_snapshot();
    let (rows, result_cursor) = {
        let mut it = snapshot.range(&effective_start, end);
        let mut rows = Vec::new();
        let mut last_key = None;
        while it.valid() && rows.len() < limit {
            rows.push((it.key().to_vec(), it.value().to_vec()));
            last_key = Some(it.key().to_vec());
            it.next();
        }
        let more = it.valid();
        let result_cursor = if rows.len() == limit && more {
            last_key.map(|k| ScanCursor { next_cursor: bump_key(k) })
        } else {
            None
        };
        (rows, result_cursor)
    };
    partition.engine().release_snapshot(snapshot);

    PartitionScanResult { rows, cursor: result_cursor }
}

/// Drives scans across a set of partitions, either inline (one partition
/// after another on the calling thread) or fanned out onto a `rayon` scoped
/// pool, gated by `query_concurrently` (§6.3).
pub struct ScanCollector {
    query_concurrently: bool,
}

impl ScanCollector {
    /// A collector running inline or concurrently per `query_concurrently`.
    pub fn new(query_concurrently: bool) -> Self {
        Self { query_concurrently }
    }

    /// Execute `request` against `partitions`, deriving each partition's
    /// fixed `(start, end)` range via `range_for` (the same logical range
    /// for every partition involved — e.g. a tag's key-type prefix — just
    /// addressed by that partition's id). Partitions are `Arc`-shared since
    /// the `Store` that owns them hands the same instances to admin tasks
    /// and snapshot transfer concurrently.
    pub fn scan(
        &self,
        partitions: &FxHashMap<PartitionId, Arc<Partition>>,
        range_for: impl Fn(PartitionId) -> (Vec<u8>, Vec<u8>) + Sync,
        request: &ScanRequest,
    ) -> Result<ScanResult> {
        let targets: Vec<(PartitionId, Option<ScanCursor>)> = request
            .parts
            .iter()
            .map(|(id, cursor)| (*id, cursor.clone()))
            .collect();

        let pages: Vec<(PartitionId, PartitionScanResult)> = if self.query_concurrently {
            let collected = Mutex::new(Vec::with_capacity(targets.len()));
            rayon::scope(|scope| {
                for (part_id, cursor) in &targets {
                    let partitions = &partitions;
                    let range_for = &range_for;
                    let collected = &collected;
                    let limit = request.limit;
                    scope.spawn(move |_| {
                        if let Some(partition) = partitions.get(part_id) {
                            let (start, end) = range_for(*part_id);
                            let result = run_partition_scan(partition, &start, &end, cursor.as_ref(), limit);
                            collected.lock().unwrap().push((*part_id, result));
                        }
                    });
                }
            });
            collected.into_inner().unwrap()
        } else {
            targets
                .iter()
                .filter_map(|(part_id, cursor)| {
                    partitions.get(part_id).map(|partition| {
                        let (start, end) = range_for(*part_id);
                        (*part_id, run_partition_scan(partition, &start, &end, cursor.as_ref(), request.limit))
                    })
                })
                .collect()
        };

        Ok(ScanResult { parts: pages.into_iter().collect() })
    }
}
