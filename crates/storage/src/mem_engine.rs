//! [`MemEngine`]: a `BTreeMap`-backed [`KvEngine`], snapshot-isolated via
//! `Arc`-cloning the map on read (grounded in the teacher's
//! `UnifiedStore::create_snapshot`, which takes a read lock just long
//! enough to clone the backing tree and hands the clone to the reader as an
//! immutable view).
//!
//! Despite the name this is the only engine implementation carried into
//! this crate: a real deployment would swap this module for an on-disk
//! engine (RocksDB-shaped) without touching [`crate::KvEngine`] call sites.

use std::collections::{BTreeMap, HashSet};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};
use crc32fast::Hasher;
use parking_lot::RwLock;

use graphstore_core::wire::BatchSubOp;
use graphstore_core::{Error, PartitionId, Result};

use crate::traits::{EngineIterator, EngineSnapshot, KvEngine};
use crate::write_batch::WriteBatch;

/// Key prefix reserved for persisted partition markers. Chosen to sort
/// after every key produced by `graphstore_core::key` (whose highest
/// `KeyType` byte is `0x06`), so a marker scan never collides with user
/// data in the same tree.
const PART_MARKER_PREFIX: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

fn part_marker_key(part_id: PartitionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(8);
    key.extend_from_slice(&PART_MARKER_PREFIX);
    key.write_u32::<BigEndian>(part_id.get()).unwrap();
    key
}

type Tree = BTreeMap<Vec<u8>, Vec<u8>>;

struct Inner {
    tree: RwLock<Tree>,
    parts: RwLock<HashSet<PartitionId>>,
}

/// An in-memory [`KvEngine`]. Cheap to construct, loses all data on drop;
/// useful standalone for tests and as the scaffolding every other engine
/// would be benchmarked against.
pub struct MemEngine {
    inner: Arc<Inner>,
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemEngine {
    /// A fresh, empty engine.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tree: RwLock::new(BTreeMap::new()),
                parts: RwLock::new(HashSet::new()),
            }),
        }
    }

    fn apply_op(tree: &mut Tree, op: &BatchSubOp) {
        match op {
            BatchSubOp::Put(k, v) => {
                tree.insert(k.clone(), v.clone());
            }
            BatchSubOp::Remove(k) => {
                tree.remove(k);
            }
            BatchSubOp::RemoveRange(start, end) => {
                let to_drop: Vec<Vec<u8>> = tree
                    .range(start.clone()..end.clone())
                    .map(|(k, _)| k.clone())
                    .collect();
                for k in to_drop {
                    tree.remove(&k);
                }
            }
        }
    }
}

/// A consistent view obtained by cloning the live tree under a read lock.
/// Cloning a `BTreeMap<Vec<u8>, Vec<u8>>` is O(n) in node count but shares
/// no mutable state with the live tree afterwards, so readers never block
/// writers (or each other) once the clone completes.
pub struct MemSnapshot {
    tree: Arc<Tree>,
}

struct RangeIter<'a> {
    iter: std::collections::btree_map::Range<'a, Vec<u8>, Vec<u8>>,
    current: Option<(&'a Vec<u8>, &'a Vec<u8>)>,
}

impl<'a> RangeIter<'a> {
    fn new(iter: std::collections::btree_map::Range<'a, Vec<u8>, Vec<u8>>) -> Self {
        let mut iter = iter;
        let current = iter.next();
        Self { iter, current }
    }
}

impl<'a> EngineIterator for RangeIter<'a> {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.expect("valid() checked by caller").0
    }

    fn value(&self) -> &[u8] {
        self.current.expect("valid() checked by caller").1
    }

    fn next(&mut self) {
        self.current = self.iter.next();
    }
}

fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    for i in (0..upper.len()).rev() {
        if upper[i] != 0xFF {
            upper[i] += 1;
            upper.truncate(i + 1);
            return Some(upper);
        }
    }
    None
}

impl EngineSnapshot for MemSnapshot {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.tree.get(key).cloned()
    }

    fn range(&self, start: &[u8], end: &[u8]) -> Box<dyn EngineIterator + '_> {
        Box::new(RangeIter::new(self.tree.range(start.to_vec()..end.to_vec())))
    }

    fn prefix(&self, prefix: &[u8]) -> Box<dyn EngineIterator + '_> {
        match prefix_upper_bound(prefix) {
            Some(upper) => Box::new(RangeIter::new(self.tree.range(prefix.to_vec()..upper))),
            None => Box::new(RangeIter::new(self.tree.range(prefix.to_vec()..))),
        }
    }
}

impl KvEngine for MemEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.tree.read().get(key).cloned())
    }

    fn range(&self, start: &[u8], end: &[u8]) -> Box<dyn EngineIterator + '_> {
        let snapshot = Arc::new(self.inner.tree.read().clone());
        struct Owned {
            _tree: Arc<Tree>,
            entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
            current: Option<(Vec<u8>, Vec<u8>)>,
        }
        impl EngineIterator for Owned {
            fn valid(&self) -> bool {
                self.current.is_some()
            }
            fn key(&self) -> &[u8] {
                &self.current.as_ref().expect("valid() checked by caller").0
            }
            fn value(&self) -> &[u8] {
                &self.current.as_ref().expect("valid() checked by caller").1
            }
            fn next(&mut self) {
                self.current = self.entries.next();
            }
        }
        let entries: Vec<(Vec<u8>, Vec<u8>)> = snapshot
            .range(start.to_vec()..end.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut entries = entries.into_iter();
        let current = entries.next();
        Box::new(Owned { _tree: snapshot, entries, current })
    }

    fn prefix(&self, prefix: &[u8]) -> Box<dyn EngineIterator + '_> {
        let snapshot = Arc::new(self.inner.tree.read().clone());
        let entries: Vec<(Vec<u8>, Vec<u8>)> = match prefix_upper_bound(prefix) {
            Some(upper) => snapshot
                .range(prefix.to_vec()..upper)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => snapshot
                .range(prefix.to_vec()..)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        struct Owned {
            _tree: Arc<Tree>,
            entries: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
            current: Option<(Vec<u8>, Vec<u8>)>,
        }
        impl EngineIterator for Owned {
            fn valid(&self) -> bool {
                self.current.is_some()
            }
            fn key(&self) -> &[u8] {
                &self.current.as_ref().expect("valid() checked by caller").0
            }
            fn value(&self) -> &[u8] {
                &self.current.as_ref().expect("valid() checked by caller").1
            }
            fn next(&mut self) {
                self.current = self.entries.next();
            }
        }
        let mut entries = entries.into_iter();
        let current = entries.next();
        Box::new(Owned { _tree: snapshot, entries, current })
    }

    fn get_snapshot(&self) -> Box<dyn EngineSnapshot> {
        let tree = self.inner.tree.read().clone();
        Box::new(MemSnapshot { tree: Arc::new(tree) })
    }

    fn commit_batch_write(
        &self,
        batch: WriteBatch,
        _disable_wal: bool,
        _sync: bool,
        _wait: bool,
    ) -> Result<()> {
        let mut tree = self.inner.tree.write();
        for op in batch.ops() {
            Self::apply_op(&mut tree, op);
        }
        Ok(())
    }

    fn ingest(&self, files: &[PathBuf], verify_checksum: bool) -> Result<()> {
        for path in files {
            let rows = read_sorted_file(path, verify_checksum)?;
            let mut tree = self.inner.tree.write();
            for (k, v) in rows {
                tree.insert(k, v);
            }
        }
        Ok(())
    }

    fn add_part(&self, part_id: PartitionId) -> Result<()> {
        self.inner
            .tree
            .write()
            .insert(part_marker_key(part_id), Vec::new());
        self.inner.parts.write().insert(part_id);
        Ok(())
    }

    fn remove_part(&self, part_id: PartitionId) -> Result<()> {
        self.inner.tree.write().remove(&part_marker_key(part_id));
        self.inner.parts.write().remove(&part_id);
        Ok(())
    }

    fn parts(&self) -> Vec<PartitionId> {
        let mut parts: Vec<PartitionId> = self.inner.parts.read().iter().copied().collect();
        parts.sort();
        parts
    }

    fn backup_table(
        &self,
        path: &Path,
        prefix: &[u8],
        filter: &dyn Fn(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        let tree = self.inner.tree.read();
        let end = prefix_upper_bound(prefix);
        let rows: Vec<(&Vec<u8>, &Vec<u8>)> = match &end {
            Some(end) => tree.range(prefix.to_vec()..end.clone()).collect(),
            None => tree.range(prefix.to_vec()..).collect(),
        };
        write_sorted_file(path, rows.into_iter().filter(|(k, v)| filter(k, v)))
    }

    fn create_checkpoint(&self, path: &Path) -> Result<()> {
        let tree = self.inner.tree.read();
        write_sorted_file(path, tree.iter())
    }
}

/// On-disk layout for `backup_table`/`create_checkpoint`/`ingest`: a flat
/// sequence of `len(u32 BE) key len(u32 BE) value` rows, followed by a
/// trailing `crc32(u32 BE)` over everything written before it. Not meant to
/// be a general-purpose SSTable format — just enough structure to move a
/// filtered slice of one engine's keyspace into another.
fn write_sorted_file<'a, I>(path: &Path, rows: I) -> Result<()>
where
    I: Iterator<Item = (&'a Vec<u8>, &'a Vec<u8>)>,
{
    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Hasher::new();
    for (k, v) in rows {
        let mut header = Vec::with_capacity(8);
        header.write_u32::<BigEndian>(k.len() as u32)?;
        header.write_u32::<BigEndian>(v.len() as u32)?;
        writer.write_all(&header)?;
        writer.write_all(k)?;
        writer.write_all(v)?;
        hasher.update(&header);
        hasher.update(k);
        hasher.update(v);
    }
    let crc = hasher.finalize();
    writer.write_u32::<BigEndian>(crc)?;
    writer.flush()?;
    Ok(())
}

fn read_sorted_file(path: &Path, verify_checksum: bool) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 4 {
        return Err(Error::InvalidData(format!(
            "ingest file {} shorter than its trailing checksum",
            path.display()
        )));
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    if verify_checksum {
        let expected = u32::from_be_bytes(crc_bytes.try_into().unwrap());
        let mut hasher = Hasher::new();
        hasher.update(body);
        if hasher.finalize() != expected {
            return Err(Error::InvalidData(format!(
                "ingest file {} failed checksum verification",
                path.display()
            )));
        }
    }
    let mut rows = Vec::new();
    let mut offset = 0usize;
    while offset < body.len() {
        if offset + 8 > body.len() {
            return Err(Error::InvalidData("truncated ingest row header".into()));
        }
        let klen = u32::from_be_bytes(body[offset..offset + 4].try_into().unwrap()) as usize;
        let vlen = u32::from_be_bytes(body[offset + 4..offset + 8].try_into().unwrap()) as usize;
        offset += 8;
        if offset + klen + vlen > body.len() {
            return Err(Error::InvalidData("truncated ingest row body".into()));
        }
        let key = body[offset..offset + klen].to_vec();
        offset += klen;
        let value = body[offset..offset + vlen].to_vec();
        offset += vlen;
        rows.push((key, value));
    }
    Ok(rows)
}
