//! The `KvEngine` trait seam (§4.3, §9's polymorphism note).
//!
//! There is exactly one production implementation ([`crate::MemEngine`])
//! today, matching the teacher's single-`UnifiedStore` setup, but the trait
//! is kept distinct so tests can substitute a mock engine without touching
//! `Partition`/`Store` call sites.

use graphstore_core::{PartitionId, Result};
use std::path::Path;

use crate::write_batch::WriteBatch;

/// An opaque, consistent point-in-time view of an engine's keyspace.
///
/// Acquired via [`KvEngine::get_snapshot`] and released via
/// [`KvEngine::release_snapshot`] (or simply dropped — the handle's `Drop`
/// releases the underlying reference either way; the explicit method exists
/// for call sites that want to make the release point visible, mirroring
/// the source engine's explicit `releaseSnapshot`).
pub trait EngineSnapshot: Send + Sync {
    /// Point read against this snapshot's view.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Iterate `[start, end)` against this snapshot's view.
    fn range(&self, start: &[u8], end: &[u8]) -> Box<dyn EngineIterator + '_>;

    /// Iterate all keys with the given prefix against this snapshot's view.
    fn prefix(&self, prefix: &[u8]) -> Box<dyn EngineIterator + '_>;
}

/// A forward iterator over engine rows. Distinct from the WAL's and the
/// `AtomicLogBuffer`'s iterator traits (§9: "duck-typed iterators... keep
/// them as distinct traits with the minimum surface each caller needs").
pub trait EngineIterator {
    /// Whether the iterator currently points at a valid row.
    fn valid(&self) -> bool;
    /// The current row's key. Panics if `!valid()`.
    fn key(&self) -> &[u8];
    /// The current row's value. Panics if `!valid()`.
    fn value(&self) -> &[u8];
    /// Advance to the next row.
    fn next(&mut self);
}

/// The embedded KV engine contract consumed by the rest of the storage
/// core (§4.3). One instance owns one data path and hosts some subset of a
/// space's partitions.
pub trait KvEngine: Send + Sync {
    /// Point read of the live (uncommitted-snapshot) state.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Point read of multiple keys; missing keys yield `None` at their
    /// index rather than aborting the whole call.
    fn multi_get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Iterate `[start, end)` over the live state.
    fn range(&self, start: &[u8], end: &[u8]) -> Box<dyn EngineIterator + '_>;

    /// Iterate all keys sharing `prefix` over the live state.
    fn prefix(&self, prefix: &[u8]) -> Box<dyn EngineIterator + '_>;

    /// Acquire a consistent point-in-time snapshot.
    fn get_snapshot(&self) -> Box<dyn EngineSnapshot>;

    /// Explicitly release a snapshot. A no-op beyond dropping the handle;
    /// kept as a named call for symmetry with `getSnapshot`.
    fn release_snapshot(&self, _snapshot: Box<dyn EngineSnapshot>) {}

    /// Construct an empty write batch bound to this engine.
    fn write_batch(&self) -> WriteBatch {
        WriteBatch::new()
    }

    /// Atomically apply a batch. `wait=false` may return
    /// [`graphstore_core::Error::Incomplete`] if the engine declines to
    /// guarantee immediate durability before returning.
    fn commit_batch_write(
        &self,
        batch: WriteBatch,
        disable_wal: bool,
        sync: bool,
        wait: bool,
    ) -> Result<()>;

    /// Atomically adopt externally-produced sorted files (bulk import, or
    /// restore-from-backup).
    fn ingest(&self, files: &[std::path::PathBuf], verify_checksum: bool) -> Result<()>;

    /// Persist a per-partition marker so the partition set survives a
    /// restart, and begin tracking it as hosted by this engine.
    fn add_part(&self, part_id: PartitionId) -> Result<()>;

    /// Remove a partition's marker and stop tracking it as hosted.
    fn remove_part(&self, part_id: PartitionId) -> Result<()>;

    /// Partitions currently hosted by this engine, as persisted by
    /// `add_part`/`remove_part` (used by the "least-loaded first"
    /// placement policy and by startup recovery).
    fn parts(&self) -> Vec<PartitionId>;

    /// Produce a sorted file at `path` containing every key-value pair
    /// under `prefix` for which `filter` returns `true`.
    fn backup_table(
        &self,
        path: &Path,
        prefix: &[u8],
        filter: &dyn Fn(&[u8], &[u8]) -> bool,
    ) -> Result<()>;

    /// Compact the engine's on-disk representation, if applicable.
    fn compact(&self) -> Result<()> {
        Ok(())
    }

    /// Flush any buffered writes to stable storage, if applicable.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Create a full checkpoint of this engine's data at `path`.
    fn create_checkpoint(&self, path: &Path) -> Result<()>;
}
