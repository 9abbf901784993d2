//! Store configuration (§6.3): every tunable the core recognizes, passed by
//! value at construction rather than read from a global — mirroring how the
//! rest of this workspace threads `WalPolicy`/`RebuildConfig`/`Limits`
//! through constructors instead of statics.

use std::path::PathBuf;

/// Construction-time configuration for a [`crate::Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Data directories this node manages; each hosts one engine per space
    /// discovered under it (`<data_path>/<spaceId>/...`).
    pub data_paths: Vec<PathBuf>,
    /// Root directory for listener WALs (full-text index feed, etc.), if
    /// any listener is configured.
    pub listener_path: Option<PathBuf>,
    /// Size of the IO thread pool used for network/Raft transport. Kept
    /// here even though this crate's `Store` itself is synchronous, so a
    /// caller wiring up the RPC layer has one place to read the number
    /// from.
    pub num_io_threads: usize,
    /// Number of worker threads backing admin tasks (compact/flush/
    /// rebuild/stats).
    pub admin_threads: usize,
    /// Maximum number of queued admin subtasks before submission is
    /// rejected with backpressure.
    pub admin_queue_depth: usize,
    /// Retention for committed WAL files, in seconds.
    pub wal_ttl_secs: u64,
    /// WAL segment rollover threshold, in bytes.
    pub wal_file_size: u64,
    /// `WalWriter`'s internal buffer size hint, in bytes.
    pub wal_buffer_size: usize,
    /// Whether every WAL append is followed by an `fsync`.
    pub wal_sync: bool,
    /// How often the WAL cleaner background thread runs, in seconds.
    pub clean_wal_interval_secs: u64,
    /// How often the checkpoint-backup background thread runs, in seconds.
    /// Zero disables periodic backup.
    pub checkpoint_backup_interval_secs: u64,
    /// Listener polling interval for `REBUILD_FULLTEXT_INDEX` and for any
    /// heartbeat-driven lease renewal.
    pub raft_heartbeat_interval_secs: u64,
    /// Per-partition, per-sender snapshot egress rate limit, bytes/sec.
    pub snapshot_part_rate_limit: f64,
    /// Snapshot chunk size, in bytes.
    pub snapshot_batch_size: usize,
    /// Index-rebuild write rate limit, bytes/sec.
    pub rebuild_index_part_rate_limit: f64,
    /// Index-rebuild batch flush threshold, in bytes.
    pub rebuild_index_batch_size: usize,
    /// Version written when multi-version concurrency is disabled; must be
    /// greater than zero when TOSS (transaction-on-shared-storage) is
    /// enabled.
    pub default_mvcc_ver: u64,
    /// If true, also write a vertex-existence marker alongside tag rows.
    pub use_vertex_key: bool,
    /// Route per-partition scans onto the `rayon` pool instead of running
    /// them inline on the calling thread.
    pub query_concurrently: bool,
    /// Resident-set fraction of total system memory above which write
    /// processors fast-fail with `MemoryExceeded`.
    pub system_memory_high_watermark_ratio: f64,
    /// How often the memory-pressure monitor samples resident set, in
    /// seconds.
    pub check_memory_interval_secs: u64,
    /// At startup, delete on-disk directories for spaces the meta client no
    /// longer lists as belonging to this node.
    pub auto_remove_invalid_space: bool,
    /// Fixed byte width of a space's VIDs, used to encode/decode keys.
    pub vid_len: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_paths: Vec::new(),
            listener_path: None,
            num_io_threads: 4,
            admin_threads: 2,
            admin_queue_depth: 1024,
            wal_ttl_secs: 4 * 3600,
            wal_file_size: 16 * 1024 * 1024,
            wal_buffer_size: 8 * 1024 * 1024,
            wal_sync: false,
            clean_wal_interval_secs: 60,
            checkpoint_backup_interval_secs: 0,
            raft_heartbeat_interval_secs: 1,
            snapshot_part_rate_limit: 10.0 * 1024.0 * 1024.0,
            snapshot_batch_size: 512 * 1024,
            rebuild_index_part_rate_limit: 512.0 * 1024.0,
            rebuild_index_batch_size: 128 * 1024,
            default_mvcc_ver: 1,
            use_vertex_key: false,
            query_concurrently: false,
            system_memory_high_watermark_ratio: 0.8,
            check_memory_interval_secs: 5,
            auto_remove_invalid_space: false,
            vid_len: 8,
        }
    }
}

impl StoreConfig {
    /// A config suitable for tests: a single temp-dir-backed data path, tiny
    /// WAL segments, background threads disabled.
    pub fn for_testing(data_path: PathBuf) -> Self {
        Self {
            data_paths: vec![data_path],
            wal_file_size: 4096,
            wal_buffer_size: 4096,
            wal_sync: true,
            clean_wal_interval_secs: 0,
            checkpoint_backup_interval_secs: 0,
            ..Self::default()
        }
    }
}
