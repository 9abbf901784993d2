//! WAL file policy (§4.4).

/// Tunables controlling how a partition's durable WAL is laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalPolicy {
    /// Maximum size of a single WAL file in bytes. Once the active file
    /// would exceed this size, a new one is opened.
    pub file_size: u64,
    /// Size hint for the writer's internal buffer.
    pub buffer_size: usize,
    /// Whether every append is followed by an `fsync`.
    pub sync: bool,
}

impl Default for WalPolicy {
    fn default() -> Self {
        Self {
            file_size: 16 * 1024 * 1024,
            buffer_size: 8 * 1024 * 1024,
            sync: false,
        }
    }
}

impl WalPolicy {
    /// A policy with a tiny file size, useful for exercising rotation in
    /// tests without writing megabytes of filler.
    pub fn for_testing() -> Self {
        Self {
            file_size: 4096,
            buffer_size: 4096,
            sync: true,
        }
    }
}
