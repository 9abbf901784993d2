//! Size limits consulted when encoding keys and values.
//!
//! Passed by value at construction time (see §9's design note on avoiding
//! true globals) rather than read from a process-wide static.

/// Size and shape limits for a space's keys, values and VIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum length, in bytes, of a fixed-length VID.
    pub max_vid_len: usize,
    /// Maximum length, in bytes, of an encoded row value.
    pub max_value_bytes: usize,
    /// Maximum number of keys allowed in a single `multiGet`/batch request.
    pub max_batch_keys: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_vid_len: 256,
            max_value_bytes: 8 * 1024 * 1024,
            max_batch_keys: 65_536,
        }
    }
}
