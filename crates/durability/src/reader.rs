//! Durable-WAL iteration (§4.4, §9).
//!
//! Kept as its own trait — distinct from the in-memory log buffer's
//! iterator and the KV engine's iterator — since a WAL reader walks
//! multiple segment *files* rather than one in-memory structure, and
//! reports a decode failure instead of silently stopping.

use std::fs::File;
use std::path::Path;

use graphstore_core::Result;

use crate::segment::{self, read_frames_in_range, WalFrame};

/// Forward iterator over durable WAL frames in `[start, end]`.
pub trait WalIterator {
    /// Whether the iterator currently points at a valid frame.
    fn valid(&self) -> bool;
    /// The current frame. Panics if `!valid()`.
    fn frame(&self) -> &WalFrame;
    /// Advance to the next frame.
    fn next(&mut self) -> Result<()>;
}

/// A [`WalIterator`] that reads directly off the segment files in `dir`.
pub struct FileWalIterator {
    frames: std::vec::IntoIter<WalFrame>,
    current: Option<WalFrame>,
}

impl FileWalIterator {
    /// Build an iterator over `[start, end]`, reading every segment that
    /// could contain a log id in that range.
    pub fn new(dir: &Path, start: u64, end: u64) -> Result<Self> {
        let segments = segment::list_segments(dir)?;
        let mut frames = Vec::new();
        for (idx, &first) in segments.iter().enumerate() {
            let next_first = segments.get(idx + 1).copied().unwrap_or(u64::MAX);
            if next_first <= start || first > end {
                continue;
            }
            let file: File = segment::WalSegment::open_read(dir, first)?;
            frames.extend(read_frames_in_range(file, start, end)?);
        }
        let mut frames = frames.into_iter();
        let current = frames.next();
        Ok(Self { frames, current })
    }
}

impl WalIterator for FileWalIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn frame(&self) -> &WalFrame {
        self.current.as_ref().expect("valid() checked by caller")
    }

    fn next(&mut self) -> Result<()> {
        self.current = self.frames.next();
        Ok(())
    }
}
