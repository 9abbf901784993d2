//! [`WalWriter`]: single-writer durable append path for one partition's WAL
//! (§4.4). Not thread-safe — exactly like the source `FileBasedWal`,
//! callers are expected to serialize appends through `Partition`.

use std::path::PathBuf;

use graphstore_core::Result;

use crate::policy::WalPolicy;
use crate::segment::{self, WalFrame, WalSegment};

/// Durable, rotating WAL for a single partition.
pub struct WalWriter {
    dir: PathBuf,
    policy: WalPolicy,
    segment: WalSegment,
    first_log_id: u64,
}

impl WalWriter {
    /// Open (or create) the WAL directory, resuming the most recent
    /// segment if one exists.
    pub fn open(dir: PathBuf, policy: WalPolicy) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let segments = segment::list_segments(&dir)?;
        let (segment, first_log_id) = match segments.last() {
            Some(&id) => (WalSegment::open_append(&dir, id)?, id),
            None => (WalSegment::create(&dir, 1)?, 1),
        };
        Ok(Self { dir, policy, segment, first_log_id })
    }

    /// The id of the first log record the writer would currently accept
    /// for a fresh WAL (1 for a brand-new partition).
    pub fn first_log_id(&self) -> u64 {
        match segment::list_segments(&self.dir).ok().and_then(|s| s.first().copied()) {
            Some(id) => id,
            None => self.first_log_id,
        }
    }

    /// The last durably-appended log id, or `lastLogId == firstLogId - 1`
    /// if nothing has been appended yet.
    pub fn last_log_id(&self) -> u64 {
        self.segment.last_log_id()
    }

    /// The term of the last durably-appended log.
    pub fn last_log_term(&self) -> u64 {
        self.segment.last_term()
    }

    /// Append one record, rotating to a new segment first if it would
    /// overflow the configured file size. Returns once the write has
    /// reached the OS buffer; pass `policy.sync = true` (or call
    /// [`WalWriter::flush`] explicitly) for a durability guarantee.
    pub fn append(&mut self, log_id: u64, term: u64, cluster: u64, payload: Vec<u8>) -> Result<()> {
        let frame = WalFrame { log_id, term, cluster, payload };
        let encoded_len = frame.payload.len() as u64 + 28;
        if self.segment.size() + encoded_len > self.policy.file_size {
            self.rotate(log_id)?;
        }
        self.segment.append(&frame)?;
        if self.policy.sync {
            self.segment.sync()?;
        }
        self.segment.persist_sidecar(&self.dir)?;
        Ok(())
    }

    /// Append a contiguous batch of records as they arrive from replay or
    /// catch-up, in order.
    pub fn append_all(&mut self, frames: Vec<(u64, u64, u64, Vec<u8>)>) -> Result<()> {
        for (log_id, term, cluster, payload) in frames {
            self.append(log_id, term, cluster, payload)?;
        }
        Ok(())
    }

    fn rotate(&mut self, next_log_id: u64) -> Result<()> {
        self.segment.close()?;
        self.segment.persist_sidecar(&self.dir)?;
        self.segment = WalSegment::create(&self.dir, next_log_id)?;
        Ok(())
    }

    /// Force the current segment to disk regardless of the configured
    /// sync policy.
    pub fn flush(&mut self) -> Result<()> {
        self.segment.sync()?;
        self.segment.persist_sidecar(&self.dir)?;
        Ok(())
    }

    /// Discard every record after `id`, rewriting the tail of whichever
    /// segment holds it and deleting any later segments outright.
    pub fn rollback_to_log(&mut self, id: u64) -> Result<()> {
        let segments = segment::list_segments(&self.dir)?;
        let holder = segments.iter().rev().find(|&&first| first <= id).copied();

        for &first in segments.iter() {
            if Some(first) == holder {
                continue;
            }
            if first > id {
                std::fs::remove_file(self.segment_log_path(first))?;
                let _ = std::fs::remove_file(self.segment_idx_path(first));
            }
        }

        let holder = holder.unwrap_or(1);
        if holder == self.segment.first_log_id() {
            self.segment.truncate_after(&self.dir, id)?;
        } else {
            let mut reopened = WalSegment::open_append(&self.dir, holder)?;
            reopened.truncate_after(&self.dir, id)?;
            self.segment = reopened;
        }
        Ok(())
    }

    /// Delete whole segments whose `lastLogId < threshold`, never
    /// touching the currently active segment.
    pub fn clean_wal(&mut self, threshold: u64) -> Result<usize> {
        let segments = segment::list_segments(&self.dir)?;
        let mut removed = 0;
        for &first in &segments {
            if first == self.segment.first_log_id() {
                continue;
            }
            let last = segment::read_sidecar(&self.dir, first)
                .map(|(_, last, _)| last)
                .unwrap_or(u64::MAX);
            if last < threshold {
                std::fs::remove_file(self.segment_log_path(first))?;
                let _ = std::fs::remove_file(self.segment_idx_path(first));
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn segment_log_path(&self, first_log_id: u64) -> PathBuf {
        self.dir.join(format!("wal-{first_log_id:020}.log"))
    }

    fn segment_idx_path(&self, first_log_id: u64) -> PathBuf {
        self.dir.join(format!("wal-{first_log_id:020}.idx"))
    }

    /// All segment starting ids currently on disk, in order.
    pub fn list_segments(&self) -> Result<Vec<u64>> {
        Ok(segment::list_segments(&self.dir)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> WalPolicy {
        WalPolicy { file_size: 128, buffer_size: 128, sync: true }
    }

    #[test]
    fn append_and_resume_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut writer = WalWriter::open(dir.path().to_path_buf(), policy()).unwrap();
            writer.append(1, 1, 1, vec![1, 2, 3]).unwrap();
            writer.append(2, 1, 1, vec![4, 5, 6]).unwrap();
        }
        let writer = WalWriter::open(dir.path().to_path_buf(), policy()).unwrap();
        assert_eq!(writer.last_log_id(), 2);
        assert_eq!(writer.last_log_term(), 1);
    }

    #[test]
    fn rotates_when_file_size_exceeded() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = WalWriter::open(dir.path().to_path_buf(), policy()).unwrap();
        for id in 1..=20u64 {
            writer.append(id, 1, 1, vec![0u8; 16]).unwrap();
        }
        let segments = writer.list_segments().unwrap();
        assert!(segments.len() > 1, "expected rotation to multiple segments");
        assert_eq!(writer.last_log_id(), 20);
    }

    #[test]
    fn rollback_discards_suffix_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = WalWriter::open(dir.path().to_path_buf(), policy()).unwrap();
        for id in 1..=20u64 {
            writer.append(id, 1, 1, vec![0u8; 16]).unwrap();
        }
        writer.rollback_to_log(10).unwrap();
        assert_eq!(writer.last_log_id(), 10);
        for id in 11..=20u64 {
            writer.append(id, 2, 1, vec![1u8; 16]).unwrap();
        }
        assert_eq!(writer.last_log_id(), 20);
        assert_eq!(writer.last_log_term(), 2);
    }

    #[test]
    fn clean_wal_never_removes_active_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = WalWriter::open(dir.path().to_path_buf(), policy()).unwrap();
        for id in 1..=20u64 {
            writer.append(id, 1, 1, vec![0u8; 16]).unwrap();
        }
        let before = writer.list_segments().unwrap().len();
        writer.clean_wal(u64::MAX).unwrap();
        let after = writer.list_segments().unwrap();
        assert_eq!(after.len(), 1, "only the active segment should survive");
        assert!(after.len() <= before);
    }
}
