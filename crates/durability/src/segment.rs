//! WAL segment file format and handle.
//!
//! A segment is named `wal-<firstLogId>.log`, zero-padded to 20 digits so a
//! directory listing sorts in log-id order. Each file starts with a fixed
//! header and is followed by a sequence of self-delimiting frames:
//!
//! ```text
//! header:  magic(4) | format_version(4 BE)
//! frame:   logId(8 BE) | term(8 BE) | cluster(8 BE) | len(4 BE) | payload(len) | crc32(4 BE)
//! ```
//!
//! The CRC covers everything in the frame except itself. A sidecar file
//! `wal-<firstLogId>.idx` holds the 24-byte tuple
//! `(firstLogId, lastLogId, lastTerm)`, all BE `u64`s, rewritten on every
//! flush so a crash mid-append never leaves a stale sidecar pointing past
//! the last durable frame — the next open re-derives it by re-scanning the
//! segment if it's missing or short.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc32fast::Hasher;

use graphstore_core::{Error, Result};

/// Magic bytes identifying a segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"GSWL";
/// Current on-disk format version.
pub const SEGMENT_FORMAT_VERSION: u32 = 1;
/// Size of the fixed segment header.
pub const SEGMENT_HEADER_SIZE: u64 = 8;
const FRAME_HEADER_SIZE: usize = 8 + 8 + 8 + 4;
const FRAME_TRAILER_SIZE: usize = 4;
const SIDECAR_SIZE: usize = 24;

/// One durable log frame: a committed mutation plus its Raft coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalFrame {
    /// Log id (monotonic per partition).
    pub log_id: u64,
    /// Raft term at append time.
    pub term: u64,
    /// Cluster id of the originating cluster.
    pub cluster: u64,
    /// Opaque payload — the wire-encoded log record.
    pub payload: Vec<u8>,
}

impl WalFrame {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len() + FRAME_TRAILER_SIZE);
        buf.write_u64::<BigEndian>(self.log_id).unwrap();
        buf.write_u64::<BigEndian>(self.term).unwrap();
        buf.write_u64::<BigEndian>(self.cluster).unwrap();
        buf.write_u32::<BigEndian>(self.payload.len() as u32).unwrap();
        buf.extend_from_slice(&self.payload);
        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.write_u32::<BigEndian>(hasher.finalize()).unwrap();
        buf
    }

    /// Parse one frame from the front of `bytes`, returning it along with
    /// the number of bytes consumed. `Ok(None)` means `bytes` holds a
    /// truncated trailing frame (the writer crashed mid-append) rather than
    /// a real error — callers should stop reading, not propagate a failure.
    fn decode(bytes: &[u8]) -> Result<Option<(Self, usize)>> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let log_id = BigEndian::read_u64(&bytes[0..8]);
        let term = BigEndian::read_u64(&bytes[8..16]);
        let cluster = BigEndian::read_u64(&bytes[16..24]);
        let len = BigEndian::read_u32(&bytes[24..28]) as usize;
        let total = FRAME_HEADER_SIZE + len + FRAME_TRAILER_SIZE;
        if bytes.len() < total {
            return Ok(None);
        }
        let payload = bytes[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].to_vec();
        let stored_crc = BigEndian::read_u32(&bytes[FRAME_HEADER_SIZE + len..total]);
        let mut hasher = Hasher::new();
        hasher.update(&bytes[..FRAME_HEADER_SIZE + len]);
        if hasher.finalize() != stored_crc {
            return Err(Error::InvalidData(format!(
                "WAL frame for log id {log_id} failed checksum verification"
            )));
        }
        Ok(Some((
            WalFrame { log_id, term, cluster, payload },
            total,
        )))
    }
}

/// A single on-disk WAL file, covering a contiguous range of log ids.
pub struct WalSegment {
    file: BufWriter<File>,
    path: PathBuf,
    first_log_id: u64,
    last_log_id: u64,
    last_term: u64,
    size: u64,
    closed: bool,
}

fn segment_path(dir: &Path, first_log_id: u64) -> PathBuf {
    dir.join(format!("wal-{first_log_id:020}.log"))
}

fn sidecar_path(dir: &Path, first_log_id: u64) -> PathBuf {
    dir.join(format!("wal-{first_log_id:020}.idx"))
}

impl WalSegment {
    /// Create a brand-new, empty segment starting at `first_log_id`.
    pub fn create(dir: &Path, first_log_id: u64) -> Result<Self> {
        let path = segment_path(dir, first_log_id);
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.write_all(&SEGMENT_MAGIC)?;
        file.write_u32::<BigEndian>(SEGMENT_FORMAT_VERSION)?;
        file.flush()?;
        Ok(Self {
            file: BufWriter::new(file),
            path,
            first_log_id,
            last_log_id: first_log_id.saturating_sub(1),
            last_term: 0,
            size: SEGMENT_HEADER_SIZE,
            closed: false,
        })
    }

    /// Re-open the most recent segment for appending, re-deriving its
    /// `last_log_id`/`last_term`/size by scanning its frames (the sidecar is
    /// a cache of this, not the source of truth).
    pub fn open_append(dir: &Path, first_log_id: u64) -> Result<Self> {
        let path = segment_path(dir, first_log_id);
        let bytes = std::fs::read(&path)?;
        if bytes.len() < SEGMENT_HEADER_SIZE as usize || bytes[0..4] != SEGMENT_MAGIC {
            return Err(Error::InvalidData(format!(
                "{} is not a valid WAL segment",
                path.display()
            )));
        }
        let mut last_log_id = first_log_id.saturating_sub(1);
        let mut last_term = 0u64;
        let mut offset = SEGMENT_HEADER_SIZE as usize;
        while let Some((frame, consumed)) = WalFrame::decode(&bytes[offset..])? {
            last_log_id = frame.log_id;
            last_term = frame.term;
            offset += consumed;
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut file = file;
        file.set_len(offset as u64)?;
        file.seek(SeekFrom::Start(offset as u64))?;
        Ok(Self {
            file: BufWriter::new(file),
            path,
            first_log_id,
            last_log_id,
            last_term,
            size: offset as u64,
            closed: false,
        })
    }

    /// Open a segment purely for reading, without truncating trailing
    /// garbage (used by the reader, which tolerates a truncated final
    /// frame on its own).
    pub fn open_read(dir: &Path, first_log_id: u64) -> Result<File> {
        let path = segment_path(dir, first_log_id);
        Ok(OpenOptions::new().read(true).open(path)?)
    }

    /// Append one frame, writing through to the OS buffer. Fsync is the
    /// caller's responsibility via [`WalSegment::sync`].
    pub fn append(&mut self, frame: &WalFrame) -> Result<()> {
        if self.closed {
            return Err(Error::InvalidData(format!(
                "cannot append to closed segment {}",
                self.path.display()
            )));
        }
        let encoded = frame.encode();
        self.file.write_all(&encoded)?;
        self.size += encoded.len() as u64;
        self.last_log_id = frame.log_id;
        self.last_term = frame.term;
        Ok(())
    }

    /// Flush the buffered writer and fsync the underlying file.
    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }

    /// Rewrite this segment's sidecar to reflect its current state.
    pub fn persist_sidecar(&self, dir: &Path) -> Result<()> {
        let mut buf = Vec::with_capacity(SIDECAR_SIZE);
        buf.write_u64::<BigEndian>(self.first_log_id).unwrap();
        buf.write_u64::<BigEndian>(self.last_log_id).unwrap();
        buf.write_u64::<BigEndian>(self.last_term).unwrap();
        let tmp = sidecar_path(dir, self.first_log_id).with_extension("idx.tmp");
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, sidecar_path(dir, self.first_log_id))?;
        Ok(())
    }

    /// Discard every frame after `log_id`, leaving it as the new last
    /// frame. Rewrites the file in place.
    pub fn truncate_after(&mut self, dir: &Path, log_id: u64) -> Result<()> {
        self.file.flush()?;
        let bytes = std::fs::read(&self.path)?;
        let mut offset = SEGMENT_HEADER_SIZE as usize;
        let mut last_log_id = self.first_log_id.saturating_sub(1);
        let mut last_term = 0u64;
        let mut cut_at = offset;
        while let Some((frame, consumed)) = WalFrame::decode(&bytes[offset..])? {
            offset += consumed;
            if frame.log_id > log_id {
                break;
            }
            last_log_id = frame.log_id;
            last_term = frame.term;
            cut_at = offset;
        }
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.set_len(cut_at as u64)?;
        self.file = BufWriter::new(file);
        self.file.get_mut().seek(SeekFrom::Start(cut_at as u64))?;
        self.size = cut_at as u64;
        self.last_log_id = last_log_id;
        self.last_term = last_term;
        self.persist_sidecar(dir)?;
        Ok(())
    }

    /// Mark the segment closed (immutable); syncs first.
    pub fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.sync()?;
            self.closed = true;
        }
        Ok(())
    }

    /// First log id this segment can hold.
    pub fn first_log_id(&self) -> u64 {
        self.first_log_id
    }

    /// Last log id actually written to this segment.
    pub fn last_log_id(&self) -> u64 {
        self.last_log_id
    }

    /// Term of the last log written to this segment.
    pub fn last_term(&self) -> u64 {
        self.last_term
    }

    /// Current file size in bytes, header included.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path to this segment's file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read the `(firstLogId, lastLogId, lastTerm)` sidecar for a segment, or
/// `None` if it is missing (stale/never written — caller falls back to
/// re-scanning the segment itself).
pub fn read_sidecar(dir: &Path, first_log_id: u64) -> Option<(u64, u64, u64)> {
    let bytes = std::fs::read(sidecar_path(dir, first_log_id)).ok()?;
    if bytes.len() != SIDECAR_SIZE {
        return None;
    }
    Some((
        BigEndian::read_u64(&bytes[0..8]),
        BigEndian::read_u64(&bytes[8..16]),
        BigEndian::read_u64(&bytes[16..24]),
    ))
}

/// Scan `dir` for segment files, returning their `firstLogId`s in order.
pub fn list_segments(dir: &Path) -> std::io::Result<Vec<u64>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(stripped) = name.strip_prefix("wal-").and_then(|s| s.strip_suffix(".log")) {
            if let Ok(id) = stripped.parse::<u64>() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Read every committed frame in `[start, end]` from a closed segment file.
pub fn read_frames_in_range(mut file: File, start: u64, end: u64) -> Result<Vec<WalFrame>> {
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    if bytes.len() < SEGMENT_HEADER_SIZE as usize || bytes[0..4] != SEGMENT_MAGIC {
        return Err(Error::InvalidData("segment missing valid header".into()));
    }
    let mut offset = SEGMENT_HEADER_SIZE as usize;
    let mut frames = Vec::new();
    while let Some((frame, consumed)) = WalFrame::decode(&bytes[offset..])? {
        offset += consumed;
        if frame.log_id > end {
            break;
        }
        if frame.log_id >= start {
            frames.push(frame);
        }
    }
    Ok(frames)
}
