//! Log-record wire format (§6.1), bit-exact.
//!
//! `Log record := timestamp(8, native-endian) || opCode(1) || payload`.
//! This is the payload handed to the Raft layer's `propose`/`append` and
//! read back by [`Partition::commit_logs`](../../graphstore_engine/struct.Partition.html).

use crate::error::{Error, Result};
use byteorder::{ByteOrder, NativeEndian};

/// Operation codes tagging a log record's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Single `(key, value)` put.
    Put = 1,
    /// Alternating keys and values.
    MultiPut = 2,
    /// Single key remove.
    Remove = 3,
    /// Multiple key removes.
    MultiRemove = 4,
    /// `[start, end)` range remove.
    RemoveRange = 5,
    /// Encoded sequence of tagged put/remove/removeRange sub-ops.
    BatchWrite = 6,
    /// Membership change: add a voting peer. No-op at commit time (already
    /// absorbed during `preProcessLog`).
    AddPeer = 7,
    /// Membership change: add a non-voting learner. No-op at commit time.
    AddLearner = 8,
    /// Membership change: remove a peer. Finalized at commit time.
    RemovePeer = 9,
    /// Leadership transfer. Finalized at commit time.
    TransLeader = 10,
}

impl OpCode {
    fn from_u8(b: u8) -> Result<Self> {
        Ok(match b {
            1 => OpCode::Put,
            2 => OpCode::MultiPut,
            3 => OpCode::Remove,
            4 => OpCode::MultiRemove,
            5 => OpCode::RemoveRange,
            6 => OpCode::BatchWrite,
            7 => OpCode::AddPeer,
            8 => OpCode::AddLearner,
            9 => OpCode::RemovePeer,
            10 => OpCode::TransLeader,
            other => return Err(Error::InvalidData(format!("unknown op code {other}"))),
        })
    }
}

/// One sub-operation inside an [`OpCode::BatchWrite`] payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchSubOp {
    /// Put `key -> value`.
    Put(Vec<u8>, Vec<u8>),
    /// Remove `key`.
    Remove(Vec<u8>),
    /// Remove range `[start, end)`.
    RemoveRange(Vec<u8>, Vec<u8>),
}

/// A decoded host address, used by membership-change payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddr {
    /// IP or hostname.
    pub ip: String,
    /// Port.
    pub port: u32,
}

/// The parsed body of a log record (everything after the timestamp and op
/// code).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    /// Heartbeat: empty payload. Skipped at apply time but still advances
    /// the last-applied id.
    Heartbeat,
    /// `OP_PUT`.
    Put { key: Vec<u8>, value: Vec<u8> },
    /// `OP_MULTI_PUT`.
    MultiPut { pairs: Vec<(Vec<u8>, Vec<u8>)> },
    /// `OP_REMOVE`.
    Remove { key: Vec<u8> },
    /// `OP_MULTI_REMOVE`.
    MultiRemove { keys: Vec<Vec<u8>> },
    /// `OP_REMOVE_RANGE`.
    RemoveRange { start: Vec<u8>, end: Vec<u8> },
    /// `OP_BATCH_WRITE`.
    BatchWrite { ops: Vec<BatchSubOp> },
    /// `OP_ADD_PEER`.
    AddPeer { host: HostAddr },
    /// `OP_ADD_LEARNER`.
    AddLearner { host: HostAddr },
    /// `OP_REMOVE_PEER`.
    RemovePeer { host: HostAddr },
    /// `OP_TRANS_LEADER`.
    TransLeader { host: HostAddr },
}

/// A full log record: `timestamp(8, native-endian) || opCode(1) || payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Record timestamp (native-endian on the wire, per §6.1).
    pub timestamp: u64,
    /// Decoded payload.
    pub payload: LogPayload,
}

fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    let mut len_buf = [0u8; 4];
    NativeEndian::write_u32(&mut len_buf, bytes.len() as u32);
    buf.extend_from_slice(&len_buf);
    buf.extend_from_slice(bytes);
}

fn read_len_prefixed(buf: &[u8], off: &mut usize) -> Result<Vec<u8>> {
    if *off + 4 > buf.len() {
        return Err(Error::InvalidData("truncated length prefix".into()));
    }
    let len = NativeEndian::read_u32(&buf[*off..*off + 4]) as usize;
    *off += 4;
    if *off + len > buf.len() {
        return Err(Error::InvalidData("truncated length-prefixed field".into()));
    }
    let out = buf[*off..*off + len].to_vec();
    *off += len;
    Ok(out)
}

fn write_host(buf: &mut Vec<u8>, host: &HostAddr) {
    write_len_prefixed(buf, host.ip.as_bytes());
    let mut port_buf = [0u8; 4];
    NativeEndian::write_u32(&mut port_buf, host.port);
    buf.extend_from_slice(&port_buf);
}

fn read_host(buf: &[u8], off: &mut usize) -> Result<HostAddr> {
    let ip_bytes = read_len_prefixed(buf, off)?;
    let ip = String::from_utf8(ip_bytes)
        .map_err(|e| Error::InvalidData(format!("invalid utf8 host ip: {e}")))?;
    if *off + 4 > buf.len() {
        return Err(Error::InvalidData("truncated host port".into()));
    }
    let port = NativeEndian::read_u32(&buf[*off..*off + 4]);
    *off += 4;
    Ok(HostAddr { ip, port })
}

impl LogRecord {
    /// Encode this record to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        let mut ts_buf = [0u8; 8];
        NativeEndian::write_u64(&mut ts_buf, self.timestamp);
        buf.extend_from_slice(&ts_buf);

        match &self.payload {
            LogPayload::Heartbeat => {}
            LogPayload::Put { key, value } => {
                buf.push(OpCode::Put as u8);
                write_len_prefixed(&mut buf, key);
                write_len_prefixed(&mut buf, value);
            }
            LogPayload::MultiPut { pairs } => {
                buf.push(OpCode::MultiPut as u8);
                let mut count_buf = [0u8; 4];
                NativeEndian::write_u32(&mut count_buf, (pairs.len() * 2) as u32);
                buf.extend_from_slice(&count_buf);
                for (k, v) in pairs {
                    write_len_prefixed(&mut buf, k);
                    write_len_prefixed(&mut buf, v);
                }
            }
            LogPayload::Remove { key } => {
                buf.push(OpCode::Remove as u8);
                write_len_prefixed(&mut buf, key);
            }
            LogPayload::MultiRemove { keys } => {
                buf.push(OpCode::MultiRemove as u8);
                let mut count_buf = [0u8; 4];
                NativeEndian::write_u32(&mut count_buf, keys.len() as u32);
                buf.extend_from_slice(&count_buf);
                for k in keys {
                    write_len_prefixed(&mut buf, k);
                }
            }
            LogPayload::RemoveRange { start, end } => {
                buf.push(OpCode::RemoveRange as u8);
                write_len_prefixed(&mut buf, start);
                write_len_prefixed(&mut buf, end);
            }
            LogPayload::BatchWrite { ops } => {
                buf.push(OpCode::BatchWrite as u8);
                let mut count_buf = [0u8; 4];
                NativeEndian::write_u32(&mut count_buf, ops.len() as u32);
                buf.extend_from_slice(&count_buf);
                for op in ops {
                    match op {
                        BatchSubOp::Put(k, v) => {
                            buf.push(0);
                            write_len_prefixed(&mut buf, k);
                            write_len_prefixed(&mut buf, v);
                        }
                        BatchSubOp::Remove(k) => {
                            buf.push(1);
                            write_len_prefixed(&mut buf, k);
                            write_len_prefixed(&mut buf, &[]);
                        }
                        BatchSubOp::RemoveRange(s, e) => {
                            buf.push(2);
                            write_len_prefixed(&mut buf, s);
                            write_len_prefixed(&mut buf, e);
                        }
                    }
                }
            }
            LogPayload::AddPeer { host } => {
                buf.push(OpCode::AddPeer as u8);
                write_host(&mut buf, host);
            }
            LogPayload::AddLearner { host } => {
                buf.push(OpCode::AddLearner as u8);
                write_host(&mut buf, host);
            }
            LogPayload::RemovePeer { host } => {
                buf.push(OpCode::RemovePeer as u8);
                write_host(&mut buf, host);
            }
            LogPayload::TransLeader { host } => {
                buf.push(OpCode::TransLeader as u8);
                write_host(&mut buf, host);
            }
        }
        buf
    }

    /// Decode a record from its wire form. An empty payload (only the
    /// 8-byte timestamp present) decodes to [`LogPayload::Heartbeat`].
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::InvalidData("log record shorter than timestamp".into()));
        }
        let timestamp = NativeEndian::read_u64(&buf[0..8]);
        if buf.len() == 8 {
            return Ok(Self {
                timestamp,
                payload: LogPayload::Heartbeat,
            });
        }
        let op = OpCode::from_u8(buf[8])?;
        let mut off = 9;
        let payload = match op {
            OpCode::Put => {
                let key = read_len_prefixed(buf, &mut off)?;
                let value = read_len_prefixed(buf, &mut off)?;
                LogPayload::Put { key, value }
            }
            OpCode::MultiPut => {
                let count = NativeEndian::read_u32(&buf[off..off + 4]) as usize;
                off += 4;
                let mut pairs = Vec::with_capacity(count / 2);
                for _ in 0..(count / 2) {
                    let k = read_len_prefixed(buf, &mut off)?;
                    let v = read_len_prefixed(buf, &mut off)?;
                    pairs.push((k, v));
                }
                LogPayload::MultiPut { pairs }
            }
            OpCode::Remove => {
                let key = read_len_prefixed(buf, &mut off)?;
                LogPayload::Remove { key }
            }
            OpCode::MultiRemove => {
                let count = NativeEndian::read_u32(&buf[off..off + 4]) as usize;
                off += 4;
                let mut keys = Vec::with_capacity(count);
                for _ in 0..count {
                    keys.push(read_len_prefixed(buf, &mut off)?);
                }
                LogPayload::MultiRemove { keys }
            }
            OpCode::RemoveRange => {
                let start = read_len_prefixed(buf, &mut off)?;
                let end = read_len_prefixed(buf, &mut off)?;
                LogPayload::RemoveRange { start, end }
            }
            OpCode::BatchWrite => {
                let count = NativeEndian::read_u32(&buf[off..off + 4]) as usize;
                off += 4;
                let mut ops = Vec::with_capacity(count);
                for _ in 0..count {
                    if off >= buf.len() {
                        return Err(Error::InvalidData("truncated batch write".into()));
                    }
                    let sub_op = buf[off];
                    off += 1;
                    let a = read_len_prefixed(buf, &mut off)?;
                    let b = read_len_prefixed(buf, &mut off)?;
                    ops.push(match sub_op {
                        0 => BatchSubOp::Put(a, b),
                        1 => BatchSubOp::Remove(a),
                        2 => BatchSubOp::RemoveRange(a, b),
                        other => {
                            return Err(Error::InvalidData(format!(
                                "unknown batch sub-op {other}"
                            )))
                        }
                    });
                }
                LogPayload::BatchWrite { ops }
            }
            OpCode::AddPeer => LogPayload::AddPeer {
                host: read_host(buf, &mut off)?,
            },
            OpCode::AddLearner => LogPayload::AddLearner {
                host: read_host(buf, &mut off)?,
            },
            OpCode::RemovePeer => LogPayload::RemovePeer {
                host: read_host(buf, &mut off)?,
            },
            OpCode::TransLeader => LogPayload::TransLeader {
                host: read_host(buf, &mut off)?,
            },
        };
        Ok(Self { timestamp, payload })
    }
}

/// Encode a snapshot batch row: `keyLen(4) || key || valueLen(4) || value`.
pub fn encode_snapshot_row(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + key.len() + value.len());
    write_len_prefixed(&mut buf, key);
    write_len_prefixed(&mut buf, value);
    buf
}

/// Decode a single length-prefixed `(key, value)` pair starting at `off`,
/// advancing `off` past it.
pub fn decode_snapshot_row(buf: &[u8], off: &mut usize) -> Result<(Vec<u8>, Vec<u8>)> {
    let key = read_len_prefixed(buf, off)?;
    let value = read_len_prefixed(buf, off)?;
    Ok((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_roundtrip() {
        let rec = LogRecord {
            timestamp: 42,
            payload: LogPayload::Heartbeat,
        };
        let buf = rec.encode();
        assert_eq!(buf.len(), 8);
        assert_eq!(LogRecord::decode(&buf).unwrap(), rec);
    }

    #[test]
    fn put_roundtrip() {
        let rec = LogRecord {
            timestamp: 1,
            payload: LogPayload::Put {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
        };
        let buf = rec.encode();
        assert_eq!(LogRecord::decode(&buf).unwrap(), rec);
    }

    #[test]
    fn multi_put_roundtrip() {
        let rec = LogRecord {
            timestamp: 2,
            payload: LogPayload::MultiPut {
                pairs: vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())],
            },
        };
        let buf = rec.encode();
        assert_eq!(LogRecord::decode(&buf).unwrap(), rec);
    }

    #[test]
    fn batch_write_roundtrip() {
        let rec = LogRecord {
            timestamp: 3,
            payload: LogPayload::BatchWrite {
                ops: vec![
                    BatchSubOp::Put(b"k1".to_vec(), b"v1".to_vec()),
                    BatchSubOp::Remove(b"k2".to_vec()),
                    BatchSubOp::RemoveRange(b"s".to_vec(), b"e".to_vec()),
                ],
            },
        };
        let buf = rec.encode();
        assert_eq!(LogRecord::decode(&buf).unwrap(), rec);
    }

    #[test]
    fn membership_change_roundtrip() {
        let rec = LogRecord {
            timestamp: 4,
            payload: LogPayload::AddPeer {
                host: HostAddr {
                    ip: "10.0.0.1".into(),
                    port: 9999,
                },
            },
        };
        let buf = rec.encode();
        assert_eq!(LogRecord::decode(&buf).unwrap(), rec);
    }

    #[test]
    fn snapshot_row_roundtrip() {
        let buf = encode_snapshot_row(b"key", b"value");
        let mut off = 0;
        let (k, v) = decode_snapshot_row(&buf, &mut off).unwrap();
        assert_eq!(k, b"key");
        assert_eq!(v, b"value");
        assert_eq!(off, buf.len());
    }
}
