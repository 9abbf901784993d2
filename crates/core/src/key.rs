//! Bit-exact key layout (§3, §6.1).
//!
//! Every key begins with a 4-byte big-endian prefix word
//! `(partId << 8) | keyType`. Big-endian is deliberate (as for the
//! operation-log timestamp in §6.1): it makes the partition id the most
//! significant sort key, so a prefix scan over one partition's key space
//! never wanders into another partition's rows, and within a partition the
//! low byte groups rows by key type.
//!
//! Signed fields (`EdgeType`, `rank`) are stored with their sign bit
//! flipped so that unsigned lexicographic byte comparison matches signed
//! numeric order — this is not spelled out explicitly in the key-layout
//! table but is required for the "index keys sort in field-value order"
//! invariant to hold when a field or rank is negative; see `DESIGN.md` for
//! the recorded open-question resolution.

use crate::error::{Error, Result};
use crate::ids::{EdgeType, IndexId, PartitionId, TagId, VertexId};
use byteorder::{BigEndian, ByteOrder};

/// Low byte of the key prefix, discriminating the six key families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyType {
    /// Vertex attribute row (tag).
    Tag = 0x01,
    /// Edge row.
    Edge = 0x02,
    /// Secondary index row.
    Index = 0x03,
    /// Per-partition Raft commit marker.
    SystemCommit = 0x04,
    /// Index-rebuild operation-log entry.
    Operation = 0x05,
    /// Optional vertex-existence marker.
    Vertex = 0x06,
}

/// Literal byte written for the [`KeyType::SystemCommit`] key's single-byte
/// suffix, per §3: `prefix || 'C'`.
pub const SYSTEM_COMMIT_SUFFIX: u8 = b'C';

/// Placeholder trailing byte of an edge key.
pub const EDGE_PLACEHOLDER: u8 = 0x00;

/// The 4-byte prefix shared by every key in one partition/key-type pair.
pub fn prefix(part_id: PartitionId, key_type: KeyType) -> [u8; 4] {
    let word = (part_id.get() << 8) | key_type as u32;
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, word);
    buf
}

/// Just the partition prefix (all key types), used for `removePart`'s
/// six-prefix range delete when the type byte varies but the caller wants
/// every type for a partition individually (see [`crate::key::all_type_prefixes`]).
pub fn all_type_prefixes(part_id: PartitionId) -> [[u8; 4]; 6] {
    [
        prefix(part_id, KeyType::Tag),
        prefix(part_id, KeyType::Edge),
        prefix(part_id, KeyType::Index),
        prefix(part_id, KeyType::Operation),
        prefix(part_id, KeyType::Vertex),
        prefix(part_id, KeyType::SystemCommit),
    ]
}

fn encode_i32_ordered(v: i32) -> [u8; 4] {
    let flipped = (v as u32) ^ (1u32 << 31);
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, flipped);
    buf
}

fn decode_i32_ordered(b: &[u8]) -> i32 {
    let flipped = BigEndian::read_u32(b);
    (flipped ^ (1u32 << 31)) as i32
}

fn encode_i64_ordered(v: i64) -> [u8; 8] {
    let flipped = (v as u64) ^ (1u64 << 63);
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, flipped);
    buf
}

fn decode_i64_ordered(b: &[u8]) -> i64 {
    let flipped = BigEndian::read_u64(b);
    (flipped ^ (1u64 << 63)) as i64
}

/// Encode a `Tag` key: `prefix || vid(vidLen) || tagId(4)`.
pub fn tag_key(part_id: PartitionId, vid: &VertexId, vid_len: usize, tag_id: TagId) -> Result<Vec<u8>> {
    let mut key = Vec::with_capacity(4 + vid_len + 4);
    key.extend_from_slice(&prefix(part_id, KeyType::Tag));
    key.extend_from_slice(&vid.encode(vid_len)?);
    let mut tag_buf = [0u8; 4];
    BigEndian::write_u32(&mut tag_buf, tag_id.get());
    key.extend_from_slice(&tag_buf);
    Ok(key)
}

/// Encode an `Edge` key:
/// `prefix || srcVid(vidLen) || edgeType(4, signed) || rank(8) || dstVid(vidLen) || placeholder(1)`.
pub fn edge_key(
    part_id: PartitionId,
    src: &VertexId,
    edge_type: EdgeType,
    rank: i64,
    dst: &VertexId,
    vid_len: usize,
) -> Result<Vec<u8>> {
    let mut key = Vec::with_capacity(4 + vid_len * 2 + 4 + 8 + 1);
    key.extend_from_slice(&prefix(part_id, KeyType::Edge));
    key.extend_from_slice(&src.encode(vid_len)?);
    key.extend_from_slice(&encode_i32_ordered(edge_type.get()));
    key.extend_from_slice(&encode_i64_ordered(rank));
    key.extend_from_slice(&dst.encode(vid_len)?);
    key.push(EDGE_PLACEHOLDER);
    Ok(key)
}

/// Decompose an edge key back into its fields. `vid_len` must match the
/// space's configured VID length used to encode it.
pub fn decode_edge_key(key: &[u8], vid_len: usize) -> Result<(VertexId, EdgeType, i64, VertexId)> {
    let expected = 4 + vid_len * 2 + 4 + 8 + 1;
    if key.len() != expected {
        return Err(Error::InvalidData(format!(
            "edge key has {} bytes, expected {}",
            key.len(),
            expected
        )));
    }
    let mut off = 4;
    let src = key[off..off + vid_len].to_vec();
    off += vid_len;
    let edge_type = decode_i32_ordered(&key[off..off + 4]);
    off += 4;
    let rank = decode_i64_ordered(&key[off..off + 8]);
    off += 8;
    let dst = key[off..off + vid_len].to_vec();
    Ok((
        VertexId::Bytes(src),
        EdgeType::new(edge_type),
        rank,
        VertexId::Bytes(dst),
    ))
}

/// Encode an `Index` key for a tag index:
/// `prefix || indexId(4) || encodedFieldValues || vid(vidLen)`.
pub fn tag_index_key(
    part_id: PartitionId,
    index_id: IndexId,
    encoded_field_values: &[u8],
    vid: &VertexId,
    vid_len: usize,
) -> Result<Vec<u8>> {
    let mut key = Vec::with_capacity(4 + 4 + encoded_field_values.len() + vid_len);
    key.extend_from_slice(&prefix(part_id, KeyType::Index));
    let mut id_buf = [0u8; 4];
    BigEndian::write_u32(&mut id_buf, index_id.0);
    key.extend_from_slice(&id_buf);
    key.extend_from_slice(encoded_field_values);
    key.extend_from_slice(&vid.encode(vid_len)?);
    Ok(key)
}

/// Encode an `Index` key for an edge index:
/// `prefix || indexId(4) || encodedFieldValues || srcVid || rank || dstVid`.
pub fn edge_index_key(
    part_id: PartitionId,
    index_id: IndexId,
    encoded_field_values: &[u8],
    src: &VertexId,
    rank: i64,
    dst: &VertexId,
    vid_len: usize,
) -> Result<Vec<u8>> {
    let mut key =
        Vec::with_capacity(4 + 4 + encoded_field_values.len() + vid_len * 2 + 8);
    key.extend_from_slice(&prefix(part_id, KeyType::Index));
    let mut id_buf = [0u8; 4];
    BigEndian::write_u32(&mut id_buf, index_id.0);
    key.extend_from_slice(&id_buf);
    key.extend_from_slice(encoded_field_values);
    key.extend_from_slice(&src.encode(vid_len)?);
    key.extend_from_slice(&encode_i64_ordered(rank));
    key.extend_from_slice(&dst.encode(vid_len)?);
    Ok(key)
}

/// Encode the per-partition `SystemCommit` key: `prefix || 'C'`.
pub fn system_commit_key(part_id: PartitionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(5);
    key.extend_from_slice(&prefix(part_id, KeyType::SystemCommit));
    key.push(SYSTEM_COMMIT_SUFFIX);
    key
}

/// Encode the `SystemCommit` value: `lastCommittedLogId(8) || lastCommittedLogTerm(8)`.
pub fn encode_commit_marker(last_log_id: u64, last_log_term: u64) -> Vec<u8> {
    let mut buf = [0u8; 16];
    BigEndian::write_u64(&mut buf[0..8], last_log_id);
    BigEndian::write_u64(&mut buf[8..16], last_log_term);
    buf.to_vec()
}

/// Decode a `SystemCommit` value back into `(lastLogId, lastLogTerm)`.
pub fn decode_commit_marker(value: &[u8]) -> Result<(u64, u64)> {
    if value.len() != 16 {
        return Err(Error::InvalidData(format!(
            "commit marker has {} bytes, expected 16",
            value.len()
        )));
    }
    Ok((
        BigEndian::read_u64(&value[0..8]),
        BigEndian::read_u64(&value[8..16]),
    ))
}

/// Encode an `Operation` (index-rebuild replay log) key:
/// `prefix || microsTs(8, big-endian) || opType(4) || payload`.
///
/// The big-endian microsecond timestamp is deliberate: lexicographic key
/// order equals chronological order, so a prefix scan replays operations in
/// the order they were recorded.
pub fn operation_key(part_id: PartitionId, micros_ts: u64, op_type: OperationType, payload: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + 8 + 4 + payload.len());
    key.extend_from_slice(&prefix(part_id, KeyType::Operation));
    let mut ts_buf = [0u8; 8];
    BigEndian::write_u64(&mut ts_buf, micros_ts);
    key.extend_from_slice(&ts_buf);
    let mut op_buf = [0u8; 4];
    BigEndian::write_u32(&mut op_buf, op_type as u32);
    key.extend_from_slice(&op_buf);
    key.extend_from_slice(payload);
    key
}

/// The prefix used to scan all operation-log entries for a partition.
pub fn operation_prefix(part_id: PartitionId) -> Vec<u8> {
    prefix(part_id, KeyType::Operation).to_vec()
}

/// Operation-log entry discriminator, embedded as the 4-byte `opType` field
/// of an [`operation_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OperationType {
    /// "Please index this key" — carried in the key; value is empty.
    Modify = 1,
    /// "Please remove this index key" — the index key itself is carried in
    /// the *value*, not the operation key.
    Delete = 2,
}

/// Whether an operation-log key denotes a modify (index-insert) entry.
pub fn is_modify_operation(key: &[u8]) -> bool {
    key.len() >= 16 && BigEndian::read_u32(&key[12..16]) == OperationType::Modify as u32
}

/// Whether an operation-log key denotes a delete (index-remove) entry.
pub fn is_delete_operation(key: &[u8]) -> bool {
    key.len() >= 16 && BigEndian::read_u32(&key[12..16]) == OperationType::Delete as u32
}

/// Extract the target index key embedded as the payload of a `Modify`
/// operation-log key.
pub fn modify_operation_target(key: &[u8]) -> &[u8] {
    &key[16..]
}

/// Encode the `Vertex` existence-marker key: `prefix || vid(vidLen)`.
pub fn vertex_key(part_id: PartitionId, vid: &VertexId, vid_len: usize) -> Result<Vec<u8>> {
    let mut key = Vec::with_capacity(4 + vid_len);
    key.extend_from_slice(&prefix(part_id, KeyType::Vertex));
    key.extend_from_slice(&vid.encode(vid_len)?);
    Ok(key)
}

/// Extract the partition id encoded in a key's 4-byte prefix.
pub fn part_id_of(key: &[u8]) -> Option<PartitionId> {
    if key.len() < 4 {
        return None;
    }
    let word = BigEndian::read_u32(&key[0..4]);
    Some(PartitionId::new(word >> 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_orders_by_partition_then_type() {
        let p1_tag = prefix(PartitionId::new(1), KeyType::Tag);
        let p1_edge = prefix(PartitionId::new(1), KeyType::Edge);
        let p2_tag = prefix(PartitionId::new(2), KeyType::Tag);
        assert!(p1_tag < p1_edge);
        assert!(p1_edge < p2_tag);
    }

    #[test]
    fn tag_key_roundtrip_partition() {
        let vid = VertexId::Bytes(b"v1".to_vec());
        let key = tag_key(PartitionId::new(7), &vid, 8, TagId::new(3)).unwrap();
        assert_eq!(part_id_of(&key), Some(PartitionId::new(7)));
        assert_eq!(key.len(), 4 + 8 + 4);
    }

    #[test]
    fn edge_key_roundtrip() {
        let src = VertexId::Bytes(b"alice".to_vec());
        let dst = VertexId::Bytes(b"bob".to_vec());
        let key = edge_key(PartitionId::new(1), &src, EdgeType::new(-5), -42, &dst, 8).unwrap();
        let (dec_src, dec_type, dec_rank, dec_dst) = decode_edge_key(&key, 8).unwrap();
        assert_eq!(dec_src, VertexId::Bytes(b"alice\0\0\0".to_vec()));
        assert_eq!(dec_type, EdgeType::new(-5));
        assert_eq!(dec_rank, -42);
        assert_eq!(dec_dst, VertexId::Bytes(b"bob\0\0\0\0\0".to_vec()));
    }

    #[test]
    fn signed_ordering_matches_numeric_order() {
        let a = encode_i64_ordered(-100);
        let b = encode_i64_ordered(-1);
        let c = encode_i64_ordered(0);
        let d = encode_i64_ordered(100);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn index_key_sorts_before_trailing_vid_varies() {
        let vid1 = VertexId::Bytes(b"a".to_vec());
        let vid2 = VertexId::Bytes(b"b".to_vec());
        let k1 = tag_index_key(PartitionId::new(1), IndexId::new(1), b"field", &vid1, 4).unwrap();
        let k2 = tag_index_key(PartitionId::new(1), IndexId::new(1), b"field", &vid2, 4).unwrap();
        assert!(k1 < k2);
    }

    #[test]
    fn system_commit_key_is_single_suffix_byte() {
        let key = system_commit_key(PartitionId::new(3));
        assert_eq!(key.len(), 5);
        assert_eq!(*key.last().unwrap(), SYSTEM_COMMIT_SUFFIX);
    }

    #[test]
    fn commit_marker_roundtrip() {
        let buf = encode_commit_marker(42, 7);
        assert_eq!(decode_commit_marker(&buf).unwrap(), (42, 7));
    }

    #[test]
    fn operation_keys_sort_chronologically() {
        let k1 = operation_key(PartitionId::new(1), 100, OperationType::Modify, b"a");
        let k2 = operation_key(PartitionId::new(1), 200, OperationType::Modify, b"a");
        assert!(k1 < k2);
        assert!(is_modify_operation(&k1));
        assert!(!is_delete_operation(&k1));
    }

    #[test]
    fn vid_too_long_is_invalid_vid_error() {
        let vid = VertexId::Bytes(vec![0u8; 20]);
        let err = vid.encode(8).unwrap_err();
        assert!(matches!(err, Error::InvalidVid(_)));
    }

    proptest::proptest! {
        #[test]
        fn encode_i64_ordered_preserves_numeric_order(a: i64, b: i64) {
            let encoded_a = encode_i64_ordered(a);
            let encoded_b = encode_i64_ordered(b);
            prop_assert_eq!(a.cmp(&b), encoded_a.cmp(&encoded_b));
        }

        #[test]
        fn commit_marker_roundtrips_for_any_ids(log_id: u64, term: u64) {
            let buf = encode_commit_marker(log_id, term);
            prop_assert_eq!(decode_commit_marker(&buf).unwrap(), (log_id, term));
        }

        #[test]
        fn int_vid_encode_preserves_numeric_order(a: i64, b: i64) {
            let encoded_a = VertexId::Int(a).encode(8).unwrap();
            let encoded_b = VertexId::Int(b).encode(8).unwrap();
            prop_assert_eq!(a.cmp(&b), encoded_a.cmp(&encoded_b));
        }
    }
}
