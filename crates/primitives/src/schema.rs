//! Field values and the order-preserving encoding used to build index keys
//! (§3's "encodedFieldValues" blob, §4.7's `IndexKeyUtils`).
//!
//! The row codec itself (schema registry, wire format for tag/edge property
//! rows) is an external collaborator per spec §1; what lives here is just
//! enough to derive a byte-comparable index key from a tuple of field
//! values, and to decode a row's raw column bytes back into values when a
//! write processor or the rebuild task needs to read the field a row's
//! index depends on.

use graphstore_core::{Error, IndexId, Result, TagId};

/// A single field value, typed loosely enough to cover every column kind an
/// index can be defined over. Strings carry raw bytes rather than `String`
/// so invalid UTF-8 in existing data never blocks an index rebuild.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// SQL-style absent value; sorts before every other variant.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// IEEE-754 double.
    Float(f64),
    /// Raw byte string (UTF-8 text or opaque bytes).
    String(Vec<u8>),
}

/// One column this index is defined over, addressed by its 0-based offset
/// in the row's encoded field list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexField {
    /// Offset of the column in the row's decoded field vector.
    pub field_offset: usize,
}

/// A secondary index definition: the tag or edge type it is defined over,
/// the ordered fields it indexes, and an optional TTL column carried in the
/// index value so expiry can be checked without a round trip to the data
/// row.
#[derive(Debug, Clone)]
pub struct IndexDef {
    /// This index's id, embedded in every index key it produces.
    pub index_id: IndexId,
    /// Tag this index covers, or `None` for an edge index.
    pub tag_id: Option<TagId>,
    /// Fields making up the index key, in key order.
    pub fields: Vec<IndexField>,
    /// Offset of a TTL column to carry in the index value, if any.
    pub ttl_field_offset: Option<usize>,
}

/// Type tags for [`FieldValue`] ordered encoding. Chosen so that, within a
/// single index field (always the same declared column type), the tag byte
/// never varies and so never perturbs comparisons; it exists only to make
/// decoding unambiguous.
const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STRING: u8 = 0x04;

/// Encode one field value into its order-preserving byte representation and
/// append it to `out`.
///
/// Integers and floats are encoded sign-bit-flipped big-endian so unsigned
/// lexicographic order matches signed/IEEE-754 numeric order, mirroring
/// `graphstore_core::key`'s VID/rank encoding. Strings are escaped
/// (`0x00` → `0x00 0xFF`) and terminated with `0x00 0x00` so that
/// concatenating several encoded fields into one `encodedFieldValues` blob
/// never lets one field's bytes bleed into the next field's ordering.
pub fn encode_field_ordered(value: &FieldValue, out: &mut Vec<u8>) {
    match value {
        FieldValue::Null => out.push(TAG_NULL),
        FieldValue::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(if *b { 1 } else { 0 });
        }
        FieldValue::Int(v) => {
            out.push(TAG_INT);
            let flipped = (*v as u64) ^ (1u64 << 63);
            out.extend_from_slice(&flipped.to_be_bytes());
        }
        FieldValue::Float(v) => {
            out.push(TAG_FLOAT);
            let bits = v.to_bits();
            let flipped = if bits & (1u64 << 63) != 0 { !bits } else { bits | (1u64 << 63) };
            out.extend_from_slice(&flipped.to_be_bytes());
        }
        FieldValue::String(s) => {
            out.push(TAG_STRING);
            for &b in s {
                if b == 0x00 {
                    out.push(0x00);
                    out.push(0xFF);
                } else {
                    out.push(b);
                }
            }
            out.push(0x00);
            out.push(0x00);
        }
    }
}

/// Encode a tuple of field values, in index-field order, into one
/// `encodedFieldValues` blob suitable for [`graphstore_core::key::tag_index_key`]
/// / [`graphstore_core::key::edge_index_key`].
pub fn encode_field_values_ordered(values: &[FieldValue]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        encode_field_ordered(value, &mut out);
    }
    out
}

/// Decode one field value starting at `off`, advancing it past the bytes
/// consumed. Used by tests and by tooling that inspects an index key's
/// field values directly (rebuild diagnostics); write processors and the
/// rebuild task only ever need the encode direction.
pub fn decode_field_ordered(buf: &[u8], off: &mut usize) -> Result<FieldValue> {
    if *off >= buf.len() {
        return Err(Error::InvalidFieldValue("truncated field tag".into()));
    }
    let tag = buf[*off];
    *off += 1;
    match tag {
        TAG_NULL => Ok(FieldValue::Null),
        TAG_BOOL => {
            if *off >= buf.len() {
                return Err(Error::InvalidFieldValue("truncated bool field".into()));
            }
            let b = buf[*off] != 0;
            *off += 1;
            Ok(FieldValue::Bool(b))
        }
        TAG_INT => {
            if *off + 8 > buf.len() {
                return Err(Error::InvalidFieldValue("truncated int field".into()));
            }
            let flipped = u64::from_be_bytes(buf[*off..*off + 8].try_into().unwrap());
            *off += 8;
            Ok(FieldValue::Int((flipped ^ (1u64 << 63)) as i64))
        }
        TAG_FLOAT => {
            if *off + 8 > buf.len() {
                return Err(Error::InvalidFieldValue("truncated float field".into()));
            }
            let flipped = u64::from_be_bytes(buf[*off..*off + 8].try_into().unwrap());
            let bits = if flipped & (1u64 << 63) != 0 { flipped & !(1u64 << 63) } else { !flipped };
            *off += 8;
            Ok(FieldValue::Float(f64::from_bits(bits)))
        }
        TAG_STRING => {
            let mut bytes = Vec::new();
            loop {
                if *off + 1 >= buf.len() {
                    return Err(Error::InvalidFieldValue("unterminated string field".into()));
                }
                match (buf[*off], buf[*off + 1]) {
                    (0x00, 0x00) => {
                        *off += 2;
                        break;
                    }
                    (0x00, 0xFF) => {
                        bytes.push(0x00);
                        *off += 2;
                    }
                    (b, _) => {
                        bytes.push(b);
                        *off += 1;
                    }
                }
            }
            Ok(FieldValue::String(bytes))
        }
        other => Err(Error::InvalidFieldValue(format!("unknown field tag {other}"))),
    }
}

/// Pull the fields an [`IndexDef`] cares about out of a row's full decoded
/// column vector, in index order.
pub fn project_index_fields(def: &IndexDef, row_fields: &[FieldValue]) -> Result<Vec<FieldValue>> {
    def.fields
        .iter()
        .map(|f| {
            row_fields
                .get(f.field_offset)
                .cloned()
                .ok_or_else(|| Error::InvalidFieldValue(format!("row missing field at offset {}", f.field_offset)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_ordering_matches_numeric_order() {
        let a = encode_field_values_ordered(&[FieldValue::Int(-100)]);
        let b = encode_field_values_ordered(&[FieldValue::Int(-1)]);
        let c = encode_field_values_ordered(&[FieldValue::Int(0)]);
        let d = encode_field_values_ordered(&[FieldValue::Int(100)]);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn float_ordering_matches_numeric_order() {
        let a = encode_field_values_ordered(&[FieldValue::Float(-1.5)]);
        let b = encode_field_values_ordered(&[FieldValue::Float(-0.1)]);
        let c = encode_field_values_ordered(&[FieldValue::Float(0.0)]);
        let d = encode_field_values_ordered(&[FieldValue::Float(2.75)]);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn string_field_roundtrips_through_decode() {
        let encoded = encode_field_values_ordered(&[FieldValue::String(b"a\x00b".to_vec())]);
        let mut off = 0;
        let decoded = decode_field_ordered(&encoded, &mut off).unwrap();
        assert_eq!(decoded, FieldValue::String(b"a\x00b".to_vec()));
        assert_eq!(off, encoded.len());
    }

    #[test]
    fn string_field_escaping_preserves_order() {
        let a = encode_field_values_ordered(&[FieldValue::String(b"abc".to_vec())]);
        let b = encode_field_values_ordered(&[FieldValue::String(b"abd".to_vec())]);
        let c = encode_field_values_ordered(&[FieldValue::String(b"ab".to_vec())]);
        assert!(c < a);
        assert!(a < b);
    }

    #[test]
    fn multi_field_tuple_decodes_in_order() {
        let values = vec![FieldValue::Int(7), FieldValue::String(b"x".to_vec()), FieldValue::Bool(true)];
        let encoded = encode_field_values_ordered(&values);
        let mut off = 0;
        let mut decoded = Vec::new();
        while off < encoded.len() {
            decoded.push(decode_field_ordered(&encoded, &mut off).unwrap());
        }
        assert_eq!(decoded, values);
    }

    proptest::proptest! {
        #[test]
        fn int_field_ordering_matches_numeric_order_for_any_pair(a: i64, b: i64) {
            let encoded_a = encode_field_values_ordered(&[FieldValue::Int(a)]);
            let encoded_b = encode_field_values_ordered(&[FieldValue::Int(b)]);
            prop_assert_eq!(a.cmp(&b), encoded_a.cmp(&encoded_b));
        }

        #[test]
        fn string_field_roundtrips_for_any_bytes(s in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..32)) {
            let encoded = encode_field_values_ordered(&[FieldValue::String(s.clone())]);
            let mut off = 0;
            let decoded = decode_field_ordered(&encoded, &mut off).unwrap();
            prop_assert_eq!(decoded, FieldValue::String(s));
            prop_assert_eq!(off, encoded.len());
        }
    }
}
