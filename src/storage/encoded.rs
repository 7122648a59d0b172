use crate::doc::value::DataValue;
use crate::error::QuillError;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Scan bounds default to `[.., SCAN_KEY_SENTINEL)`; every scan key emitted
/// by a scan is strictly below it, so a split key left at the sentinel means
/// the scan completed.
pub const SCAN_KEY_SENTINEL: &[u8] = &[0xFF];

const TAG_NULL: u8 = 0x05;
const TAG_NUMBER: u8 = 0x10;
const TAG_TEXT: u8 = 0x20;
const TAG_BYTES: u8 = 0x28;
const TAG_BOOL: u8 = 0x30;
const TAG_ARRAY: u8 = 0x40;
const TAG_OBJECT: u8 = 0x50;

/// An order-preserving byte encoding of one or more scalar values.
///
/// Lexicographic comparison of encoded keys matches the value ordering used
/// everywhere else in the engine, which is what lets range predicates turn
/// into key-range reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EncodedKey {
    bytes: SmallVec<[u8; 64]>,
}

impl EncodedKey {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn from_values(values: &[DataValue]) -> Self {
        let mut out = SmallVec::<[u8; 64]>::new();
        for value in values {
            encode_key_part_into(value, &mut out);
        }
        Self { bytes: out }
    }

    pub fn from_single(value: &DataValue) -> Self {
        Self::from_values(std::slice::from_ref(value))
    }

    pub fn push_part(&mut self, value: &DataValue) {
        encode_key_part_into(value, &mut self.bytes);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes.into_vec()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Encodes one scalar as a key part. Containers have no key-part form; index
/// entries for array fields are built from the array's elements.
pub fn encode_key_part(value: &DataValue) -> Vec<u8> {
    let mut out = SmallVec::<[u8; 64]>::new();
    encode_key_part_into(value, &mut out);
    out.into_vec()
}

fn encode_key_part_into(value: &DataValue, out: &mut SmallVec<[u8; 64]>) {
    match value {
        DataValue::Null => out.push(TAG_NULL),
        DataValue::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(if *b { 1 } else { 0 });
        }
        // Both numeric widths share one encoding so that key order agrees
        // with the numeric ordering range predicates are evaluated under.
        // Integers are exact up to 2^53.
        DataValue::Int(i) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&map_double_bits(*i as f64).to_be_bytes());
        }
        DataValue::Double(f) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&map_double_bits(*f).to_be_bytes());
        }
        DataValue::Text(s) => {
            out.push(TAG_TEXT);
            append_escaped(s.as_bytes(), out);
        }
        DataValue::Bytes(b) => {
            out.push(TAG_BYTES);
            append_escaped(b, out);
        }
        // Containers appear only as cell values, never as key parts; the
        // header tag alone is enough to round-trip the shape.
        DataValue::Array(_) => out.push(TAG_ARRAY),
        DataValue::Object(_) => out.push(TAG_OBJECT),
    }
}

/// Largest magnitude a double represents exactly as an integer (2^53).
const INT_EXACT_MAX: f64 = 9_007_199_254_740_992.0;

/// Total order preserving float mapping: flip all bits of negatives, flip
/// only the sign bit of non-negatives.
fn map_double_bits(f: f64) -> u64 {
    let bits = f.to_bits();
    if (bits >> 63) == 1 {
        !bits
    } else {
        bits ^ 0x8000_0000_0000_0000
    }
}

fn unmap_double_bits(mapped: u64) -> f64 {
    let bits = if (mapped >> 63) == 0 {
        !mapped
    } else {
        mapped ^ 0x8000_0000_0000_0000
    };
    f64::from_bits(bits)
}

fn append_escaped(bytes: &[u8], out: &mut SmallVec<[u8; 64]>) {
    for byte in bytes {
        if *byte == 0 {
            // Escape interior nulls so the terminator remains unambiguous.
            out.extend_from_slice(&[0x00, 0xFF]);
        } else {
            out.push(*byte);
        }
    }
    out.push(0x00);
}

/// Decodes the key part starting at `bytes[0]`, returning the value and how
/// many bytes it occupied.
pub fn decode_key_part(bytes: &[u8]) -> Result<(DataValue, usize), QuillError> {
    let tag = *bytes
        .first()
        .ok_or_else(|| QuillError::Decode("empty key part".into()))?;
    match tag {
        TAG_NULL => Ok((DataValue::Null, 1)),
        TAG_BOOL => {
            let b = *bytes
                .get(1)
                .ok_or_else(|| QuillError::Decode("truncated bool".into()))?;
            Ok((DataValue::Bool(b != 0), 2))
        }
        TAG_NUMBER => {
            let raw: [u8; 8] = bytes
                .get(1..9)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| QuillError::Decode("truncated number".into()))?;
            let value = unmap_double_bits(u64::from_be_bytes(raw));
            // Integral values in the exact range come back as integers;
            // everything else keeps the double width.
            if value.fract() == 0.0
                && value.abs() <= INT_EXACT_MAX
                && !(value == 0.0 && value.is_sign_negative())
            {
                Ok((DataValue::Int(value as i64), 9))
            } else {
                Ok((DataValue::Double(value), 9))
            }
        }
        TAG_TEXT | TAG_BYTES => {
            let (raw, used) = decode_escaped(&bytes[1..])?;
            let value = if tag == TAG_TEXT {
                DataValue::Text(
                    String::from_utf8(raw).map_err(|e| QuillError::Decode(e.to_string()))?,
                )
            } else {
                DataValue::Bytes(raw)
            };
            Ok((value, 1 + used))
        }
        TAG_ARRAY => Ok((DataValue::Array(Vec::new()), 1)),
        TAG_OBJECT => Ok((DataValue::Object(Vec::new()), 1)),
        other => Err(QuillError::Decode(format!("unknown key tag {other:#04x}"))),
    }
}

fn decode_escaped(bytes: &[u8]) -> Result<(Vec<u8>, usize), QuillError> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == 0 {
            if bytes.get(i + 1) == Some(&0xFF) {
                out.push(0);
                i += 2;
            } else {
                return Ok((out, i + 1));
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Err(QuillError::Decode("unterminated byte string".into()))
}

/// Length in bytes of the first key part of `bytes`.
pub fn first_key_part_len(bytes: &[u8]) -> Result<usize, QuillError> {
    decode_key_part(bytes).map(|(_, len)| len)
}

/// Splits a key into its constituent encoded parts.
pub fn split_key_parts(mut bytes: &[u8]) -> Result<Vec<&[u8]>, QuillError> {
    let mut parts = Vec::new();
    while !bytes.is_empty() {
        let len = first_key_part_len(bytes)?;
        parts.push(&bytes[..len]);
        bytes = &bytes[len..];
    }
    Ok(parts)
}

/// Smallest key strictly greater than every key with prefix `prefix`.
/// Returns the sentinel when the prefix is all 0xFF bytes.
pub fn prefix_successor(prefix: &[u8]) -> Vec<u8> {
    let mut next = prefix.to_vec();
    for i in (0..next.len()).rev() {
        if next[i] != 0xFF {
            next[i] += 1;
            next.truncate(i + 1);
            return next;
        }
    }
    SCAN_KEY_SENTINEL.to_vec()
}

/// Smallest key strictly greater than `key` itself.
pub fn key_after(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0x00);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::value::DataValue;

    #[test]
    fn integer_order_is_preserved() {
        let a = EncodedKey::from_single(&DataValue::Int(-1));
        let b = EncodedKey::from_single(&DataValue::Int(0));
        let c = EncodedKey::from_single(&DataValue::Int(42));
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn double_order_is_preserved() {
        let values = [-1e9, -1.5, -0.0, 0.0, 2.5, 1e18];
        for pair in values.windows(2) {
            let lo = encode_key_part(&DataValue::Double(pair[0]));
            let hi = encode_key_part(&DataValue::Double(pair[1]));
            assert!(lo <= hi, "{} !<= {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn numeric_widths_share_one_key_order() {
        assert_eq!(
            encode_key_part(&DataValue::Int(3)),
            encode_key_part(&DataValue::Double(3.0))
        );
        let two_and_a_half = encode_key_part(&DataValue::Double(2.5));
        assert!(encode_key_part(&DataValue::Int(2)) < two_and_a_half);
        assert!(two_and_a_half < encode_key_part(&DataValue::Int(3)));
        assert!(
            encode_key_part(&DataValue::Double(-0.5)) < encode_key_part(&DataValue::Int(0))
        );
    }

    #[test]
    fn integral_doubles_decode_as_integers() {
        let (value, _) =
            decode_key_part(&encode_key_part(&DataValue::Double(42.0))).expect("decode");
        assert_eq!(value, DataValue::Int(42));
        let (value, _) =
            decode_key_part(&encode_key_part(&DataValue::Double(0.5))).expect("decode");
        assert_eq!(value, DataValue::Double(0.5));
        let (value, _) =
            decode_key_part(&encode_key_part(&DataValue::Double(1e300))).expect("decode");
        assert_eq!(value, DataValue::Double(1e300));
    }

    #[test]
    fn composite_order_is_lexicographic() {
        let a = EncodedKey::from_values(&[DataValue::Int(1), DataValue::Text("a".into())]);
        let b = EncodedKey::from_values(&[DataValue::Int(1), DataValue::Text("b".into())]);
        let c = EncodedKey::from_values(&[DataValue::Int(2), DataValue::Text("a".into())]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn key_parts_round_trip() {
        let values = [
            DataValue::Null,
            DataValue::Bool(true),
            DataValue::Int(-77),
            DataValue::Double(3.25),
            DataValue::Text("with\0null".into()),
            DataValue::Bytes(vec![0, 1, 0xFF]),
        ];
        let key = EncodedKey::from_values(&values);
        let mut rest = key.as_slice();
        for expected in &values {
            let (got, len) = decode_key_part(rest).expect("decode");
            assert_eq!(&got, expected);
            rest = &rest[len..];
        }
        assert!(rest.is_empty());
    }

    #[test]
    fn split_key_parts_finds_boundaries() {
        let key = EncodedKey::from_values(&[
            DataValue::Text("tags".into()),
            DataValue::Int(3),
            DataValue::Text("k7".into()),
        ]);
        let parts = split_key_parts(key.as_slice()).expect("parts");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2], encode_key_part(&DataValue::Text("k7".into())));
    }

    #[test]
    fn prefix_successor_increments_and_truncates() {
        assert_eq!(prefix_successor(&[0x10, 0xAA, 0x00]), vec![0x10, 0xAA, 0x01]);
        assert_eq!(prefix_successor(&[0x10, 0xFF]), vec![0x11]);
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), SCAN_KEY_SENTINEL.to_vec());
    }

    #[test]
    fn key_after_sorts_between_key_and_next_sibling() {
        let key = vec![0x10, 0x42];
        let after = key_after(&key);
        assert!(after.as_slice() > key.as_slice());
        assert!(after.as_slice() < [0x10, 0x43].as_slice());
    }
}
