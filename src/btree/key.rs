// Order-preserving key encoding.
//
// Tree keys are compared as raw bytes, so every key type maps to a byte
// string whose lexicographic order equals the value order: big-endian
// integers with the sign bit flipped, IEEE doubles with sign-bit remapping
// (NaN canonicalized positive so it sorts last), UTF-8 code units for
// strings, and 0x00-escaped, 0x00-terminated components for composites.

use crate::common::Value;
use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};

/// Key type of a tree, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Integer,
    Double,
    String,
    Composite(Vec<KeyType>),
}

impl KeyType {
    /// Number of values one key consumes.
    pub fn arity(&self) -> usize {
        match self {
            KeyType::Composite(parts) => parts.len(),
            _ => 1,
        }
    }
}

/// Encodes typed values into tree keys and applies the per-column equality
/// policy for doubles.
#[derive(Debug, Clone)]
pub struct KeyCodec {
    pub key_type: KeyType,
    /// Optional epsilon for point-equality on double keys. Ordering is
    /// always exact; epsilon only widens lookups.
    pub float_epsilon: Option<f64>,
}

impl KeyCodec {
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            float_epsilon: None,
        }
    }

    pub fn with_epsilon(key_type: KeyType, epsilon: f64) -> Self {
        Self {
            key_type,
            float_epsilon: Some(epsilon),
        }
    }

    /// Encode one key from its values.
    pub fn encode(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != self.key_type.arity() {
            return Err(DbError::SchemaMismatch(format!(
                "key arity {} but {} values supplied",
                self.key_type.arity(),
                values.len()
            )));
        }
        let mut out = Vec::with_capacity(16);
        match &self.key_type {
            KeyType::Composite(parts) => {
                for (part, value) in parts.iter().zip(values) {
                    encode_component(part, value, true, &mut out)?;
                }
            }
            single => encode_component(single, &values[0], false, &mut out)?,
        }
        Ok(out)
    }

    /// Encode the first `n` components of a composite key as a scan prefix.
    /// Every full key beginning with these components starts with exactly
    /// these bytes, so [prefix, prefix_successor) covers the group.
    pub fn encode_prefix(&self, values: &[Value], n: usize) -> Result<Vec<u8>> {
        let KeyType::Composite(parts) = &self.key_type else {
            return self.encode(values);
        };
        if n > parts.len() || values.len() < n {
            return Err(DbError::SchemaMismatch(format!(
                "prefix of {} components on arity {}",
                n,
                parts.len()
            )));
        }
        let mut out = Vec::with_capacity(16);
        for (part, value) in parts.iter().take(n).zip(values) {
            encode_component(part, value, true, &mut out)?;
        }
        Ok(out)
    }

    /// Decode an encoded key back into its component values (index-only
    /// scans read column values straight from index keys).
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>> {
        match &self.key_type {
            KeyType::Composite(parts) => {
                let mut out = Vec::with_capacity(parts.len());
                let mut pos = 0usize;
                for part in parts {
                    let (value, consumed) = decode_component(part, &bytes[pos..], true)?;
                    out.push(value);
                    pos += consumed;
                }
                Ok(out)
            }
            single => {
                let (value, _) = decode_component(single, bytes, false)?;
                Ok(vec![value])
            }
        }
    }

    /// For epsilon lookups: the [low, high] encoded range around a key.
    pub fn epsilon_range(&self, values: &[Value]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(eps) = self.float_epsilon else {
            return Ok(None);
        };
        if self.key_type != KeyType::Double {
            return Ok(None);
        }
        let Value::Double(d) = &values[0] else {
            return Ok(None);
        };
        if d.is_nan() {
            return Ok(None);
        }
        let lo = self.encode(&[Value::Double(d - eps)])?;
        let hi = self.encode(&[Value::Double(d + eps)])?;
        Ok(Some((lo, hi)))
    }
}

fn encode_component(kind: &KeyType, value: &Value, in_composite: bool, out: &mut Vec<u8>) -> Result<()> {
    match (kind, value) {
        (KeyType::Integer, Value::Integer(i)) => {
            out.extend_from_slice(&((*i as u64) ^ (1u64 << 63)).to_be_bytes());
        }
        (KeyType::Double, Value::Double(d)) => {
            out.extend_from_slice(&remap_f64(*d).to_be_bytes());
        }
        (KeyType::Double, Value::Integer(i)) => {
            out.extend_from_slice(&remap_f64(*i as f64).to_be_bytes());
        }
        (KeyType::String, Value::String(s)) => {
            if in_composite {
                escape_into(s.as_bytes(), out);
            } else {
                out.extend_from_slice(s.as_bytes());
            }
        }
        (KeyType::Composite(_), _) => {
            return Err(DbError::Internal("nested composite key".into()));
        }
        (kind, value) => {
            return Err(DbError::TypeMismatch(format!(
                "cannot encode {} as {:?} key",
                value.type_name(),
                kind
            )));
        }
    }
    Ok(())
}

/// Sign-bit remap so encoded u64 ordering equals IEEE ordering, NaN last.
fn remap_f64(d: f64) -> u64 {
    // canonicalize every NaN positive so none sorts below -inf
    let d = if d.is_nan() { f64::NAN.abs() } else { d };
    let bits = d.to_bits();
    if bits & (1u64 << 63) != 0 {
        !bits
    } else {
        bits | (1u64 << 63)
    }
}

/// 0x00 -> 0x00 0xFF escaping with a 0x00 terminator; keeps lexicographic
/// order for variable-length components inside composites.
fn escape_into(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        out.push(b);
        if b == 0x00 {
            out.push(0xFF);
        }
    }
    out.push(0x00);
}

fn decode_component(kind: &KeyType, bytes: &[u8], in_composite: bool) -> Result<(Value, usize)> {
    match kind {
        KeyType::Integer => {
            if bytes.len() < 8 {
                return Err(DbError::Internal("short integer key".into()));
            }
            let raw = u64::from_be_bytes(bytes[..8].try_into().unwrap());
            Ok((Value::Integer((raw ^ (1u64 << 63)) as i64), 8))
        }
        KeyType::Double => {
            if bytes.len() < 8 {
                return Err(DbError::Internal("short double key".into()));
            }
            let raw = u64::from_be_bytes(bytes[..8].try_into().unwrap());
            let bits = if raw & (1u64 << 63) != 0 {
                raw & !(1u64 << 63)
            } else {
                !raw
            };
            Ok((Value::Double(f64::from_bits(bits)), 8))
        }
        KeyType::String => {
            if !in_composite {
                return Ok((
                    Value::String(String::from_utf8_lossy(bytes).into_owned()),
                    bytes.len(),
                ));
            }
            // unescape 0x00 0xFF pairs until the bare 0x00 terminator
            let mut out = Vec::new();
            let mut i = 0usize;
            while i < bytes.len() {
                if bytes[i] == 0x00 {
                    if bytes.get(i + 1) == Some(&0xFF) {
                        out.push(0x00);
                        i += 2;
                        continue;
                    }
                    return Ok((
                        Value::String(String::from_utf8_lossy(&out).into_owned()),
                        i + 1,
                    ));
                }
                out.push(bytes[i]);
                i += 1;
            }
            Err(DbError::Internal("unterminated string key component".into()))
        }
        KeyType::Composite(_) => Err(DbError::Internal("nested composite key".into())),
    }
}

/// Decode the primary-key payload stored in secondary indexes (a raw
/// encoded key is opaque; this helper only frames it).
pub fn encoded_key_to_hex(key: &[u8]) -> String {
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Smallest byte string greater than every extension of `prefix`
/// (increment with carry; all-0xFF has no successor and returns None).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(out);
        }
        out.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc_i(i: i64) -> Vec<u8> {
        KeyCodec::new(KeyType::Integer)
            .encode(&[Value::Integer(i)])
            .unwrap()
    }

    fn enc_d(d: f64) -> Vec<u8> {
        KeyCodec::new(KeyType::Double)
            .encode(&[Value::Double(d)])
            .unwrap()
    }

    #[test]
    fn test_integer_order_preserved() {
        let samples = [i64::MIN, -100, -1, 0, 1, 100, i64::MAX];
        for w in samples.windows(2) {
            assert!(enc_i(w[0]) < enc_i(w[1]), "{} !< {}", w[0], w[1]);
        }
    }

    #[test]
    fn test_double_order_preserved_with_nan_last() {
        let samples = [
            f64::NEG_INFINITY,
            -1e300,
            -1.5,
            -0.0,
            0.0,
            1.5,
            1e300,
            f64::INFINITY,
        ];
        for w in samples.windows(2) {
            assert!(enc_d(w[0]) <= enc_d(w[1]));
        }
        let nan = enc_d(f64::NAN);
        assert!(nan > enc_d(f64::INFINITY));
        assert!(enc_d(-f64::NAN) == nan);
    }

    #[test]
    fn test_string_order() {
        let codec = KeyCodec::new(KeyType::String);
        let a = codec.encode(&[Value::String("apple".into())]).unwrap();
        let b = codec.encode(&[Value::String("banana".into())]).unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_composite_lexicographic() {
        let codec = KeyCodec::new(KeyType::Composite(vec![KeyType::String, KeyType::Integer]));
        let k1 = codec
            .encode(&[Value::String("a".into()), Value::Integer(2)])
            .unwrap();
        let k2 = codec
            .encode(&[Value::String("a".into()), Value::Integer(10)])
            .unwrap();
        let k3 = codec
            .encode(&[Value::String("ab".into()), Value::Integer(0)])
            .unwrap();
        assert!(k1 < k2);
        assert!(k2 < k3);
    }

    #[test]
    fn test_composite_embedded_nul() {
        let codec = KeyCodec::new(KeyType::Composite(vec![KeyType::String, KeyType::String]));
        let k1 = codec
            .encode(&[Value::String("a\u{0}b".into()), Value::String("z".into())])
            .unwrap();
        let k2 = codec
            .encode(&[Value::String("a".into()), Value::String("zz".into())])
            .unwrap();
        // "a" < "a\0b" as strings, so k2 must sort below k1
        assert!(k2 < k1);
    }

    #[test]
    fn test_arity_checked() {
        let codec = KeyCodec::new(KeyType::Integer);
        assert!(codec
            .encode(&[Value::Integer(1), Value::Integer(2)])
            .is_err());
    }

    #[test]
    fn test_prefix_scan_bounds() {
        let codec = KeyCodec::new(KeyType::Composite(vec![KeyType::String, KeyType::Integer]));
        let prefix = codec
            .encode_prefix(&[Value::String("ann".into())], 1)
            .unwrap();
        let full = codec
            .encode(&[Value::String("ann".into()), Value::Integer(7)])
            .unwrap();
        assert!(full.starts_with(&prefix));
        let succ = prefix_successor(&prefix).unwrap();
        assert!(full < succ);
        let other = codec
            .encode(&[Value::String("bob".into()), Value::Integer(0)])
            .unwrap();
        assert!(other >= succ);
    }

    #[test]
    fn test_decode_roundtrip() {
        let codec = KeyCodec::new(KeyType::Composite(vec![
            KeyType::String,
            KeyType::Integer,
            KeyType::Double,
        ]));
        let values = vec![
            Value::String("hi\u{0}there".into()),
            Value::Integer(-42),
            Value::Double(2.75),
        ];
        let encoded = codec.encode(&values).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), values);

        let single = KeyCodec::new(KeyType::Integer);
        let enc = single.encode(&[Value::Integer(7)]).unwrap();
        assert_eq!(single.decode(&enc).unwrap(), vec![Value::Integer(7)]);
    }

    #[test]
    fn test_epsilon_range() {
        let codec = KeyCodec::with_epsilon(KeyType::Double, 1e-9);
        let range = codec.epsilon_range(&[Value::Double(1.0)]).unwrap().unwrap();
        assert!(range.0 < range.1);
        let exact = KeyCodec::new(KeyType::Double);
        assert!(exact.epsilon_range(&[Value::Double(1.0)]).unwrap().is_none());
    }
}
