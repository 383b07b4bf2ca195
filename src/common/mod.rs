// # Common Types
//
// Shared identifiers and the value model used across the engine. Everything
// downstream (pages, trees, plans, operators) speaks in these types.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// Type Aliases - Shared Identifiers
// ============================================================================

/// Unique identifier for transactions
pub type TxId = u64;

/// Unique identifier for pages; high 32 bits select the file, low 32 bits
/// the page number within it
pub type PageId = u64;

/// Unique identifier for page-structured files (one per tree)
pub type FileId = u32;

/// Unique identifier for tables in the catalog
pub type TableId = u32;

/// Unique identifier for indexes
pub type IndexId = u32;

/// Unique identifier for rows (monotonic, assigned at insert)
pub type RowId = u64;

/// Log sequence number for the write-ahead log
pub type Lsn = u64;

/// Pack a (file, page-number) pair into a 64-bit page id
#[inline(always)]
pub fn page_id(file: FileId, page_no: u32) -> PageId {
    ((file as u64) << 32) | page_no as u64
}

/// File half of a page id
#[inline(always)]
pub fn page_file(id: PageId) -> FileId {
    (id >> 32) as FileId
}

/// Page-number half of a page id
#[inline(always)]
pub fn page_no(id: PageId) -> u32 {
    id as u32
}

// ============================================================================
// Core Value Types
// ============================================================================

/// All data values the engine operates on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean true/false
    Boolean(bool),

    /// 64-bit signed integer
    Integer(i64),

    /// 64-bit floating point; also the carrier for decimal columns
    Double(f64),

    /// Variable-length string (UTF-8)
    String(String),

    /// Binary data
    Bytes(Vec<u8>),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get type name as string
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Boolean(_) => "BOOLEAN",
            Value::Integer(_) => "INTEGER",
            Value::Double(_) => "DOUBLE",
            Value::String(_) => "STRING",
            Value::Bytes(_) => "BYTES",
        }
    }

    /// Numeric view used by statistics and expression arithmetic.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            Value::Boolean(b) => Some(*b as i64 as f64),
            _ => None,
        }
    }

    /// Total order over values of the same family. NULL sorts first, NaN
    /// sorts last among doubles; integers and doubles compare numerically.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => cmp_f64(*a, *b),
            (Value::Integer(a), Value::Double(b)) => cmp_f64(*a as f64, *b),
            (Value::Double(a), Value::Integer(b)) => cmp_f64(*a, *b as f64),
            (Value::String(a), Value::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            // Cross-family comparisons order by type tag so sorting never panics
            (a, b) => a.family_rank().cmp(&b.family_rank()),
        }
    }

    fn family_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Double(_) => 2,
            Value::String(_) => 3,
            Value::Bytes(_) => 4,
        }
    }
}

/// NaN-last comparison for doubles. IEEE comparison conflates the signed
/// zeros; equal magnitudes with different signs are ordered by sign, which
/// keeps this comparator consistent with the sign-remapped key encoding.
#[inline]
pub fn cmp_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => match a.partial_cmp(&b) {
            Some(Ordering::Equal) => b.is_sign_negative().cmp(&a.is_sign_negative()),
            Some(ord) => ord,
            None => Ordering::Equal,
        },
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            // Bitwise float equality keeps hashing and tree lookups consistent
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            _ => self.total_cmp(other) == Ordering::Equal,
        }
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.total_cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.total_cmp(other)
    }
}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(b) => b.hash(state),
            Value::Integer(i) => i.hash(state),
            Value::Double(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Bytes(b) => b.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// A row is a tuple of typed values in catalog column order.
pub type Row = Vec<Value>;

/// Serialize a row for tree storage.
pub fn encode_row(row: &[Value]) -> crate::error::Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(row, bincode::config::standard())?)
}

/// Decode a stored row.
pub fn decode_row(bytes: &[u8]) -> crate::error::Result<Row> {
    let (row, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_id_packing() {
        let id = page_id(7, 42);
        assert_eq!(page_file(id), 7);
        assert_eq!(page_no(id), 42);
    }

    #[test]
    fn test_nan_sorts_last() {
        let mut vals = vec![
            Value::Double(f64::NAN),
            Value::Double(1.0),
            Value::Double(f64::NEG_INFINITY),
            Value::Double(f64::INFINITY),
        ];
        vals.sort();
        assert_eq!(vals[0], Value::Double(f64::NEG_INFINITY));
        assert_eq!(vals[2], Value::Double(f64::INFINITY));
        assert!(matches!(vals[3], Value::Double(d) if d.is_nan()));
    }

    #[test]
    fn test_signed_zeros_ordered_by_sign() {
        assert_eq!(cmp_f64(-0.0, 0.0), Ordering::Less);
        assert_eq!(cmp_f64(0.0, -0.0), Ordering::Greater);
        assert_eq!(cmp_f64(-0.0, -0.0), Ordering::Equal);
        assert_eq!(cmp_f64(0.0, 0.0), Ordering::Equal);

        let mut vals = vec![Value::Double(0.0), Value::Double(-0.0), Value::Double(-1.0)];
        vals.sort();
        assert_eq!(vals[0], Value::Double(-1.0));
        assert!(matches!(vals[1], Value::Double(d) if d == 0.0 && d.is_sign_negative()));
        assert!(matches!(vals[2], Value::Double(d) if d == 0.0 && !d.is_sign_negative()));
    }

    #[test]
    fn test_null_sorts_first() {
        let mut vals = vec![Value::Integer(1), Value::Null, Value::Integer(-5)];
        vals.sort();
        assert_eq!(vals[0], Value::Null);
        assert_eq!(vals[1], Value::Integer(-5));
    }

    #[test]
    fn test_mixed_numeric_compare() {
        assert_eq!(
            Value::Integer(2).total_cmp(&Value::Double(2.5)),
            Ordering::Less
        );
    }
}
