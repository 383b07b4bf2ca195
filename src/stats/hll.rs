// HyperLogLog distinct-count estimator.
//
// 2^14 registers by default (~0.8% standard error). Values are hashed with
// SipHash via the std hasher; the estimator applies the usual small-range
// linear-counting correction.

use crate::common::Value;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

pub const DEFAULT_PRECISION: u8 = 14;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperLogLog {
    precision: u8,
    registers: Vec<u8>,
}

impl HyperLogLog {
    pub fn new(precision: u8) -> Self {
        let p = precision.clamp(4, 18);
        Self {
            precision: p,
            registers: vec![0u8; 1 << p],
        }
    }

    pub fn default_precision() -> Self {
        Self::new(DEFAULT_PRECISION)
    }

    pub fn add(&mut self, value: &Value) {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        value.hash(&mut hasher);
        self.add_hash(hasher.finish());
    }

    pub fn add_hash(&mut self, hash: u64) {
        let p = self.precision as u32;
        let idx = (hash >> (64 - p)) as usize;
        let rest = hash << p;
        // rank = position of the leftmost 1-bit in the remaining bits
        let rank = (rest.leading_zeros() + 1).min(64 - p + 1) as u8;
        if rank > self.registers[idx] {
            self.registers[idx] = rank;
        }
    }

    /// Cardinality estimate with small-range correction.
    pub fn estimate(&self) -> u64 {
        let m = self.registers.len() as f64;
        let alpha = match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / m),
        };
        let sum: f64 = self
            .registers
            .iter()
            .map(|&r| 2f64.powi(-(r as i32)))
            .sum();
        let raw = alpha * m * m / sum;

        if raw <= 2.5 * m {
            let zeros = self.registers.iter().filter(|&&r| r == 0).count();
            if zeros != 0 {
                return (m * (m / zeros as f64).ln()).round() as u64;
            }
        }
        raw.round() as u64
    }

    pub fn merge(&mut self, other: &HyperLogLog) {
        debug_assert_eq!(self.precision, other.precision);
        for (a, b) in self.registers.iter_mut().zip(&other.registers) {
            *a = (*a).max(*b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_counts_near_exact() {
        let mut hll = HyperLogLog::default_precision();
        for i in 0..100i64 {
            hll.add(&Value::Integer(i));
        }
        let est = hll.estimate();
        assert!((90..=110).contains(&est), "estimate {} off", est);
    }

    #[test]
    fn test_duplicates_do_not_inflate() {
        let mut hll = HyperLogLog::default_precision();
        for _ in 0..1000 {
            for i in 0..50i64 {
                hll.add(&Value::Integer(i));
            }
        }
        let est = hll.estimate();
        assert!((45..=55).contains(&est), "estimate {} off", est);
    }

    #[test]
    fn test_large_counts_within_error() {
        let mut hll = HyperLogLog::default_precision();
        let n = 100_000i64;
        for i in 0..n {
            hll.add(&Value::Integer(i));
        }
        let est = hll.estimate() as f64;
        let err = (est - n as f64).abs() / n as f64;
        assert!(err < 0.05, "relative error {} too high", err);
    }

    #[test]
    fn test_merge_unions() {
        let mut a = HyperLogLog::default_precision();
        let mut b = HyperLogLog::default_precision();
        for i in 0..1000i64 {
            a.add(&Value::Integer(i));
        }
        for i in 500..1500i64 {
            b.add(&Value::Integer(i));
        }
        a.merge(&b);
        let est = a.estimate() as f64;
        assert!((est - 1500.0).abs() / 1500.0 < 0.1);
    }
}
