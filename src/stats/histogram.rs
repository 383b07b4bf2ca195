// Histograms.
//
// Equi-height by default (64 buckets); when a handful of values dominate
// the sample, the builder switches to a hybrid shape where the frequent
// values get singleton buckets and the remainder forms the equi-height
// tail. Estimation works on a numeric projection of the sampled values
// (strings project through their leading bytes).

use crate::common::Value;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BUCKETS: usize = 64;

/// Numeric projection used for bucket boundaries. Order-preserving within
/// a column's value family.
pub fn numeric_rank(value: &Value) -> Option<f64> {
    match value {
        Value::Integer(i) => Some(*i as f64),
        Value::Double(d) if !d.is_nan() => Some(*d),
        Value::Boolean(b) => Some(*b as i64 as f64),
        Value::String(s) => {
            let mut bytes = [0u8; 8];
            for (i, b) in s.as_bytes().iter().take(8).enumerate() {
                bytes[i] = *b;
            }
            Some(u64::from_be_bytes(bytes) as f64)
        }
        Value::Bytes(b) => {
            let mut bytes = [0u8; 8];
            for (i, x) in b.iter().take(8).enumerate() {
                bytes[i] = *x;
            }
            Some(u64::from_be_bytes(bytes) as f64)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub low: f64,
    pub high: f64,
    pub frequency: u64,
    pub distinct: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Histogram {
    EquiHeight {
        buckets: Vec<Bucket>,
        total: u64,
    },
    /// top-K frequent values as singletons plus an equi-height tail
    Hybrid {
        singletons: Vec<(f64, u64)>,
        tail: Vec<Bucket>,
        total: u64,
    },
}

impl Histogram {
    /// Build from a sample. Non-numeric (null) entries must be filtered by
    /// the caller; `scale` stretches sample frequencies to table size.
    pub fn build(sample: &[f64], bucket_count: usize) -> Histogram {
        let mut sorted: Vec<f64> = sample.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let total = sorted.len() as u64;
        if sorted.is_empty() {
            return Histogram::EquiHeight {
                buckets: Vec::new(),
                total: 0,
            };
        }

        // frequency census to detect skew
        let mut runs: Vec<(f64, u64)> = Vec::new();
        for &v in &sorted {
            match runs.last_mut() {
                Some((rv, n)) if *rv == v => *n += 1,
                _ => runs.push((v, 1)),
            }
        }
        let avg_height = (total as f64 / bucket_count.max(1) as f64).max(1.0);
        let mut frequent: Vec<(f64, u64)> = runs
            .iter()
            .copied()
            .filter(|(_, n)| *n as f64 > 2.0 * avg_height)
            .collect();

        if frequent.is_empty() {
            return Histogram::EquiHeight {
                buckets: equi_height(&sorted, bucket_count),
                total,
            };
        }

        frequent.sort_by(|a, b| b.1.cmp(&a.1));
        frequent.truncate(bucket_count / 4);
        let frequent_set: Vec<f64> = frequent.iter().map(|(v, _)| *v).collect();
        let tail_values: Vec<f64> = sorted
            .iter()
            .copied()
            .filter(|v| !frequent_set.contains(v))
            .collect();
        Histogram::Hybrid {
            singletons: frequent,
            tail: equi_height(&tail_values, bucket_count),
            total,
        }
    }

    pub fn total(&self) -> u64 {
        match self {
            Histogram::EquiHeight { total, .. } | Histogram::Hybrid { total, .. } => *total,
        }
    }

    /// Fraction of values strictly below `x`.
    pub fn selectivity_lt(&self, x: f64) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let mut below = 0f64;
        match self {
            Histogram::EquiHeight { buckets, .. } => {
                below += buckets_below(buckets, x);
            }
            Histogram::Hybrid {
                singletons, tail, ..
            } => {
                for (v, n) in singletons {
                    if *v < x {
                        below += *n as f64;
                    }
                }
                below += buckets_below(tail, x);
            }
        }
        (below / total as f64).clamp(0.0, 1.0)
    }

    /// Fraction of values equal to `x`.
    pub fn selectivity_eq(&self, x: f64) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        match self {
            Histogram::EquiHeight { buckets, .. } => eq_from_buckets(buckets, x, total),
            Histogram::Hybrid {
                singletons, tail, ..
            } => {
                for (v, n) in singletons {
                    if *v == x {
                        return *n as f64 / total as f64;
                    }
                }
                eq_from_buckets(tail, x, total)
            }
        }
    }

    /// Fraction inside [lo, hi] with open/closed ends.
    pub fn selectivity_range(
        &self,
        lo: Option<(f64, bool)>,
        hi: Option<(f64, bool)>,
    ) -> f64 {
        let below_hi = match hi {
            Some((x, inclusive)) => {
                self.selectivity_lt(x) + if inclusive { self.selectivity_eq(x) } else { 0.0 }
            }
            None => 1.0,
        };
        let below_lo = match lo {
            Some((x, inclusive)) => {
                self.selectivity_lt(x) + if inclusive { 0.0 } else { self.selectivity_eq(x) }
            }
            None => 0.0,
        };
        (below_hi - below_lo).clamp(0.0, 1.0)
    }
}

fn equi_height(sorted: &[f64], bucket_count: usize) -> Vec<Bucket> {
    if sorted.is_empty() {
        return Vec::new();
    }
    let per = (sorted.len() / bucket_count.max(1)).max(1);
    let mut buckets = Vec::new();
    let mut i = 0usize;
    while i < sorted.len() {
        let end = (i + per).min(sorted.len());
        let slice = &sorted[i..end];
        let mut distinct = 1u64;
        for w in slice.windows(2) {
            if w[0] != w[1] {
                distinct += 1;
            }
        }
        buckets.push(Bucket {
            low: slice[0],
            high: slice[slice.len() - 1],
            frequency: slice.len() as u64,
            distinct,
        });
        i = end;
    }
    buckets
}

fn buckets_below(buckets: &[Bucket], x: f64) -> f64 {
    let mut below = 0f64;
    for b in buckets {
        if b.high < x {
            below += b.frequency as f64;
        } else if b.low < x {
            // linear interpolation inside the bucket
            let width = (b.high - b.low).max(f64::EPSILON);
            below += b.frequency as f64 * ((x - b.low) / width).clamp(0.0, 1.0);
        }
    }
    below
}

fn eq_from_buckets(buckets: &[Bucket], x: f64, total: u64) -> f64 {
    for b in buckets {
        if x >= b.low && x <= b.high {
            let per_value = b.frequency as f64 / b.distinct.max(1) as f64;
            return per_value / total as f64;
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_selectivity() {
        let sample: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let h = Histogram::build(&sample, DEFAULT_BUCKETS);
        let sel = h.selectivity_lt(500.0);
        assert!((sel - 0.5).abs() < 0.05, "selectivity {}", sel);
        let sel = h.selectivity_range(Some((250.0, true)), Some((750.0, true)));
        assert!((sel - 0.5).abs() < 0.05, "range selectivity {}", sel);
    }

    #[test]
    fn test_eq_selectivity_uniform() {
        let sample: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let h = Histogram::build(&sample, DEFAULT_BUCKETS);
        let sel = h.selectivity_eq(123.0);
        assert!(sel > 0.0 && sel < 0.01, "eq selectivity {}", sel);
    }

    #[test]
    fn test_skew_triggers_hybrid() {
        let mut sample: Vec<f64> = Vec::new();
        for _ in 0..500 {
            sample.push(7.0); // hot value
        }
        for i in 0..500 {
            sample.push(1000.0 + i as f64);
        }
        let h = Histogram::build(&sample, DEFAULT_BUCKETS);
        assert!(matches!(h, Histogram::Hybrid { .. }));
        let sel = h.selectivity_eq(7.0);
        assert!((sel - 0.5).abs() < 0.05, "hot-value selectivity {}", sel);
    }

    #[test]
    fn test_empty_sample() {
        let h = Histogram::build(&[], DEFAULT_BUCKETS);
        assert_eq!(h.selectivity_lt(10.0), 0.0);
        assert_eq!(h.total(), 0);
    }

    #[test]
    fn test_string_rank_ordering() {
        let a = numeric_rank(&Value::String("apple".into())).unwrap();
        let b = numeric_rank(&Value::String("banana".into())).unwrap();
        assert!(a < b);
    }
}
