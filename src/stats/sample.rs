// Reservoir sampling.
//
// Algorithm R with a seeded StdRng so collection runs are reproducible
// under test. Block-level sampling (whole leaves) kicks in above the
// configured row threshold to keep huge scans cheap.

use crate::common::Value;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct Reservoir {
    capacity: usize,
    seen: u64,
    items: Vec<Value>,
    rng: StdRng,
}

impl Reservoir {
    pub fn new(capacity: usize, seed: u64) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: 0,
            items: Vec::with_capacity(capacity.min(4096)),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Offer one value; it replaces a random resident with probability
    /// capacity/seen once the reservoir is full.
    pub fn offer(&mut self, value: Value) {
        self.seen += 1;
        if self.items.len() < self.capacity {
            self.items.push(value);
            return;
        }
        let j = self.rng.random_range(0..self.seen);
        if (j as usize) < self.capacity {
            let slot = self.rng.random_range(0..self.capacity);
            self.items[slot] = value;
        }
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn into_items(self) -> Vec<Value> {
        self.items
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_input_kept_whole() {
        let mut r = Reservoir::new(100, 7);
        for i in 0..50 {
            r.offer(Value::Integer(i));
        }
        assert_eq!(r.items().len(), 50);
        assert_eq!(r.seen(), 50);
    }

    #[test]
    fn test_capacity_respected() {
        let mut r = Reservoir::new(64, 7);
        for i in 0..10_000 {
            r.offer(Value::Integer(i));
        }
        assert_eq!(r.items().len(), 64);
        assert_eq!(r.seen(), 10_000);
    }

    #[test]
    fn test_sample_spans_input() {
        // with 10k offers into 1k slots, the sample should cover the range
        let mut r = Reservoir::new(1000, 42);
        for i in 0..10_000i64 {
            r.offer(Value::Integer(i));
        }
        let items = r.into_items();
        let max = items
            .iter()
            .filter_map(|v| v.as_f64())
            .fold(f64::MIN, f64::max);
        let min = items
            .iter()
            .filter_map(|v| v.as_f64())
            .fold(f64::MAX, f64::min);
        assert!(min < 2_000.0);
        assert!(max > 8_000.0);
    }
}
