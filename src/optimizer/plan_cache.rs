// Plan cache and result cache.
//
// The plan cache is a bounded ring with O(1) insert and lookup: a slot
// array driven round-robin plus a sharded index keyed by (canonical plan
// hash, parameter signature, statistics snapshot ids, schema version).
// Entries die by ring reuse, by schema-version mismatch, by snapshot
// replacement (the key stops matching), or by adaptive poisoning.
//
// The result cache memoizes small result sets keyed by the same identity
// plus a per-table write epoch; any committed write to a referenced table
// bumps its epoch and silently invalidates dependents.

use crate::common::Row;
use crate::execution::expressions::Schema;
use crate::optimizer::physical::PhysicalPlan;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanCacheKey {
    pub plan_hash: u64,
    pub param_signature: u64,
    pub schema_version: u64,
    /// (table, snapshot id) pairs, sorted by table
    pub snapshots: Vec<(String, u64)>,
}

impl PlanCacheKey {
    pub fn identity(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.hash(&mut h);
        h.finish()
    }
}

pub struct CachedPlan {
    pub plan: Arc<PhysicalPlan>,
    pub estimated_cost: f64,
    pub hits: AtomicU64,
    poisoned: AtomicBool,
}

impl CachedPlan {
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }
}

struct Ring {
    slots: Vec<Option<PlanCacheKey>>,
    head: usize,
}

pub struct PlanCache {
    ring: Mutex<Ring>,
    map: DashMap<PlanCacheKey, Arc<CachedPlan>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PlanCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring {
                slots: vec![None; capacity.max(1)],
                head: 0,
            }),
            map: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &PlanCacheKey) -> Option<Arc<CachedPlan>> {
        match self.map.get(key) {
            Some(entry) if !entry.is_poisoned() => {
                entry.hits.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry))
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: PlanCacheKey, plan: Arc<PhysicalPlan>, estimated_cost: f64) {
        let mut ring = self.ring.lock();
        let head = ring.head;
        if let Some(evicted) = ring.slots[head].take() {
            self.map.remove(&evicted);
        }
        ring.slots[head] = Some(key.clone());
        ring.head = (head + 1) % ring.slots.len();
        drop(ring);
        self.map.insert(
            key,
            Arc::new(CachedPlan {
                plan,
                estimated_cost,
                hits: AtomicU64::new(0),
                poisoned: AtomicBool::new(false),
            }),
        );
    }

    /// Drop an entry (adaptive invalidation).
    pub fn invalidate(&self, key: &PlanCacheKey) {
        if let Some((_, entry)) = self.map.remove(key) {
            entry.poison();
        }
    }

    /// Drop everything (DDL, index add/drop).
    pub fn clear(&self) {
        self.map.clear();
        let mut ring = self.ring.lock();
        for slot in ring.slots.iter_mut() {
            *slot = None;
        }
        ring.head = 0;
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn hit_rate(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

/// Cached result rows plus the table epochs they were computed under.
pub struct CachedResult {
    pub schema: Schema,
    pub rows: Vec<Row>,
    epochs: Vec<(String, u64)>,
}

pub struct ResultCache {
    map: DashMap<u64, Arc<CachedResult>>,
    /// write epoch per table; bumped on every committed write
    epochs: DashMap<String, AtomicU64>,
    max_entries: usize,
    max_rows: usize,
}

impl ResultCache {
    pub fn new(max_entries: usize, max_rows: usize) -> Self {
        Self {
            map: DashMap::new(),
            epochs: DashMap::new(),
            max_entries,
            max_rows,
        }
    }

    pub fn epoch(&self, table: &str) -> u64 {
        self.epochs
            .get(table)
            .map(|e| e.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Called on every committed write; readers of stale entries miss.
    pub fn bump(&self, table: &str) {
        self.epochs
            .entry(table.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::AcqRel);
    }

    pub fn get(&self, key: u64) -> Option<Arc<CachedResult>> {
        let entry = self.map.get(&key)?;
        for (table, epoch) in &entry.epochs {
            if self.epoch(table) != *epoch {
                drop(entry);
                self.map.remove(&key);
                return None;
            }
        }
        Some(Arc::clone(&entry))
    }

    pub fn insert(&self, key: u64, schema: Schema, rows: Vec<Row>, tables: &[String]) {
        if rows.len() > self.max_rows || self.map.len() >= self.max_entries {
            return;
        }
        let epochs = tables
            .iter()
            .map(|t| (t.clone(), self.epoch(t)))
            .collect();
        self.map.insert(
            key,
            Arc::new(CachedResult {
                schema,
                rows,
                epochs,
            }),
        );
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::physical::{Cost, PhysNode};

    fn key(n: u64) -> PlanCacheKey {
        PlanCacheKey {
            plan_hash: n,
            param_signature: 0,
            schema_version: 1,
            snapshots: vec![("t".into(), 1)],
        }
    }

    fn plan() -> Arc<PhysicalPlan> {
        Arc::new(PhysicalPlan {
            node: PhysNode::SeqScan {
                table: "t".into(),
                alias: "t".into(),
                filter: None,
            },
            rows: 1.0,
            cost: Cost::default(),
            ordering: vec![],
            schema: Schema::default(),
        })
    }

    #[test]
    fn test_ring_eviction() {
        let cache = PlanCache::new(2);
        cache.insert(key(1), plan(), 1.0);
        cache.insert(key(2), plan(), 1.0);
        cache.insert(key(3), plan(), 1.0);
        // key 1 was recycled by the ring
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.get(&key(2)).is_some());
        assert!(cache.get(&key(3)).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_snapshot_id_in_key() {
        let cache = PlanCache::new(4);
        cache.insert(key(1), plan(), 1.0);
        let mut stale = key(1);
        stale.snapshots = vec![("t".into(), 2)];
        // replacing the snapshot changes the key; the old entry cannot match
        assert!(cache.get(&stale).is_none());
    }

    #[test]
    fn test_invalidate_removes() {
        let cache = PlanCache::new(4);
        cache.insert(key(7), plan(), 1.0);
        cache.invalidate(&key(7));
        assert!(cache.get(&key(7)).is_none());
    }

    #[test]
    fn test_result_cache_epoch_invalidation() {
        let cache = ResultCache::new(16, 1000);
        cache.insert(42, Schema::default(), vec![vec![]], &["t".to_string()]);
        assert!(cache.get(42).is_some());
        cache.bump("t");
        assert!(cache.get(42).is_none());
    }

    #[test]
    fn test_result_cache_row_ceiling() {
        let cache = ResultCache::new(16, 2);
        cache.insert(
            1,
            Schema::default(),
            vec![vec![], vec![], vec![]],
            &["t".to_string()],
        );
        assert!(cache.get(1).is_none());
    }
}
