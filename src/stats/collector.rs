// Statistics collection and snapshot lifecycle.
//
// `collect` scans the primary tree once, feeding per-column reservoirs and
// HLL sketches, then builds histograms and correlations from the samples.
// Snapshots are immutable once built; `publish` swaps the catalog pointer
// and the registry retains old snapshots while any plan still references
// them (Arc refcount). A snapshot whose row count has drifted past the
// configured ratio is stale and flags a background refresh.

use crate::btree::{BTree, RangeCursor};
use crate::catalog::{Catalog, SnapshotId, TableDescriptor};
use crate::common::{decode_row, Value};
use crate::error::Result;
use crate::stats::histogram::{numeric_rank, Histogram, DEFAULT_BUCKETS};
use crate::stats::hll::HyperLogLog;
use crate::stats::sample::Reservoir;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_SAMPLE_SIZE: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnStats {
    pub name: String,
    pub ndv: u64,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub null_fraction: f64,
    pub histogram: Histogram,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndexStats {
    pub leaf_count: u64,
    pub height: u64,
    pub clustering_factor: f64,
}

/// Immutable statistics snapshot for one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub id: SnapshotId,
    pub table: String,
    pub row_count: u64,
    pub columns: Vec<ColumnStats>,
    pub indexes: HashMap<String, IndexStats>,
    /// Pearson coefficients for the collected column pairs
    pub correlations: Vec<(usize, usize, f64)>,
}

impl StatsSnapshot {
    pub fn column(&self, name: &str) -> Option<&ColumnStats> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn correlation(&self, a: usize, b: usize) -> Option<f64> {
        self.correlations
            .iter()
            .find(|(x, y, _)| (*x == a && *y == b) || (*x == b && *y == a))
            .map(|(_, _, r)| *r)
    }
}

pub struct StatsCollector {
    dir: PathBuf,
    sample_size: usize,
    registry: RwLock<HashMap<SnapshotId, Arc<StatsSnapshot>>>,
}

impl StatsCollector {
    pub fn open(dir: &Path, sample_size: usize) -> Result<StatsCollector> {
        std::fs::create_dir_all(dir)?;
        Ok(StatsCollector {
            dir: dir.to_path_buf(),
            sample_size,
            registry: RwLock::new(HashMap::new()),
        })
    }

    /// Scan the table once and build a snapshot. `pairs` are the declared
    /// column pairs whose correlation the optimizer wants.
    pub fn collect(
        &self,
        table: &TableDescriptor,
        tree: &BTree,
        index_trees: &[(String, &BTree)],
        pairs: &[(usize, usize)],
        snapshot_id: SnapshotId,
    ) -> Result<StatsSnapshot> {
        let ncols = table.columns.len();
        let mut reservoirs: Vec<Reservoir> = (0..ncols)
            .map(|i| Reservoir::new(self.sample_size, snapshot_id.wrapping_mul(31).wrapping_add(i as u64)))
            .collect();
        let mut sketches: Vec<HyperLogLog> =
            (0..ncols).map(|_| HyperLogLog::default_precision()).collect();
        let mut nulls = vec![0u64; ncols];
        let mut mins: Vec<Option<Value>> = vec![None; ncols];
        let mut maxs: Vec<Option<Value>> = vec![None; ncols];
        let mut rows = 0u64;
        // paired samples for correlation, capped at the reservoir size
        let mut pair_samples: Vec<Vec<(f64, f64)>> = vec![Vec::new(); pairs.len()];

        let mut cursor = RangeCursor::new(tree, None, None);
        while let Some((_, value)) = cursor.next()? {
            let row = decode_row(&value)?;
            rows += 1;
            for (i, v) in row.iter().enumerate().take(ncols) {
                if v.is_null() {
                    nulls[i] += 1;
                    continue;
                }
                sketches[i].add(v);
                update_minmax(&mut mins[i], &mut maxs[i], v);
                reservoirs[i].offer(v.clone());
            }
            for (pi, (a, b)) in pairs.iter().enumerate() {
                if pair_samples[pi].len() >= self.sample_size {
                    continue;
                }
                if let (Some(x), Some(y)) = (
                    row.get(*a).and_then(numeric_rank),
                    row.get(*b).and_then(numeric_rank),
                ) {
                    pair_samples[pi].push((x, y));
                }
            }
        }

        let mut columns = Vec::with_capacity(ncols);
        for (i, col) in table.columns.iter().enumerate() {
            let sample: Vec<f64> = reservoirs[i]
                .items()
                .iter()
                .filter_map(numeric_rank)
                .collect();
            columns.push(ColumnStats {
                name: col.name.clone(),
                ndv: sketches[i].estimate(),
                min: mins[i].clone(),
                max: maxs[i].clone(),
                null_fraction: if rows == 0 {
                    0.0
                } else {
                    nulls[i] as f64 / rows as f64
                },
                histogram: Histogram::build(&sample, DEFAULT_BUCKETS),
            });
        }

        let mut indexes = HashMap::new();
        for (name, itree) in index_trees {
            indexes.insert(name.clone(), index_stats(itree)?);
        }

        let correlations = pairs
            .iter()
            .zip(&pair_samples)
            .map(|((a, b), s)| (*a, *b, pearson(s)))
            .collect();

        let snapshot = StatsSnapshot {
            id: snapshot_id,
            table: table.name.clone(),
            row_count: rows,
            columns,
            indexes,
            correlations,
        };
        info!(
            table = %table.name,
            snapshot = snapshot_id,
            rows,
            "statistics collected"
        );
        Ok(snapshot)
    }

    /// Persist a snapshot and make it loadable by id.
    pub fn store(&self, snapshot: StatsSnapshot) -> Result<Arc<StatsSnapshot>> {
        let bytes = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())?;
        std::fs::write(self.dir.join(format!("{}.bin", snapshot.id)), bytes)?;
        let arc = Arc::new(snapshot);
        self.registry.write().insert(arc.id, Arc::clone(&arc));
        Ok(arc)
    }

    /// Publish: store, then swap the catalog's current pointer. Snapshots
    /// never mutate, so readers of the old snapshot keep a valid Arc.
    pub fn publish(
        &self,
        catalog: &Catalog,
        snapshot: StatsSnapshot,
    ) -> Result<Arc<StatsSnapshot>> {
        let table = snapshot.table.clone();
        let arc = self.store(snapshot)?;
        let old = catalog.publish_snapshot(&table, arc.id)?;
        if let Some(old_id) = old {
            self.retire_if_unreferenced(old_id);
        }
        catalog.save()?;
        Ok(arc)
    }

    pub fn get(&self, id: SnapshotId) -> Option<Arc<StatsSnapshot>> {
        if let Some(s) = self.registry.read().get(&id) {
            return Some(Arc::clone(s));
        }
        // lazily load from disk (snapshots survive restarts)
        let path = self.dir.join(format!("{}.bin", id));
        let bytes = std::fs::read(path).ok()?;
        let (snapshot, _): (StatsSnapshot, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).ok()?;
        let arc = Arc::new(snapshot);
        self.registry.write().insert(id, Arc::clone(&arc));
        Some(arc)
    }

    /// Drop the registry's reference; the file stays for audit until the
    /// registry is the last holder and space is reclaimed.
    pub fn retire_if_unreferenced(&self, id: SnapshotId) {
        let mut registry = self.registry.write();
        if let Some(arc) = registry.get(&id) {
            if Arc::strong_count(arc) == 1 {
                registry.remove(&id);
                let _ = std::fs::remove_file(self.dir.join(format!("{}.bin", id)));
            }
        }
    }

    /// A snapshot is stale when the live row count drifted further than
    /// `ratio` from the snapshot's count.
    pub fn is_stale(snapshot: &StatsSnapshot, current_rows: u64, ratio: f64) -> bool {
        let base = snapshot.row_count.max(1) as f64;
        (current_rows as f64 - snapshot.row_count as f64).abs() / base > ratio
    }
}

fn update_minmax(min: &mut Option<Value>, max: &mut Option<Value>, v: &Value) {
    match min {
        None => *min = Some(v.clone()),
        Some(m) if v.total_cmp(m) == std::cmp::Ordering::Less => *min = Some(v.clone()),
        _ => {}
    }
    match max {
        None => *max = Some(v.clone()),
        Some(m) if v.total_cmp(m) == std::cmp::Ordering::Greater => *max = Some(v.clone()),
        _ => {}
    }
}

fn index_stats(tree: &BTree) -> Result<IndexStats> {
    Ok(IndexStats {
        leaf_count: tree.leaf_count()?,
        height: tree.height(),
        clustering_factor: 0.0, // maintained incrementally by the index manager
    })
}

/// Pearson correlation coefficient over paired numeric samples.
pub fn pearson(samples: &[(f64, f64)]) -> f64 {
    let n = samples.len() as f64;
    if n < 2.0 {
        return 0.0;
    }
    let (sx, sy): (f64, f64) = samples
        .iter()
        .fold((0.0, 0.0), |(a, b), (x, y)| (a + x, b + y));
    let (mx, my) = (sx / n, sy / n);
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (x, y) in samples {
        cov += (x - mx) * (y - my);
        vx += (x - mx) * (x - mx);
        vy += (y - my) * (y - my);
    }
    if vx == 0.0 || vy == 0.0 {
        return 0.0;
    }
    (cov / (vx.sqrt() * vy.sqrt())).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pearson_perfect_positive() {
        let samples: Vec<(f64, f64)> = (0..100).map(|i| (i as f64, 2.0 * i as f64)).collect();
        assert!((pearson(&samples) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pearson_perfect_negative() {
        let samples: Vec<(f64, f64)> = (0..100).map(|i| (i as f64, -(i as f64))).collect();
        assert!((pearson(&samples) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_pearson_uncorrelated() {
        let samples: Vec<(f64, f64)> = (0..1000)
            .map(|i| {
                let x = (i * 7919 % 1000) as f64;
                let y = (i * 104729 % 1000) as f64;
                (x, y)
            })
            .collect();
        assert!(pearson(&samples).abs() < 0.2);
    }

    #[test]
    fn test_staleness_threshold() {
        let snapshot = StatsSnapshot {
            id: 1,
            table: "t".into(),
            row_count: 1000,
            columns: vec![],
            indexes: HashMap::new(),
            correlations: vec![],
        };
        assert!(!StatsCollector::is_stale(&snapshot, 1100, 0.2));
        assert!(StatsCollector::is_stale(&snapshot, 1300, 0.2));
        assert!(StatsCollector::is_stale(&snapshot, 100, 0.2));
    }
}
