// Cost model.
//
// Cost = CPU + IO + MEM (+ NET, reserved) in abstract units calibrated
// once at startup. Cardinalities come from the published statistics
// snapshots: histograms for predicate selectivity, NDV for equality and
// join estimates, stored correlations to adjust multi-predicate joins.

use crate::ast::{BinaryOp, Expr};
use crate::catalog::TableDescriptor;
use crate::common::Value;
use crate::optimizer::physical::Cost;
use crate::stats::{numeric_rank, StatsSnapshot};
use std::collections::HashMap;
use std::sync::Arc;

/// Cost parameters; the defaults mirror a spinning-disk-biased calibration
/// with random IO at 4x sequential.
#[derive(Debug, Clone)]
pub struct CostParams {
    pub cpu_tuple_cost: f64,
    pub cpu_operator_cost: f64,
    pub seq_page_cost: f64,
    pub random_page_cost: f64,
    pub mem_byte_cost: f64,
    pub net_tuple_cost: f64,
    /// bytes per tuple assumed when width is unknown
    pub default_tuple_width: f64,
}

impl Default for CostParams {
    fn default() -> Self {
        Self {
            cpu_tuple_cost: 0.01,
            cpu_operator_cost: 0.0025,
            seq_page_cost: 1.0,
            random_page_cost: 4.0,
            mem_byte_cost: 0.000001,
            net_tuple_cost: 0.0,
            default_tuple_width: 64.0,
        }
    }
}

/// Everything the planner knows about the world for one optimization run.
pub struct PlannerContext {
    pub snapshots: HashMap<String, Arc<StatsSnapshot>>,
    pub live_rows: HashMap<String, u64>,
    pub tables: HashMap<String, TableDescriptor>,
    /// clustering factor per index name
    pub clustering: HashMap<String, f64>,
    /// adaptive cardinality hints per relation alias (observed rows)
    pub row_hints: HashMap<String, f64>,
    pub page_size: usize,
    pub sort_memory_bytes: usize,
    pub hash_memory_bytes: usize,
}

impl PlannerContext {
    pub fn table_rows(&self, table: &str) -> f64 {
        if let Some(r) = self.live_rows.get(table) {
            return *r as f64;
        }
        self.snapshots
            .get(table)
            .map(|s| s.row_count as f64)
            .unwrap_or(1000.0)
    }

    pub fn table_pages(&self, table: &str, params: &CostParams) -> f64 {
        let rows = self.table_rows(table);
        let per_page = (self.page_size as f64 / params.default_tuple_width).max(1.0);
        (rows / per_page).max(1.0)
    }

    pub fn snapshot(&self, table: &str) -> Option<&Arc<StatsSnapshot>> {
        self.snapshots.get(table)
    }
}

pub struct CostModel {
    pub params: CostParams,
}

impl CostModel {
    pub fn new(params: CostParams) -> Self {
        Self { params }
    }

    // ------------------------------------------------------------------
    // selectivity
    // ------------------------------------------------------------------

    /// Selectivity of a predicate over one relation, histogram-backed when
    /// a snapshot exists, defaulted otherwise.
    pub fn selectivity(
        &self,
        predicate: &Expr,
        table: &str,
        ctx: &PlannerContext,
    ) -> f64 {
        match predicate {
            Expr::Binary {
                op: BinaryOp::And,
                left,
                right,
            } => self.selectivity(left, table, ctx) * self.selectivity(right, table, ctx),
            Expr::Binary {
                op: BinaryOp::Or,
                left,
                right,
            } => {
                let a = self.selectivity(left, table, ctx);
                let b = self.selectivity(right, table, ctx);
                (a + b - a * b).clamp(0.0, 1.0)
            }
            Expr::Not(inner) => 1.0 - self.selectivity(inner, table, ctx),
            Expr::Binary { op, left, right } if op.is_comparison() => {
                self.comparison_selectivity(*op, left, right, table, ctx)
            }
            Expr::IsNull(inner) => self
                .column_of(inner)
                .and_then(|c| ctx.snapshot(table).and_then(|s| s.column(&c).map(|cs| cs.null_fraction)))
                .unwrap_or(0.05),
            Expr::IsNotNull(inner) => {
                1.0 - self
                    .column_of(inner)
                    .and_then(|c| {
                        ctx.snapshot(table)
                            .and_then(|s| s.column(&c).map(|cs| cs.null_fraction))
                    })
                    .unwrap_or(0.05)
            }
            Expr::InList { list, .. } => (list.len() as f64 * 0.05).clamp(0.0, 1.0),
            Expr::Literal(Value::Boolean(true)) => 1.0,
            Expr::Literal(Value::Boolean(false)) => 0.0,
            _ => 0.33,
        }
    }

    fn comparison_selectivity(
        &self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        table: &str,
        ctx: &PlannerContext,
    ) -> f64 {
        // normalize to column <op> literal
        let (column, literal, op) = match (self.column_of(left), literal_of(right)) {
            (Some(c), Some(v)) => (c, v, op),
            _ => match (self.column_of(right), literal_of(left)) {
                (Some(c), Some(v)) => (c, v, flip(op)),
                _ => return default_comparison_selectivity(op),
            },
        };
        let Some(snapshot) = ctx.snapshot(table) else {
            return default_comparison_selectivity(op);
        };
        let Some(stats) = snapshot.column(&column) else {
            return default_comparison_selectivity(op);
        };
        let Some(x) = numeric_rank(&literal) else {
            return default_comparison_selectivity(op);
        };
        let h = &stats.histogram;
        match op {
            BinaryOp::Eq => {
                if stats.ndv > 0 {
                    (1.0 / stats.ndv as f64).min(h.selectivity_eq(x).max(1.0 / stats.ndv as f64))
                } else {
                    h.selectivity_eq(x)
                }
            }
            BinaryOp::NotEq => 1.0 - h.selectivity_eq(x),
            BinaryOp::Lt => h.selectivity_range(None, Some((x, false))),
            BinaryOp::LtEq => h.selectivity_range(None, Some((x, true))),
            BinaryOp::Gt => h.selectivity_range(Some((x, false)), None),
            BinaryOp::GtEq => h.selectivity_range(Some((x, true)), None),
            _ => default_comparison_selectivity(op),
        }
    }

    fn column_of(&self, expr: &Expr) -> Option<String> {
        match expr {
            Expr::Column { column, .. } => Some(column.clone()),
            _ => None,
        }
    }

    /// Join output cardinality: |L| x |R| x min over equi predicates of
    /// 1/max(NDV_l, NDV_r), scaled toward independence by any stored
    /// correlation between the key columns.
    pub fn join_cardinality(
        &self,
        left_rows: f64,
        right_rows: f64,
        equi_keys: &[(String, String, String, String)], // (ltable, lcol, rtable, rcol)
        ctx: &PlannerContext,
    ) -> f64 {
        if equi_keys.is_empty() {
            return left_rows * right_rows;
        }
        let mut best = f64::INFINITY;
        for (lt, lc, rt, rc) in equi_keys {
            let ndv_l = ctx
                .snapshot(lt)
                .and_then(|s| s.column(lc))
                .map(|c| c.ndv.max(1) as f64)
                .unwrap_or(left_rows.max(1.0) / 10.0);
            let ndv_r = ctx
                .snapshot(rt)
                .and_then(|s| s.column(rc))
                .map(|c| c.ndv.max(1) as f64)
                .unwrap_or(right_rows.max(1.0) / 10.0);
            let mut sel = 1.0 / ndv_l.max(ndv_r).max(1.0);
            // correlated keys make the minimum-selectivity assumption too
            // aggressive across multiple predicates; widen accordingly
            if let Some(snapshot) = ctx.snapshot(lt) {
                if let (Some((ai, _)), Some((bi, _))) = (
                    ctx.tables.get(lt).and_then(|t| t.column(lc)),
                    ctx.tables.get(lt).and_then(|t| t.column(rc)),
                ) {
                    if let Some(corr) = snapshot.correlation(ai, bi) {
                        sel *= 1.0 + corr.abs();
                    }
                }
            }
            best = best.min(sel);
        }
        (left_rows * right_rows * best).max(1.0)
    }

    // ------------------------------------------------------------------
    // operator costs
    // ------------------------------------------------------------------

    pub fn seq_scan(&self, table: &str, sel: f64, ctx: &PlannerContext) -> (f64, Cost) {
        let rows = ctx.table_rows(table);
        let pages = ctx.table_pages(table, &self.params);
        let out = (rows * sel).max(1.0);
        let cost = Cost::new(
            rows * self.params.cpu_tuple_cost,
            pages * self.params.seq_page_cost,
            0.0,
            0.0,
        );
        (out, cost)
    }

    /// Index scan: height random IOs to seek, leaf pages sequential along
    /// the chain, then a random heap IO per matching row discounted by the
    /// clustering factor.
    pub fn index_scan(
        &self,
        table: &str,
        index: &str,
        sel: f64,
        covered: bool,
        ctx: &PlannerContext,
    ) -> (f64, Cost) {
        let rows = ctx.table_rows(table);
        let matching = (rows * sel).max(1.0);
        let snapshot = ctx.snapshot(table);
        let (height, leaf_count) = snapshot
            .and_then(|s| s.indexes.get(index))
            .map(|i| (i.height.max(1) as f64, i.leaf_count.max(1) as f64))
            .unwrap_or((2.0, (rows / 100.0).max(1.0)));
        let leaf_pages = (leaf_count * sel).max(1.0);
        let descend = height * self.params.random_page_cost;
        let leaf_io = leaf_pages * self.params.seq_page_cost;
        let heap_io = if covered {
            0.0
        } else {
            let clustering = ctx.clustering.get(index).copied().unwrap_or(1.0);
            // perfectly clustered indexes touch each heap page once
            matching * self.params.random_page_cost * clustering.clamp(0.05, 1.0)
        };
        let cost = Cost::new(
            matching * self.params.cpu_tuple_cost,
            descend + leaf_io + heap_io,
            0.0,
            0.0,
        );
        (matching, cost)
    }

    pub fn bitmap_or_scan(
        &self,
        table: &str,
        sels: &[f64],
        ctx: &PlannerContext,
    ) -> (f64, Cost) {
        let rows = ctx.table_rows(table);
        let combined = 1.0 - sels.iter().fold(1.0, |acc, s| acc * (1.0 - s));
        let matching = (rows * combined).max(1.0);
        // per-probe descents plus one sorted pass over matching heap pages
        let probes = sels.len() as f64 * 2.0 * self.params.random_page_cost;
        let heap = matching * self.params.seq_page_cost * 0.5;
        (
            matching,
            Cost::new(matching * self.params.cpu_tuple_cost, probes + heap, 0.0, 0.0),
        )
    }

    pub fn hash_join(
        &self,
        build_rows: f64,
        probe_rows: f64,
        out_rows: f64,
    ) -> Cost {
        let build_bytes = build_rows * self.params.default_tuple_width;
        let mem = build_bytes * self.params.mem_byte_cost;
        let cpu = (build_rows + probe_rows) * self.params.cpu_tuple_cost
            + out_rows * self.params.cpu_operator_cost;
        // spill both sides through temp files when the build overflows
        let budget = self.hash_budget_bytes();
        let io = if build_bytes > budget {
            let pages = (build_bytes + probe_rows * self.params.default_tuple_width)
                / self.params.default_tuple_width
                / 64.0;
            2.0 * pages * self.params.seq_page_cost
        } else {
            0.0
        };
        Cost::new(cpu, io, mem, 0.0)
    }

    fn hash_budget_bytes(&self) -> f64 {
        // overridden per-context by the planner; default keeps the model total
        64.0 * 1024.0 * 1024.0
    }

    pub fn merge_join(&self, left_rows: f64, right_rows: f64, out_rows: f64) -> Cost {
        Cost::new(
            (left_rows + right_rows) * self.params.cpu_tuple_cost
                + out_rows * self.params.cpu_operator_cost,
            0.0,
            0.0,
            0.0,
        )
    }

    pub fn nested_loop_join(&self, outer_rows: f64, inner_rows: f64, inner_cost: f64) -> Cost {
        Cost::new(
            outer_rows * inner_rows * self.params.cpu_operator_cost,
            outer_rows * inner_cost * 0.1,
            0.0,
            0.0,
        )
    }

    pub fn index_nested_loop(&self, outer_rows: f64, lookup_height: f64) -> Cost {
        Cost::new(
            outer_rows * self.params.cpu_tuple_cost,
            outer_rows * lookup_height * self.params.random_page_cost,
            0.0,
            0.0,
        )
    }

    /// n log n comparisons plus external spill IO when the input exceeds
    /// the sort budget.
    pub fn sort(&self, rows: f64, sort_memory_bytes: usize) -> Cost {
        let n = rows.max(2.0);
        let cpu = n * n.log2() * self.params.cpu_operator_cost;
        let bytes = n * self.params.default_tuple_width;
        let io = if bytes > sort_memory_bytes as f64 {
            // two full passes: run generation + merge
            2.0 * (bytes / self.params.default_tuple_width / 64.0) * self.params.seq_page_cost
        } else {
            0.0
        };
        Cost::new(cpu, io, bytes.min(sort_memory_bytes as f64) * self.params.mem_byte_cost, 0.0)
    }

    pub fn aggregate(&self, rows: f64, groups: f64, hashed: bool) -> Cost {
        let cpu = rows * self.params.cpu_tuple_cost;
        let mem = if hashed {
            groups * self.params.default_tuple_width * self.params.mem_byte_cost
        } else {
            0.0
        };
        Cost::new(cpu, 0.0, mem, 0.0)
    }
}

fn literal_of(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Literal(v) => Some(v.clone()),
        _ => None,
    }
}

fn flip(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Lt => BinaryOp::Gt,
        BinaryOp::LtEq => BinaryOp::GtEq,
        BinaryOp::Gt => BinaryOp::Lt,
        BinaryOp::GtEq => BinaryOp::LtEq,
        other => other,
    }
}

fn default_comparison_selectivity(op: BinaryOp) -> f64 {
    match op {
        BinaryOp::Eq => 0.05,
        BinaryOp::NotEq => 0.95,
        _ => 0.33,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{ColumnStats, Histogram};

    fn ctx_with_histogram() -> PlannerContext {
        let sample: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let snapshot = StatsSnapshot {
            id: 1,
            table: "t".into(),
            row_count: 1000,
            columns: vec![ColumnStats {
                name: "x".into(),
                ndv: 1000,
                min: Some(Value::Integer(0)),
                max: Some(Value::Integer(999)),
                null_fraction: 0.0,
                histogram: Histogram::build(&sample, 64),
            }],
            indexes: Default::default(),
            correlations: vec![],
        };
        let mut snapshots = HashMap::new();
        snapshots.insert("t".to_string(), Arc::new(snapshot));
        PlannerContext {
            snapshots,
            live_rows: HashMap::new(),
            tables: HashMap::new(),
            clustering: HashMap::new(),
            row_hints: HashMap::new(),
            page_size: 4096,
            sort_memory_bytes: 1 << 20,
            hash_memory_bytes: 1 << 20,
        }
    }

    #[test]
    fn test_histogram_backed_selectivity() {
        let model = CostModel::new(CostParams::default());
        let ctx = ctx_with_histogram();
        let pred = Expr::binary(
            BinaryOp::Lt,
            Expr::column("x"),
            Expr::literal(Value::Integer(100)),
        );
        let sel = model.selectivity(&pred, "t", &ctx);
        assert!((sel - 0.1).abs() < 0.05, "selectivity {}", sel);
    }

    #[test]
    fn test_eq_uses_ndv() {
        let model = CostModel::new(CostParams::default());
        let ctx = ctx_with_histogram();
        let pred = Expr::eq(Expr::column("x"), Expr::literal(Value::Integer(5)));
        let sel = model.selectivity(&pred, "t", &ctx);
        assert!(sel <= 0.01, "selectivity {}", sel);
    }

    #[test]
    fn test_join_cardinality_min_rule() {
        let model = CostModel::new(CostParams::default());
        let ctx = ctx_with_histogram();
        let keys = vec![(
            "t".to_string(),
            "x".to_string(),
            "t".to_string(),
            "x".to_string(),
        )];
        let out = model.join_cardinality(1000.0, 1000.0, &keys, &ctx);
        // 1000*1000/1000 = 1000
        assert!((out - 1000.0).abs() < 100.0, "cardinality {}", out);
    }

    #[test]
    fn test_seq_vs_index_crossover() {
        let model = CostModel::new(CostParams::default());
        let ctx = ctx_with_histogram();
        // selective predicate: index wins
        let (_, seq) = model.seq_scan("t", 0.01, &ctx);
        let (_, idx) = model.index_scan("t", "t_x", 0.01, false, &ctx);
        assert!(idx.total() < seq.total());
        // unselective predicate: sequential wins
        let (_, seq) = model.seq_scan("t", 0.9, &ctx);
        let (_, idx) = model.index_scan("t", "t_x", 0.9, false, &ctx);
        assert!(seq.total() < idx.total());
    }

    #[test]
    fn test_sort_spill_adds_io() {
        let model = CostModel::new(CostParams::default());
        let in_mem = model.sort(1000.0, 1 << 30);
        let spilled = model.sort(1000.0, 1 << 10);
        assert_eq!(in_mem.io, 0.0);
        assert!(spilled.io > 0.0);
    }
}
