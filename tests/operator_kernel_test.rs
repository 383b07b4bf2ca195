// Operator kernel: external sort at scale, join-implementation agreement,
// NaN ordering.

use hmssql_core::ast::{Expr, SortDirection};
use hmssql_core::btree::BTree;
use hmssql_core::common::{Row, Value};
use hmssql_core::error::{DbError, Result};
use hmssql_core::execution::expressions::Schema;
use hmssql_core::execution::hash_join::HashJoin;
use hmssql_core::execution::merge_join::MergeJoin;
use hmssql_core::execution::nested_loop::NestedLoopJoin;
use hmssql_core::execution::sort::SortOp;
use hmssql_core::execution::{ExecContext, Operator, TreeProvider};
use hmssql_core::optimizer::LogicalJoinKind;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The kernel tests run operators standalone; nothing resolves trees.
struct NoTrees;

impl TreeProvider for NoTrees {
    fn primary(&self, table: &str) -> Result<Arc<BTree>> {
        Err(DbError::NotFound(format!("table {}", table)))
    }
    fn index(&self, table: &str, _index: &str) -> Result<Arc<BTree>> {
        Err(DbError::NotFound(format!("table {}", table)))
    }
}

struct VecSource {
    schema: Schema,
    rows: Vec<Row>,
    position: usize,
}

impl VecSource {
    fn new(columns: Vec<&str>, rows: Vec<Row>) -> Self {
        Self {
            schema: Schema::new(columns.into_iter().map(|c| c.to_string()).collect()),
            rows,
            position: 0,
        }
    }
}

impl Operator for VecSource {
    fn open(&mut self, _ctx: &ExecContext<'_>) -> Result<()> {
        self.position = 0;
        Ok(())
    }
    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        if self.position >= self.rows.len() {
            return Ok(None);
        }
        let end = (self.position + ctx.batch_size).min(self.rows.len());
        let batch = self.rows[self.position..end].to_vec();
        self.position = end;
        Ok(Some(batch))
    }
    fn close(&mut self, _ctx: &ExecContext<'_>) -> Result<()> {
        Ok(())
    }
    fn schema(&self) -> &Schema {
        &self.schema
    }
}

fn ctx<'a>(
    catalog: &'a hmssql_core::catalog::Catalog,
    trees: &'a NoTrees,
    tmp: &std::path::Path,
    sort_memory: usize,
) -> ExecContext<'a> {
    hmssql_core::init_tracing();
    ExecContext {
        catalog,
        trees,
        batch_size: 1024,
        deadline: Instant::now() + Duration::from_secs(600),
        snapshot_lsn: None,
        tmp_dir: tmp.to_path_buf(),
        sort_memory_bytes: sort_memory,
        hash_memory_bytes: 1 << 20,
        spill_partitions: 8,
        cancelled: None,
    }
}

fn drain(op: &mut dyn Operator, ctx: &ExecContext<'_>) -> Vec<Row> {
    let mut out = Vec::new();
    op.open(ctx).unwrap();
    while let Some(batch) = op.next_batch(ctx).unwrap() {
        out.extend(batch);
    }
    op.close(ctx).unwrap();
    out
}

/// Scenario: one million random 64-bit integers under a 16 MiB budget
/// spill to runs, merge back non-decreasing, and the tmp dir ends empty.
#[test]
fn test_external_sort_one_million() {
    let dir = tempfile::tempdir().unwrap();
    let catalog_dir = tempfile::tempdir().unwrap();
    let catalog = hmssql_core::catalog::Catalog::open(catalog_dir.path()).unwrap();
    let trees = NoTrees;

    // xorshift keeps the input deterministic without a seed file
    let mut state = 0x2545F4914F6CDD1Du64;
    let rows: Vec<Row> = (0..1_000_000)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            vec![Value::Integer(state as i64)]
        })
        .collect();

    let source = VecSource::new(vec!["t.x"], rows);
    let mut sort = SortOp::new(
        Box::new(source),
        vec![(Expr::qualified("t", "x"), SortDirection::Asc)],
    );
    let ctx = ctx(&catalog, &trees, dir.path(), 16 * 1024 * 1024);
    let out = drain(&mut sort, &ctx);

    assert_eq!(out.len(), 1_000_000);
    let mut prev = i64::MIN;
    for row in &out {
        let Value::Integer(x) = row[0] else {
            panic!("wrong type")
        };
        assert!(x >= prev, "output not non-decreasing");
        prev = x;
    }
    // temp runs removed on success
    let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftovers, 0, "temp files left behind");
}

fn join_inputs() -> (Vec<Row>, Vec<Row>) {
    let left: Vec<Row> = (0..200)
        .map(|i| vec![Value::Integer(i % 20), Value::Integer(i)])
        .collect();
    let right: Vec<Row> = (0..50)
        .map(|i| vec![Value::Integer(i % 25), Value::String(format!("r{}", i))])
        .collect();
    (left, right)
}

fn normalize(mut rows: Vec<Row>) -> Vec<Row> {
    rows.sort_by(|a, b| {
        for (x, y) in a.iter().zip(b.iter()) {
            match x.total_cmp(y) {
                std::cmp::Ordering::Equal => continue,
                other => return other,
            }
        }
        std::cmp::Ordering::Equal
    });
    rows
}

/// The same equi-join evaluates to the same multiset under hash, merge,
/// and nested-loop implementations.
#[test]
fn test_join_implementation_agreement() {
    let dir = tempfile::tempdir().unwrap();
    let catalog_dir = tempfile::tempdir().unwrap();
    let catalog = hmssql_core::catalog::Catalog::open(catalog_dir.path()).unwrap();
    let trees = NoTrees;
    let ctx = ctx(&catalog, &trees, dir.path(), 1 << 20);

    let (left, right) = join_inputs();
    let lkey = Expr::qualified("l", "k");
    let rkey = Expr::qualified("r", "k");

    let mut hash = HashJoin::new(
        Box::new(VecSource::new(vec!["l.k", "l.v"], left.clone())),
        Box::new(VecSource::new(vec!["r.k", "r.name"], right.clone())),
        vec![lkey.clone()],
        vec![rkey.clone()],
        LogicalJoinKind::Inner,
        None,
        Schema::new(vec![
            "l.k".into(),
            "l.v".into(),
            "r.k".into(),
            "r.name".into(),
        ]),
    );
    let hash_out = normalize(drain(&mut hash, &ctx));

    // merge join needs sorted inputs
    let sorted_left = {
        let mut src = SortOp::new(
            Box::new(VecSource::new(vec!["l.k", "l.v"], left.clone())),
            vec![(lkey.clone(), SortDirection::Asc)],
        );
        drain(&mut src, &ctx)
    };
    let sorted_right = {
        let mut src = SortOp::new(
            Box::new(VecSource::new(vec!["r.k", "r.name"], right.clone())),
            vec![(rkey.clone(), SortDirection::Asc)],
        );
        drain(&mut src, &ctx)
    };
    let mut merge = MergeJoin::new(
        Box::new(VecSource::new(vec!["l.k", "l.v"], sorted_left)),
        Box::new(VecSource::new(vec!["r.k", "r.name"], sorted_right)),
        vec![lkey.clone()],
        vec![rkey.clone()],
        LogicalJoinKind::Inner,
        None,
        Schema::new(vec![
            "l.k".into(),
            "l.v".into(),
            "r.k".into(),
            "r.name".into(),
        ]),
    );
    let merge_out = normalize(drain(&mut merge, &ctx));

    let mut nested = NestedLoopJoin::new(
        Box::new(VecSource::new(vec!["l.k", "l.v"], left)),
        Box::new(VecSource::new(vec!["r.k", "r.name"], right)),
        LogicalJoinKind::Inner,
        Some(Expr::eq(lkey, rkey)),
        Schema::new(vec![
            "l.k".into(),
            "l.v".into(),
            "r.k".into(),
            "r.name".into(),
        ]),
    );
    let nested_out = normalize(drain(&mut nested, &ctx));

    assert_eq!(hash_out.len(), nested_out.len());
    assert_eq!(hash_out, nested_out, "hash vs nested loop disagree");
    assert_eq!(hash_out, merge_out, "hash vs merge disagree");
}

/// Null join keys never match in any implementation.
#[test]
fn test_null_keys_never_match() {
    let dir = tempfile::tempdir().unwrap();
    let catalog_dir = tempfile::tempdir().unwrap();
    let catalog = hmssql_core::catalog::Catalog::open(catalog_dir.path()).unwrap();
    let trees = NoTrees;
    let ctx = ctx(&catalog, &trees, dir.path(), 1 << 20);

    let left = vec![
        vec![Value::Null, Value::Integer(1)],
        vec![Value::Integer(7), Value::Integer(2)],
    ];
    let right = vec![
        vec![Value::Null, Value::String("x".into())],
        vec![Value::Integer(7), Value::String("y".into())],
    ];
    let mut hash = HashJoin::new(
        Box::new(VecSource::new(vec!["l.k", "l.v"], left)),
        Box::new(VecSource::new(vec!["r.k", "r.name"], right)),
        vec![Expr::qualified("l", "k")],
        vec![Expr::qualified("r", "k")],
        LogicalJoinKind::Inner,
        None,
        Schema::new(vec![
            "l.k".into(),
            "l.v".into(),
            "r.k".into(),
            "r.name".into(),
        ]),
    );
    let out = drain(&mut hash, &ctx);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0][0], Value::Integer(7));
}

/// NaN sorts last among doubles, infinities at the extremes, and the
/// signed zeros order by sign.
#[test]
fn test_sort_nan_last() {
    let dir = tempfile::tempdir().unwrap();
    let catalog_dir = tempfile::tempdir().unwrap();
    let catalog = hmssql_core::catalog::Catalog::open(catalog_dir.path()).unwrap();
    let trees = NoTrees;
    let ctx = ctx(&catalog, &trees, dir.path(), 1 << 20);

    let rows: Vec<Row> = vec![
        vec![Value::Double(f64::NAN)],
        vec![Value::Double(1.5)],
        vec![Value::Double(0.0)],
        vec![Value::Double(f64::NEG_INFINITY)],
        vec![Value::Double(-0.0)],
        vec![Value::Double(f64::INFINITY)],
        vec![Value::Double(-2.5)],
    ];
    let mut sort = SortOp::new(
        Box::new(VecSource::new(vec!["t.x"], rows)),
        vec![(Expr::qualified("t", "x"), SortDirection::Asc)],
    );
    let out = drain(&mut sort, &ctx);
    assert_eq!(out[0][0], Value::Double(f64::NEG_INFINITY));
    assert_eq!(out[1][0], Value::Double(-2.5));
    assert!(
        matches!(out[2][0], Value::Double(d) if d == 0.0 && d.is_sign_negative()),
        "-0.0 must precede +0.0"
    );
    assert!(matches!(out[3][0], Value::Double(d) if d == 0.0 && !d.is_sign_negative()));
    assert_eq!(out[4][0], Value::Double(1.5));
    assert_eq!(out[5][0], Value::Double(f64::INFINITY));
    assert!(matches!(out[6][0], Value::Double(d) if d.is_nan()));
}
