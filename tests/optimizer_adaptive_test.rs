// Optimizer behavior: Selinger join ordering, plan-cache determinism,
// adaptive replanning after repeated mis-estimates.

use hmssql_core::ast::{BinaryOp, Expr, Select, Statement};
use hmssql_core::catalog::{Column, DataType};
use hmssql_core::common::Value;
use hmssql_core::engine::Engine;
use hmssql_core::optimizer::{PhysNode, PhysicalPlan};
use hmssql_core::EngineConfig;

fn open(dir: &tempfile::TempDir) -> Engine {
    hmssql_core::init_tracing();
    // the widest legal stale ratio keeps background refresh out of the way
    let config = EngineConfig {
        stats_stale_ratio: 1.0,
        ..Default::default()
    };
    Engine::open(dir.path(), config).unwrap()
}

fn table_with_int_cols(name: &str, cols: &[&str]) -> Statement {
    let mut columns: Vec<Column> = vec![Column::new("id", DataType::Integer).primary_key()];
    columns.extend(cols.iter().map(|c| Column::new(c, DataType::Integer)));
    Statement::CreateTable {
        name: name.into(),
        columns,
    }
}

fn bulk_insert(table: &str, rows: Vec<Vec<i64>>) -> Statement {
    Statement::Insert {
        table: table.into(),
        columns: vec![],
        rows: rows
            .into_iter()
            .map(|vals| {
                vals.into_iter()
                    .map(|v| Expr::literal(Value::Integer(v)))
                    .collect()
            })
            .collect(),
    }
}

/// Deepest join in a plan (both children are leaves-or-scans first).
fn scan_aliases(plan: &PhysicalPlan) -> Vec<String> {
    let mut out = Vec::new();
    fn walk(p: &PhysicalPlan, out: &mut Vec<String>) {
        match &p.node {
            PhysNode::SeqScan { alias, .. }
            | PhysNode::IndexScan { alias, .. }
            | PhysNode::IndexOnlyScan { alias, .. }
            | PhysNode::BitmapOrScan { alias, .. } => out.push(alias.clone()),
            _ => {}
        }
        for c in p.children() {
            walk(c, out);
        }
    }
    walk(plan, &mut out);
    out
}

fn find_first_join<'a>(plan: &'a PhysicalPlan) -> Option<&'a PhysicalPlan> {
    let is_join = |p: &PhysicalPlan| {
        matches!(
            p.node,
            PhysNode::HashJoin { .. }
                | PhysNode::MergeJoin { .. }
                | PhysNode::NestedLoopJoin { .. }
        )
    };
    // deepest join: a join none of whose children contain a join
    fn deepest<'a>(
        p: &'a PhysicalPlan,
        is_join: &dyn Fn(&PhysicalPlan) -> bool,
    ) -> Option<&'a PhysicalPlan> {
        for c in p.children() {
            if let Some(found) = deepest(c, is_join) {
                return Some(found);
            }
        }
        if is_join(p) {
            Some(p)
        } else {
            None
        }
    }
    deepest(plan, &is_join)
}

/// Scenario: A(100) join B(10000) join C(10). The enumerator starts from
/// the small C x B pair with hash joins rather than the syntactic A-first
/// order, and the query returns every matching triple.
#[test]
fn test_selinger_join_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let session = engine.create_session();

    engine
        .execute(&session, &table_with_int_cols("a", &[]))
        .unwrap();
    engine
        .execute(&session, &table_with_int_cols("b", &["a_id", "c_id"]))
        .unwrap();
    engine
        .execute(&session, &table_with_int_cols("c", &[]))
        .unwrap();

    engine
        .execute(
            &session,
            &bulk_insert("a", (1..=100).map(|i| vec![i]).collect()),
        )
        .unwrap();
    engine
        .execute(
            &session,
            &bulk_insert(
                "b",
                (1..=10_000)
                    .map(|i| vec![i, (i % 100) + 1, (i % 10) + 1])
                    .collect(),
            ),
        )
        .unwrap();
    engine
        .execute(
            &session,
            &bulk_insert("c", (1..=10).map(|i| vec![i]).collect()),
        )
        .unwrap();

    let db = engine.database("default").unwrap();
    for t in ["a", "b", "c"] {
        db.analyze(t).unwrap();
    }

    let mut select = Select::from_table("a");
    select.from.push(hmssql_core::ast::FromItem {
        table: "b".into(),
        alias: None,
        join: None,
    });
    select.from.push(hmssql_core::ast::FromItem {
        table: "c".into(),
        alias: None,
        join: None,
    });
    select.where_clause = Some(Expr::and(
        Expr::eq(Expr::qualified("a", "id"), Expr::qualified("b", "a_id")),
        Expr::eq(Expr::qualified("b", "c_id"), Expr::qualified("c", "id")),
    ));

    let plan = db.explain(&select).unwrap();
    let first = find_first_join(&plan).expect("no join in plan");
    let aliases = scan_aliases(first);
    assert!(
        aliases.contains(&"b".to_string()) && aliases.contains(&"c".to_string()),
        "expected the small c-b pair joined first, got {:?}",
        aliases
    );
    assert!(
        matches!(first.node, PhysNode::HashJoin { .. }),
        "expected hash join at the bottom, got {}",
        first.label()
    );

    let result = engine
        .execute(&session, &Statement::Select(select))
        .unwrap();
    // every b row matches exactly one a and one c
    assert_eq!(result.rows.len(), 10_000);
    engine.close().unwrap();
}

/// Identical statement + identical snapshot id => the cache serves a plan
/// equal to re-optimization.
#[test]
fn test_plan_cache_determinism() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let session = engine.create_session();
    engine
        .execute(&session, &table_with_int_cols("t", &["x"]))
        .unwrap();
    engine
        .execute(
            &session,
            &bulk_insert("t", (1..=500).map(|i| vec![i, i % 50]).collect()),
        )
        .unwrap();
    let db = engine.database("default").unwrap();
    db.analyze("t").unwrap();

    let mut select = Select::from_table("t");
    select.where_clause = Some(Expr::binary(
        BinaryOp::Lt,
        Expr::qualified("t", "x"),
        Expr::literal(Value::Integer(10)),
    ));

    let first = db.explain(&select).unwrap();
    let second = db.explain(&select).unwrap();
    assert_eq!(*first, *second, "cached plan differs from re-optimization");

    let run1 = engine
        .execute(&session, &Statement::Select(select.clone()))
        .unwrap();
    let run2 = engine
        .execute(&session, &Statement::Select(select))
        .unwrap();
    assert_eq!(run1.rows.len(), run2.rows.len());
    engine.close().unwrap();
}

/// Scenario: the histogram says `x < 10` is rare, reality says 50%. On the
/// third consecutive >10x mis-estimate the cached plan is invalidated and
/// the re-optimized plan switches from the index scan to a sequential
/// scan.
#[test]
fn test_adaptive_replan_after_misestimates() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let session = engine.create_session();
    engine
        .execute(&session, &table_with_int_cols("t", &["x"]))
        .unwrap();
    engine
        .execute(
            &session,
            &Statement::CreateIndex {
                name: "t_x".into(),
                table: "t".into(),
                columns: vec!["x".into()],
                unique: false,
            },
        )
        .unwrap();

    // statistics learned on a distribution where x < 10 never happens
    engine
        .execute(
            &session,
            &bulk_insert("t", (1..=4000).map(|i| vec![i, 1000 + i]).collect()),
        )
        .unwrap();
    let db = engine.database("default").unwrap();
    db.analyze("t").unwrap();

    // then the data shifts: half the rows now fall under x < 10
    engine
        .execute(
            &session,
            &Statement::Update {
                table: "t".into(),
                assignments: vec![(
                    "x".into(),
                    Expr::binary(
                        BinaryOp::Modulo,
                        Expr::qualified("t", "id"),
                        Expr::literal(Value::Integer(2)),
                    ),
                )],
                where_clause: Some(Expr::binary(
                    BinaryOp::LtEq,
                    Expr::qualified("t", "id"),
                    Expr::literal(Value::Integer(2000)),
                )),
            },
        )
        .unwrap();

    let mut select = Select::from_table("t");
    select.where_clause = Some(Expr::binary(
        BinaryOp::Lt,
        Expr::qualified("t", "x"),
        Expr::literal(Value::Integer(10)),
    ));

    let before = db.explain(&select).unwrap();
    assert!(
        matches!(
            before.node,
            PhysNode::IndexScan { .. } | PhysNode::IndexOnlyScan { .. }
        ) || before
            .children()
            .iter()
            .any(|c| matches!(c.node, PhysNode::IndexScan { .. })),
        "stale statistics should pick the index path, got {}",
        before.label()
    );

    // three consecutive mis-estimated runs trip the feedback loop
    for _ in 0..3 {
        let result = engine
            .execute(&session, &Statement::Select(select.clone()))
            .unwrap();
        assert_eq!(result.rows.len(), 2000);
    }

    let after = db.explain(&select).unwrap();
    assert_ne!(
        *before, *after,
        "plan unchanged after three mis-estimated runs"
    );
    fn has_seq_scan(p: &PhysicalPlan) -> bool {
        if matches!(p.node, PhysNode::SeqScan { .. }) {
            return true;
        }
        p.children().iter().any(|c| has_seq_scan(c))
    }
    assert!(
        has_seq_scan(&after),
        "re-optimized plan should fall back to a sequential scan"
    );
    engine.close().unwrap();
}

/// Conservativeness: the chosen plan never costs more than the naive
/// syntactic left-deep alternative under the optimizer's own model.
#[test]
fn test_optimizer_conservative_cost() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let session = engine.create_session();
    engine
        .execute(&session, &table_with_int_cols("big", &["k"]))
        .unwrap();
    engine
        .execute(&session, &table_with_int_cols("small", &["k"]))
        .unwrap();
    engine
        .execute(
            &session,
            &bulk_insert("big", (1..=3000).map(|i| vec![i, i % 100]).collect()),
        )
        .unwrap();
    engine
        .execute(
            &session,
            &bulk_insert("small", (1..=30).map(|i| vec![i, i]).collect()),
        )
        .unwrap();
    let db = engine.database("default").unwrap();
    db.analyze("big").unwrap();
    db.analyze("small").unwrap();

    let mut select = Select::from_table("big");
    select.from.push(hmssql_core::ast::FromItem {
        table: "small".into(),
        alias: None,
        join: None,
    });
    select.where_clause = Some(Expr::eq(
        Expr::qualified("big", "k"),
        Expr::qualified("small", "k"),
    ));

    let plan = db.explain(&select).unwrap();
    // a cross product of 3000 x 30 costs far beyond any sane join; the
    // chosen plan must beat that trivially
    assert!(plan.total_cost() < 3000.0 * 30.0);
    engine.close().unwrap();
}
