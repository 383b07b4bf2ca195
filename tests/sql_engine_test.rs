// SQL surface: uniqueness, updates, transactions, aggregates, set ops,
// views.

use hmssql_core::ast::{
    BinaryOp, Expr, OrderByItem, Select, SetOpKind, SortDirection, Statement,
};
use hmssql_core::catalog::{Column, DataType};
use hmssql_core::common::Value;
use hmssql_core::engine::Engine;
use hmssql_core::{DbError, EngineConfig};

fn open(dir: &tempfile::TempDir) -> Engine {
    hmssql_core::init_tracing();
    Engine::open(dir.path(), EngineConfig::default()).unwrap()
}

fn users_table() -> Statement {
    Statement::CreateTable {
        name: "users".into(),
        columns: vec![
            Column::new("id", DataType::Integer).primary_key(),
            Column::new("email", DataType::Text).not_null(),
            Column::new("score", DataType::Integer),
        ],
    }
}

fn insert_user(id: i64, email: &str, score: i64) -> Statement {
    Statement::Insert {
        table: "users".into(),
        columns: vec![],
        rows: vec![vec![
            Expr::literal(Value::Integer(id)),
            Expr::literal(Value::String(email.into())),
            Expr::literal(Value::Integer(score)),
        ]],
    }
}

/// Scenario: unique index on email rejects the duplicate and leaves the
/// base table untouched.
#[test]
fn test_unique_index_violation() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let session = engine.create_session();
    engine.execute(&session, &users_table()).unwrap();
    engine
        .execute(
            &session,
            &Statement::CreateIndex {
                name: "users_email".into(),
                table: "users".into(),
                columns: vec!["email".into()],
                unique: true,
            },
        )
        .unwrap();

    engine.execute(&session, &insert_user(1, "a@x", 10)).unwrap();
    engine.execute(&session, &insert_user(2, "b@x", 20)).unwrap();

    let err = engine
        .execute(&session, &insert_user(3, "a@x", 30))
        .unwrap_err();
    assert!(
        matches!(err, DbError::UniquenessViolation { .. }),
        "got {:?}",
        err
    );

    let all = engine
        .execute(&session, &Statement::Select(Select::from_table("users")))
        .unwrap();
    assert_eq!(all.rows.len(), 2, "base table changed by failed insert");
    engine.close().unwrap();
}

#[test]
fn test_not_null_and_type_checks() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let session = engine.create_session();
    engine.execute(&session, &users_table()).unwrap();

    let null_email = Statement::Insert {
        table: "users".into(),
        columns: vec!["id".into()],
        rows: vec![vec![Expr::literal(Value::Integer(1))]],
    };
    assert!(matches!(
        engine.execute(&session, &null_email),
        Err(DbError::NotNullViolation(_))
    ));

    let wrong_type = Statement::Insert {
        table: "users".into(),
        columns: vec![],
        rows: vec![vec![
            Expr::literal(Value::String("oops".into())),
            Expr::literal(Value::String("a@x".into())),
            Expr::literal(Value::Integer(1)),
        ]],
    };
    assert!(matches!(
        engine.execute(&session, &wrong_type),
        Err(DbError::TypeMismatch(_))
    ));
    engine.close().unwrap();
}

#[test]
fn test_update_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let session = engine.create_session();
    engine.execute(&session, &users_table()).unwrap();
    for i in 1..=10 {
        engine
            .execute(&session, &insert_user(i, &format!("u{}@x", i), i * 10))
            .unwrap();
    }

    let update = Statement::Update {
        table: "users".into(),
        assignments: vec![(
            "score".into(),
            Expr::binary(
                BinaryOp::Add,
                Expr::qualified("users", "score"),
                Expr::literal(Value::Integer(1)),
            ),
        )],
        where_clause: Some(Expr::binary(
            BinaryOp::LtEq,
            Expr::qualified("users", "id"),
            Expr::literal(Value::Integer(5)),
        )),
    };
    let result = engine.execute(&session, &update).unwrap();
    assert_eq!(result.stats.rows, 5);

    let delete = Statement::Delete {
        table: "users".into(),
        where_clause: Some(Expr::binary(
            BinaryOp::Gt,
            Expr::qualified("users", "id"),
            Expr::literal(Value::Integer(8)),
        )),
    };
    let result = engine.execute(&session, &delete).unwrap();
    assert_eq!(result.stats.rows, 2);

    let all = engine
        .execute(&session, &Statement::Select(Select::from_table("users")))
        .unwrap();
    assert_eq!(all.rows.len(), 8);
    // id 1 got +1, id 6 did not
    let score_of = |id: i64| {
        all.rows
            .iter()
            .find(|r| r[0] == Value::Integer(id))
            .map(|r| r[2].clone())
            .unwrap()
    };
    assert_eq!(score_of(1), Value::Integer(11));
    assert_eq!(score_of(6), Value::Integer(60));
    engine.close().unwrap();
}

#[test]
fn test_rollback_undoes_writes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let session = engine.create_session();
    engine.execute(&session, &users_table()).unwrap();
    engine.execute(&session, &insert_user(1, "keep@x", 1)).unwrap();

    engine.execute(&session, &Statement::Begin).unwrap();
    engine.execute(&session, &insert_user(2, "gone@x", 2)).unwrap();
    engine
        .execute(
            &session,
            &Statement::Update {
                table: "users".into(),
                assignments: vec![("score".into(), Expr::literal(Value::Integer(99)))],
                where_clause: None,
            },
        )
        .unwrap();
    engine.execute(&session, &Statement::Rollback).unwrap();

    let all = engine
        .execute(&session, &Statement::Select(Select::from_table("users")))
        .unwrap();
    assert_eq!(all.rows.len(), 1);
    assert_eq!(all.rows[0][0], Value::Integer(1));
    assert_eq!(all.rows[0][2], Value::Integer(1), "update not rolled back");
    engine.close().unwrap();
}

#[test]
fn test_aggregates_with_group_by_and_having() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let session = engine.create_session();
    engine.execute(&session, &users_table()).unwrap();
    for i in 1..=12 {
        engine
            .execute(
                &session,
                &insert_user(i, &format!("u{}@x", i), i % 3),
            )
            .unwrap();
    }

    let mut select = Select::from_table("users");
    select.projection = vec![
        (Expr::qualified("users", "score"), None),
        (
            Expr::Call {
                function: "COUNT".into(),
                args: vec![],
            },
            Some("n".into()),
        ),
        (
            Expr::Call {
                function: "AVG".into(),
                args: vec![Expr::qualified("users", "id")],
            },
            Some("avg_id".into()),
        ),
    ];
    select.group_by = vec![Expr::qualified("users", "score")];
    select.having = Some(Expr::binary(
        BinaryOp::GtEq,
        Expr::column("n"),
        Expr::literal(Value::Integer(4)),
    ));

    let result = engine
        .execute(&session, &Statement::Select(select))
        .unwrap();
    // 12 rows over 3 score groups of 4 each; all pass HAVING
    assert_eq!(result.rows.len(), 3);
    for row in &result.rows {
        assert_eq!(row[1], Value::Integer(4));
        assert!(matches!(row[2], Value::Double(_)));
    }
    engine.close().unwrap();
}

#[test]
fn test_order_by_limit_offset() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let session = engine.create_session();
    engine.execute(&session, &users_table()).unwrap();
    for i in 1..=20 {
        engine
            .execute(&session, &insert_user(i, &format!("u{}@x", i), 100 - i))
            .unwrap();
    }

    let mut select = Select::from_table("users");
    select.order_by = vec![OrderByItem {
        expr: Expr::qualified("users", "score"),
        direction: SortDirection::Desc,
    }];
    select.limit = Some(5);
    select.offset = Some(2);

    let result = engine
        .execute(&session, &Statement::Select(select))
        .unwrap();
    assert_eq!(result.rows.len(), 5);
    // scores descend 99..80; offset 2 -> 97, 96, ...
    assert_eq!(result.rows[0][2], Value::Integer(97));
    assert_eq!(result.rows[4][2], Value::Integer(93));
    engine.close().unwrap();
}

#[test]
fn test_set_operations() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let session = engine.create_session();
    for name in ["a", "b"] {
        engine
            .execute(
                &session,
                &Statement::CreateTable {
                    name: name.into(),
                    columns: vec![Column::new("x", DataType::Integer).primary_key()],
                },
            )
            .unwrap();
    }
    let fill = |table: &str, range: std::ops::RangeInclusive<i64>| Statement::Insert {
        table: table.into(),
        columns: vec![],
        rows: range
            .map(|i| vec![Expr::literal(Value::Integer(i))])
            .collect(),
    };
    engine.execute(&session, &fill("a", 1..=6)).unwrap();
    engine.execute(&session, &fill("b", 4..=9)).unwrap();

    let run_set = |kind: SetOpKind| {
        let mut left = Select::from_table("a");
        left.set_op = Some((kind, Box::new(Select::from_table("b"))));
        engine
            .execute(&session, &Statement::Select(left))
            .unwrap()
            .rows
            .len()
    };

    assert_eq!(run_set(SetOpKind::Union { all: true }), 12);
    assert_eq!(run_set(SetOpKind::Union { all: false }), 9);
    assert_eq!(run_set(SetOpKind::Intersect), 3); // 4, 5, 6
    assert_eq!(run_set(SetOpKind::Except), 3); // 1, 2, 3
    engine.close().unwrap();
}

#[test]
fn test_views_expand_at_plan_time() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let session = engine.create_session();
    engine.execute(&session, &users_table()).unwrap();
    for i in 1..=10 {
        engine
            .execute(&session, &insert_user(i, &format!("u{}@x", i), i))
            .unwrap();
    }

    let mut view_query = Select::from_table("users");
    view_query.where_clause = Some(Expr::binary(
        BinaryOp::Gt,
        Expr::qualified("users", "score"),
        Expr::literal(Value::Integer(7)),
    ));
    engine
        .execute(
            &session,
            &Statement::CreateView {
                name: "high_scores".into(),
                query: view_query,
            },
        )
        .unwrap();

    let result = engine
        .execute(
            &session,
            &Statement::Select(Select::from_table("high_scores")),
        )
        .unwrap();
    assert_eq!(result.rows.len(), 3);
    engine.close().unwrap();
}

#[test]
fn test_rowid_table_without_primary_key() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let session = engine.create_session();
    engine
        .execute(
            &session,
            &Statement::CreateTable {
                name: "log".into(),
                columns: vec![Column::new("msg", DataType::Text)],
            },
        )
        .unwrap();
    for i in 0..5 {
        engine
            .execute(
                &session,
                &Statement::Insert {
                    table: "log".into(),
                    columns: vec![],
                    rows: vec![vec![Expr::literal(Value::String(format!("m{}", i)))]],
                },
            )
            .unwrap();
    }
    let all = engine
        .execute(&session, &Statement::Select(Select::from_table("log")))
        .unwrap();
    assert_eq!(all.rows.len(), 5);
    // insertion order preserved by the implicit monotonic row id
    assert_eq!(all.rows[0][0], Value::String("m0".into()));
    assert_eq!(all.rows[4][0], Value::String("m4".into()));
    engine.close().unwrap();
}

#[test]
fn test_wait_die_aborts_younger_writer() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(&dir);
    let s1 = engine.create_session();
    let s2 = engine.create_session();
    engine.execute(&s1, &users_table()).unwrap();
    engine.execute(&s1, &insert_user(1, "a@x", 1)).unwrap();

    // older transaction takes the row lock
    engine.execute(&s1, &Statement::Begin).unwrap();
    engine
        .execute(
            &s1,
            &Statement::Update {
                table: "users".into(),
                assignments: vec![("score".into(), Expr::literal(Value::Integer(2)))],
                where_clause: None,
            },
        )
        .unwrap();

    // the younger transaction must die, not wait
    engine.execute(&s2, &Statement::Begin).unwrap();
    let err = engine
        .execute(
            &s2,
            &Statement::Update {
                table: "users".into(),
                assignments: vec![("score".into(), Expr::literal(Value::Integer(3)))],
                where_clause: None,
            },
        )
        .unwrap_err();
    assert!(
        matches!(err, DbError::ConstraintDeadlockAborted(_)),
        "got {:?}",
        err
    );

    engine.execute(&s1, &Statement::Commit).unwrap();
    engine.close().unwrap();
}
