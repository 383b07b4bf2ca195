// Parser boundary.
//
// The engine consumes an already-validated AST; any front-end that emits
// these nodes works. Expressions are the four-node language the optimizer
// understands: column refs, literals, binary ops, and function calls.

use crate::catalog::Column;
use crate::common::Value;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Like,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    /// `table.column` or bare `column`
    Column {
        table: Option<String>,
        column: String,
    },
    Literal(Value),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        function: String,
        args: Vec<Expr>,
    },
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
    Not(Box<Expr>),
    /// scalar IN list over a single column
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    /// EXISTS / NOT EXISTS (SELECT ...)
    Exists {
        query: Box<Select>,
        negated: bool,
    },
    /// col IN (SELECT single-col ...) and the NOT IN form
    InSubquery {
        expr: Box<Expr>,
        query: Box<Select>,
        negated: bool,
    },
}

impl Expr {
    pub fn column(name: &str) -> Expr {
        Expr::Column {
            table: None,
            column: name.to_string(),
        }
    }

    pub fn qualified(table: &str, name: &str) -> Expr {
        Expr::Column {
            table: Some(table.to_string()),
            column: name.to_string(),
        }
    }

    pub fn literal(value: Value) -> Expr {
        Expr::Literal(value)
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::And, left, right)
    }

    pub fn eq(left: Expr, right: Expr) -> Expr {
        Expr::binary(BinaryOp::Eq, left, right)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderByItem {
    pub expr: Expr,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
    Cross,
}

/// One FROM entry; joins are expressed as a list folded left-to-right with
/// their ON conditions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FromItem {
    pub table: String,
    pub alias: Option<String>,
    pub join: Option<(JoinKind, Expr)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetOpKind {
    Union { all: bool },
    Intersect,
    Except,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Select {
    pub distinct: bool,
    /// empty means `*`
    pub projection: Vec<(Expr, Option<String>)>,
    pub from: Vec<FromItem>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderByItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// UNION / INTERSECT / EXCEPT chained onto this block
    pub set_op: Option<(SetOpKind, Box<Select>)>,
}

impl Select {
    pub fn from_table(table: &str) -> Select {
        Select {
            distinct: false,
            projection: Vec::new(),
            from: vec![FromItem {
                table: table.to_string(),
                alias: None,
                join: None,
            }],
            where_clause: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
            set_op: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(Select),
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Expr>>,
    },
    Update {
        table: String,
        assignments: Vec<(String, Expr)>,
        where_clause: Option<Expr>,
    },
    Delete {
        table: String,
        where_clause: Option<Expr>,
    },
    CreateDatabase { name: String },
    DropDatabase { name: String },
    CreateTable {
        name: String,
        columns: Vec<Column>,
    },
    DropTable { name: String },
    CreateIndex {
        name: String,
        table: String,
        columns: Vec<String>,
        unique: bool,
    },
    DropIndex { name: String, table: String },
    CreateView { name: String, query: Select },
    DropView { name: String },
    ShowTables,
    ShowIndexes { table: Option<String> },
    Use { database: String },
    Begin,
    Commit,
    Rollback,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expr_builders() {
        let e = Expr::and(
            Expr::eq(Expr::column("a"), Expr::literal(Value::Integer(1))),
            Expr::binary(
                BinaryOp::Lt,
                Expr::qualified("t", "b"),
                Expr::literal(Value::Integer(10)),
            ),
        );
        if let Expr::Binary { op, .. } = &e {
            assert_eq!(*op, BinaryOp::And);
        } else {
            panic!("expected binary");
        }
    }

    #[test]
    fn test_statement_serializes() {
        let stmt = Statement::Select(Select::from_table("users"));
        let json = serde_json::to_string(&stmt).unwrap();
        let back: Statement = serde_json::from_str(&json).unwrap();
        assert_eq!(stmt, back);
    }
}
