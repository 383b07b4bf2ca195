// Logical plan.
//
// The binder lowers an AST Select into this tree: scans at the leaves,
// relational operators above. Column references stay name-based; operators
// resolve them against their input schema at execution time.

use crate::ast::{Expr, JoinKind, Select, SetOpKind, SortDirection, Statement};
use crate::catalog::Catalog;
use crate::error::{DbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn parse(name: &str) -> Option<AggFunc> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggFunc::Count),
            "SUM" => Some(AggFunc::Sum),
            "AVG" => Some(AggFunc::Avg),
            "MIN" => Some(AggFunc::Min),
            "MAX" => Some(AggFunc::Max),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggExpr {
    pub func: AggFunc,
    /// None is COUNT(*)
    pub arg: Option<Expr>,
    pub alias: String,
}

/// Join kinds the planner distinguishes (semi/anti come from subquery
/// unnesting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalJoinKind {
    Inner,
    Left,
    Semi,
    Anti,
    Cross,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogicalPlan {
    Scan {
        table: String,
        alias: String,
        /// pushed-down predicate over this relation only
        filter: Option<Expr>,
    },
    Filter {
        input: Box<LogicalPlan>,
        predicate: Expr,
    },
    Project {
        input: Box<LogicalPlan>,
        exprs: Vec<(Expr, String)>,
    },
    Join {
        left: Box<LogicalPlan>,
        right: Box<LogicalPlan>,
        kind: LogicalJoinKind,
        condition: Option<Expr>,
    },
    Aggregate {
        input: Box<LogicalPlan>,
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
        having: Option<Expr>,
    },
    Sort {
        input: Box<LogicalPlan>,
        keys: Vec<(Expr, SortDirection)>,
    },
    Distinct {
        input: Box<LogicalPlan>,
    },
    Limit {
        input: Box<LogicalPlan>,
        limit: Option<u64>,
        offset: u64,
    },
    SetOp {
        left: Box<LogicalPlan>,
        right: Box<LogicalPlan>,
        kind: SetOpKind,
    },
}

impl LogicalPlan {
    /// Base relations (alias names) under this plan.
    pub fn relations(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.walk(&mut |p| {
            if let LogicalPlan::Scan { alias, .. } = p {
                out.push(alias.clone());
            }
        });
        out
    }

    pub fn walk<F: FnMut(&LogicalPlan)>(&self, f: &mut F) {
        f(self);
        match self {
            LogicalPlan::Scan { .. } => {}
            LogicalPlan::Filter { input, .. }
            | LogicalPlan::Project { input, .. }
            | LogicalPlan::Aggregate { input, .. }
            | LogicalPlan::Sort { input, .. }
            | LogicalPlan::Distinct { input }
            | LogicalPlan::Limit { input, .. } => input.walk(f),
            LogicalPlan::Join { left, right, .. } | LogicalPlan::SetOp { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
        }
    }
}

/// Lower a Select into a logical plan, expanding views and recognizing
/// aggregate projections. Subquery unnesting happens later, in the
/// transformation pass.
pub fn bind_select(select: &Select, catalog: &Catalog, view_depth: usize) -> Result<LogicalPlan> {
    if view_depth > 16 {
        return Err(DbError::InvalidArgument("view expansion too deep".into()));
    }
    if select.from.is_empty() {
        return Err(DbError::InvalidArgument(
            "SELECT without FROM is not supported by the engine core".into(),
        ));
    }

    // FROM list folds left-to-right
    let mut plan: Option<LogicalPlan> = None;
    for item in &select.from {
        let alias = item.alias.clone().unwrap_or_else(|| item.table.clone());
        let rel = if let Some(view) = catalog.view(&item.table) {
            let Statement::Select(view_select) = &view.query else {
                return Err(DbError::InvalidArgument(
                    "view query must be a SELECT statement".into(),
                ));
            };
            bind_select(view_select, catalog, view_depth + 1)?
        } else {
            catalog.table(&item.table)?; // existence check
            LogicalPlan::Scan {
                table: item.table.clone(),
                alias: alias.clone(),
                filter: None,
            }
        };
        plan = Some(match plan {
            None => rel,
            Some(left) => {
                let (kind, condition) = match &item.join {
                    Some((JoinKind::Inner, on)) => (LogicalJoinKind::Inner, Some(on.clone())),
                    Some((JoinKind::Left, on)) => (LogicalJoinKind::Left, Some(on.clone())),
                    Some((JoinKind::Cross, _)) | None => (LogicalJoinKind::Cross, None),
                };
                LogicalPlan::Join {
                    left: Box::new(left),
                    right: Box::new(rel),
                    kind,
                    condition,
                }
            }
        });
    }
    let mut plan = plan.expect("from list non-empty");

    if let Some(pred) = &select.where_clause {
        plan = LogicalPlan::Filter {
            input: Box::new(plan),
            predicate: pred.clone(),
        };
    }

    // split the projection: aggregate calls feed the Aggregate node, the
    // outer Project re-emits everything in the requested order (aggregates
    // by their assigned alias)
    let mut aggregates = Vec::new();
    let mut outer: Vec<(Expr, String)> = Vec::new();
    for (i, (expr, alias)) in select.projection.iter().enumerate() {
        match as_aggregate(expr) {
            Some((func, arg)) => {
                let name = alias.clone().unwrap_or_else(|| format!("agg_{}", i));
                aggregates.push(AggExpr {
                    func,
                    arg,
                    alias: name.clone(),
                });
                outer.push((Expr::column(&name), name));
            }
            None => outer.push((
                expr.clone(),
                alias.clone().unwrap_or_else(|| display_name(expr, i)),
            )),
        }
    }

    if !aggregates.is_empty() || !select.group_by.is_empty() {
        plan = LogicalPlan::Aggregate {
            input: Box::new(plan),
            group_by: select.group_by.clone(),
            aggregates,
            having: select.having.clone(),
        };
        if !outer.is_empty() {
            plan = LogicalPlan::Project {
                input: Box::new(plan),
                exprs: outer,
            };
        }
    } else if !outer.is_empty() {
        plan = LogicalPlan::Project {
            input: Box::new(plan),
            exprs: outer,
        };
    }

    if select.distinct {
        plan = LogicalPlan::Distinct {
            input: Box::new(plan),
        };
    }

    if let Some((kind, rhs)) = &select.set_op {
        let right = bind_select(rhs, catalog, view_depth)?;
        plan = LogicalPlan::SetOp {
            left: Box::new(plan),
            right: Box::new(right),
            kind: kind.clone(),
        };
    }

    if !select.order_by.is_empty() {
        plan = LogicalPlan::Sort {
            input: Box::new(plan),
            keys: select
                .order_by
                .iter()
                .map(|o| (o.expr.clone(), o.direction))
                .collect(),
        };
    }

    if select.limit.is_some() || select.offset.is_some() {
        plan = LogicalPlan::Limit {
            input: Box::new(plan),
            limit: select.limit,
            offset: select.offset.unwrap_or(0),
        };
    }

    Ok(plan)
}

fn as_aggregate(expr: &Expr) -> Option<(AggFunc, Option<Expr>)> {
    if let Expr::Call { function, args } = expr {
        if let Some(func) = AggFunc::parse(function) {
            return Some((func, args.first().cloned()));
        }
    }
    None
}

fn display_name(expr: &Expr, i: usize) -> String {
    match expr {
        Expr::Column { table, column } => match table {
            Some(t) => format!("{}.{}", t, column),
            None => column.clone(),
        },
        _ => format!("col_{}", i),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Column, DataType, TableDescriptor};

    fn catalog() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog
            .create_table(TableDescriptor {
                id: 0,
                name: "t".into(),
                columns: vec![
                    Column::new("id", DataType::Integer).primary_key(),
                    Column::new("x", DataType::Integer),
                ],
                file_id: 0,
                indexes: vec![],
                stats_snapshot: None,
            })
            .unwrap();
        (dir, catalog)
    }

    #[test]
    fn test_bind_simple_scan() {
        let (_d, catalog) = catalog();
        let plan = bind_select(&Select::from_table("t"), &catalog, 0).unwrap();
        assert!(matches!(plan, LogicalPlan::Scan { .. }));
        assert_eq!(plan.relations(), vec!["t".to_string()]);
    }

    #[test]
    fn test_bind_unknown_table() {
        let (_d, catalog) = catalog();
        assert!(bind_select(&Select::from_table("ghost"), &catalog, 0).is_err());
    }

    #[test]
    fn test_bind_aggregate_shape() {
        let (_d, catalog) = catalog();
        let mut select = Select::from_table("t");
        select.projection = vec![(
            Expr::Call {
                function: "COUNT".into(),
                args: vec![],
            },
            None,
        )];
        select.group_by = vec![Expr::column("x")];
        let plan = bind_select(&select, &catalog, 0).unwrap();
        assert!(matches!(plan, LogicalPlan::Aggregate { .. }));
    }
}
