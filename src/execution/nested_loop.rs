// Nested-loop joins.
//
// The plain variant materializes the inner (right) side once and replays
// it per outer row; it is the only method usable for arbitrary non-equi
// conditions. The index variant re-binds an index point probe per outer
// row instead.

use crate::ast::Expr;
use crate::btree::BTree;
use crate::common::{Row, Value};
use crate::error::Result;
use crate::execution::expressions::{evaluate, truthy, Schema};
use crate::execution::scan::index_point_lookup;
use crate::execution::{ExecContext, Operator};
use crate::optimizer::LogicalJoinKind;
use std::sync::Arc;

pub struct NestedLoopJoin {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    kind: LogicalJoinKind,
    condition: Option<Expr>,
    schema: Schema,
    combined: Schema,
    right_width: usize,
    inner: Vec<Row>,
}

impl NestedLoopJoin {
    pub fn new(
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
        kind: LogicalJoinKind,
        condition: Option<Expr>,
        schema: Schema,
    ) -> Self {
        let combined = left.schema().join(right.schema());
        let right_width = right.schema().columns.len();
        Self {
            left,
            right,
            kind,
            condition,
            schema,
            combined,
            right_width,
            inner: Vec::new(),
        }
    }

    fn matches(&self, left_row: &Row, right_row: &Row) -> Result<bool> {
        match &self.condition {
            None => Ok(true),
            Some(cond) => {
                let mut combined = left_row.clone();
                combined.extend(right_row.iter().cloned());
                Ok(truthy(&evaluate(cond, &self.combined, &combined)?))
            }
        }
    }

    fn emit(&self, l: &Row, r: Option<&Row>, out: &mut Vec<Row>) {
        match self.kind {
            LogicalJoinKind::Semi | LogicalJoinKind::Anti => out.push(l.clone()),
            _ => {
                let mut row = l.clone();
                match r {
                    Some(r) => row.extend(r.iter().cloned()),
                    None => row.extend(std::iter::repeat(Value::Null).take(self.right_width)),
                }
                out.push(row);
            }
        }
    }
}

impl Operator for NestedLoopJoin {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.left.open(ctx)?;
        self.right.open(ctx)?;
        self.inner.clear();
        while let Some(batch) = self.right.next_batch(ctx)? {
            ctx.check_deadline()?;
            self.inner.extend(batch);
        }
        Ok(())
    }

    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        ctx.check_deadline()?;
        let Some(batch) = self.left.next_batch(ctx)? else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(batch.len());
        for left_row in &batch {
            let mut any = false;
            for right_row in &self.inner {
                if self.matches(left_row, right_row)? {
                    any = true;
                    match self.kind {
                        LogicalJoinKind::Semi => {
                            self.emit(left_row, Some(right_row), &mut out);
                            break;
                        }
                        LogicalJoinKind::Anti => break,
                        _ => self.emit(left_row, Some(right_row), &mut out),
                    }
                }
            }
            if !any && matches!(self.kind, LogicalJoinKind::Left | LogicalJoinKind::Anti) {
                self.emit(left_row, None, &mut out);
            }
        }
        Ok(Some(out))
    }

    fn close(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.left.close(ctx)?;
        self.right.close(ctx)?;
        self.inner.clear();
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

/// Nested loop whose inner side is an index point probe per outer row.
pub struct IndexNestedLoop {
    left: Box<dyn Operator>,
    table: String,
    #[allow(dead_code)]
    alias: String,
    index: String,
    outer_key: Expr,
    kind: LogicalJoinKind,
    residual: Option<Expr>,
    schema: Schema,
    combined: Schema,
    inner_width: usize,
    index_tree: Option<Arc<BTree>>,
    primary: Option<Arc<BTree>>,
}

impl IndexNestedLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        left: Box<dyn Operator>,
        table: String,
        alias: String,
        index: String,
        outer_key: Expr,
        kind: LogicalJoinKind,
        residual: Option<Expr>,
        schema: Schema,
    ) -> Self {
        let inner_width = schema
            .columns
            .len()
            .saturating_sub(left.schema().columns.len());
        let combined = schema.clone();
        Self {
            left,
            table,
            alias,
            index,
            outer_key,
            kind,
            residual,
            schema,
            combined,
            inner_width,
            index_tree: None,
            primary: None,
        }
    }
}

impl Operator for IndexNestedLoop {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.left.open(ctx)?;
        self.index_tree = Some(ctx.trees.index(&self.table, &self.index)?);
        self.primary = Some(ctx.trees.primary(&self.table)?);
        Ok(())
    }

    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        ctx.check_deadline()?;
        let Some(batch) = self.left.next_batch(ctx)? else {
            return Ok(None);
        };
        let index_tree = self.index_tree.as_ref().expect("open not called");
        let primary = self.primary.as_ref().expect("open not called");
        let left_schema = self.left.schema();

        let mut out = Vec::with_capacity(batch.len());
        for left_row in &batch {
            let key = evaluate(&self.outer_key, left_schema, left_row)?;
            let matches = if key.is_null() {
                Vec::new()
            } else {
                index_point_lookup(index_tree, primary, &key)?
            };
            let mut any = false;
            for inner_row in &matches {
                let residual_ok = match &self.residual {
                    Some(res) => {
                        let mut combined = left_row.clone();
                        combined.extend(inner_row.iter().cloned());
                        truthy(&evaluate(res, &self.combined, &combined)?)
                    }
                    None => true,
                };
                if residual_ok {
                    any = true;
                    match self.kind {
                        LogicalJoinKind::Semi => {
                            out.push(left_row.clone());
                            break;
                        }
                        LogicalJoinKind::Anti => break,
                        _ => {
                            let mut row = left_row.clone();
                            row.extend(inner_row.iter().cloned());
                            out.push(row);
                        }
                    }
                }
            }
            if !any {
                match self.kind {
                    LogicalJoinKind::Left => {
                        let mut row = left_row.clone();
                        row.extend(std::iter::repeat(Value::Null).take(self.inner_width));
                        out.push(row);
                    }
                    LogicalJoinKind::Anti => out.push(left_row.clone()),
                    _ => {}
                }
            }
        }
        Ok(Some(out))
    }

    fn close(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.left.close(ctx)?;
        self.index_tree = None;
        self.primary = None;
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}
