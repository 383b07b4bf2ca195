// Filter, Project, Distinct, Limit/Offset.
//
// Limit short-circuits: once the quota is met it stops pulling from its
// child entirely, which unwinds upstream scans without draining them.

use crate::ast::Expr;
use crate::common::Row;
use crate::error::Result;
use crate::execution::expressions::{evaluate, truthy, Schema};
use crate::execution::{ExecContext, Operator};
use std::collections::HashSet;

pub struct FilterOp {
    input: Box<dyn Operator>,
    predicate: Expr,
    schema: Schema,
}

impl FilterOp {
    pub fn new(input: Box<dyn Operator>, predicate: Expr) -> Self {
        let schema = input.schema().clone();
        Self {
            input,
            predicate,
            schema,
        }
    }
}

impl Operator for FilterOp {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.input.open(ctx)
    }

    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        let Some(batch) = self.input.next_batch(ctx)? else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(batch.len());
        for row in batch {
            if truthy(&evaluate(&self.predicate, &self.schema, &row)?) {
                out.push(row);
            }
        }
        Ok(Some(out))
    }

    fn close(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.input.close(ctx)
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

pub struct ProjectOp {
    input: Box<dyn Operator>,
    exprs: Vec<(Expr, String)>,
    schema: Schema,
}

impl ProjectOp {
    pub fn new(input: Box<dyn Operator>, exprs: Vec<(Expr, String)>, schema: Schema) -> Self {
        Self {
            input,
            exprs,
            schema,
        }
    }
}

impl Operator for ProjectOp {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.input.open(ctx)
    }

    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        let Some(batch) = self.input.next_batch(ctx)? else {
            return Ok(None);
        };
        let input_schema = self.input.schema();
        let mut out = Vec::with_capacity(batch.len());
        for row in batch {
            let projected: Row = self
                .exprs
                .iter()
                .map(|(e, _)| evaluate(e, input_schema, &row))
                .collect::<Result<_>>()?;
            out.push(projected);
        }
        Ok(Some(out))
    }

    fn close(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.input.close(ctx)
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

pub struct DistinctOp {
    input: Box<dyn Operator>,
    schema: Schema,
    seen: HashSet<Row>,
}

impl DistinctOp {
    pub fn new(input: Box<dyn Operator>) -> Self {
        let schema = input.schema().clone();
        Self {
            input,
            schema,
            seen: HashSet::new(),
        }
    }
}

impl Operator for DistinctOp {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.seen.clear();
        self.input.open(ctx)
    }

    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        let Some(batch) = self.input.next_batch(ctx)? else {
            return Ok(None);
        };
        let mut out = Vec::with_capacity(batch.len());
        for row in batch {
            if self.seen.insert(row.clone()) {
                out.push(row);
            }
        }
        Ok(Some(out))
    }

    fn close(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.seen.clear();
        self.input.close(ctx)
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

pub struct LimitOp {
    input: Box<dyn Operator>,
    limit: Option<u64>,
    offset: u64,
    skipped: u64,
    emitted: u64,
    schema: Schema,
    done: bool,
}

impl LimitOp {
    pub fn new(input: Box<dyn Operator>, limit: Option<u64>, offset: u64) -> Self {
        let schema = input.schema().clone();
        Self {
            input,
            limit,
            offset,
            skipped: 0,
            emitted: 0,
            schema,
            done: false,
        }
    }
}

impl Operator for LimitOp {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.skipped = 0;
        self.emitted = 0;
        self.done = false;
        self.input.open(ctx)
    }

    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        if self.done {
            return Ok(None);
        }
        if let Some(limit) = self.limit {
            if self.emitted >= limit {
                self.done = true;
                return Ok(None);
            }
        }
        let Some(batch) = self.input.next_batch(ctx)? else {
            self.done = true;
            return Ok(None);
        };
        let mut out = Vec::with_capacity(batch.len());
        for row in batch {
            if self.skipped < self.offset {
                self.skipped += 1;
                continue;
            }
            if let Some(limit) = self.limit {
                if self.emitted >= limit {
                    self.done = true;
                    break;
                }
            }
            out.push(row);
            self.emitted += 1;
        }
        Ok(Some(out))
    }

    fn close(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.input.close(ctx)
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}
