// Merge join.
//
// Requires both inputs sorted on the join keys. Linear merge; duplicate
// keys on the right are buffered as a group so the left side can replay
// them (back-tracking without re-reading the child). Inner and left kinds;
// null keys never match.

use crate::ast::Expr;
use crate::common::{Row, Value};
use crate::error::Result;
use crate::execution::expressions::{evaluate, truthy, Schema};
use crate::execution::{ExecContext, Operator};
use crate::optimizer::LogicalJoinKind;
use std::cmp::Ordering;
use std::collections::VecDeque;

pub struct MergeJoin {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    left_keys: Vec<Expr>,
    right_keys: Vec<Expr>,
    kind: LogicalJoinKind,
    residual: Option<Expr>,
    schema: Schema,
    combined: Schema,
    right_width: usize,

    left_buf: VecDeque<Row>,
    right_buf: VecDeque<Row>,
    left_done: bool,
    right_done: bool,
    /// current right-side group (rows sharing one key)
    group_key: Option<Vec<Value>>,
    group: Vec<Row>,
}

impl MergeJoin {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        kind: LogicalJoinKind,
        residual: Option<Expr>,
        schema: Schema,
    ) -> Self {
        let combined = left.schema().join(right.schema());
        let right_width = right.schema().columns.len();
        Self {
            left,
            right,
            left_keys,
            right_keys,
            kind,
            residual,
            schema,
            combined,
            right_width,
            left_buf: VecDeque::new(),
            right_buf: VecDeque::new(),
            left_done: false,
            right_done: false,
            group_key: None,
            group: Vec::new(),
        }
    }

    fn key_of(row: &Row, keys: &[Expr], schema: &Schema) -> Result<Option<Vec<Value>>> {
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            let v = evaluate(k, schema, row)?;
            if v.is_null() {
                return Ok(None);
            }
            out.push(v);
        }
        Ok(Some(out))
    }

    fn fill_left(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        while self.left_buf.is_empty() && !self.left_done {
            match self.left.next_batch(ctx)? {
                Some(batch) => self.left_buf.extend(batch),
                None => self.left_done = true,
            }
        }
        Ok(())
    }

    fn fill_right(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        while self.right_buf.is_empty() && !self.right_done {
            match self.right.next_batch(ctx)? {
                Some(batch) => self.right_buf.extend(batch),
                None => self.right_done = true,
            }
        }
        Ok(())
    }

    /// Load the next right group (all consecutive rows with one key).
    fn advance_group(&mut self, ctx: &ExecContext<'_>) -> Result<bool> {
        self.group.clear();
        self.group_key = None;
        loop {
            self.fill_right(ctx)?;
            let Some(front) = self.right_buf.front() else {
                return Ok(false);
            };
            let key = Self::key_of(front, &self.right_keys, self.right.schema())?;
            let Some(key) = key else {
                // null-keyed right rows never match anyone
                self.right_buf.pop_front();
                continue;
            };
            self.group_key = Some(key.clone());
            // absorb the whole run
            loop {
                self.fill_right(ctx)?;
                match self.right_buf.front() {
                    Some(row) => {
                        let k = Self::key_of(row, &self.right_keys, self.right.schema())?;
                        if k.as_ref() == Some(&key) {
                            self.group.push(self.right_buf.pop_front().unwrap());
                        } else {
                            break;
                        }
                    }
                    None => break,
                }
            }
            return Ok(true);
        }
    }

    fn cmp_keys(a: &[Value], b: &[Value]) -> Ordering {
        for (x, y) in a.iter().zip(b) {
            match x.total_cmp(y) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    fn emit_pair(&self, l: &Row, r: Option<&Row>, out: &mut Vec<Row>) -> Result<()> {
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
        Ok(())
    }
}

impl Operator for MergeJoin {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.left.open(ctx)?;
        self.right.open(ctx)?;
        self.left_buf.clear();
        self.right_buf.clear();
        self.left_done = false;
        self.right_done = false;
        self.group.clear();
        self.group_key = None;
        self.advance_group(ctx)?;
        Ok(())
    }

    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        ctx.check_deadline()?;
        let mut out = Vec::new();
        while out.len() < ctx.batch_size {
            self.fill_left(ctx)?;
            let Some(left_row) = self.left_buf.pop_front() else {
                break;
            };
            let left_key = Self::key_of(&left_row, &self.left_keys, self.left.schema())?;
            let Some(left_key) = left_key else {
                if matches!(self.kind, LogicalJoinKind::Left | LogicalJoinKind::Anti) {
                    self.emit_pair(&left_row, None, &mut out)?;
                }
                continue;
            };

            // advance right groups until group_key >= left_key
            loop {
                match &self.group_key {
                    Some(gk) if Self::cmp_keys(gk, &left_key) == Ordering::Less => {
                        if !self.advance_group(ctx)? {
                            break;
                        }
                    }
                    _ => break,
                }
            }

            let matches = self
                .group_key
                .as_ref()
                .map(|gk| Self::cmp_keys(gk, &left_key) == Ordering::Equal)
                .unwrap_or(false);

            if matches {
                let group = self.group.clone();
                let mut any = false;
                for r in &group {
                    let residual_ok = match &self.residual {
                        Some(res) => {
                            let mut combined = left_row.clone();
                            combined.extend(r.iter().cloned());
                            truthy(&evaluate(res, &self.combined, &combined)?)
                        }
                        None => true,
                    };
                    if residual_ok {
                        any = true;
                        match self.kind {
                            LogicalJoinKind::Semi => {
                                self.emit_pair(&left_row, Some(r), &mut out)?;
                                break;
                            }
                            LogicalJoinKind::Anti => break,
                            _ => self.emit_pair(&left_row, Some(r), &mut out)?,
                        }
                    }
                }
                if !any && matches!(self.kind, LogicalJoinKind::Left | LogicalJoinKind::Anti) {
                    self.emit_pair(&left_row, None, &mut out)?;
                }
            } else if matches!(self.kind, LogicalJoinKind::Left | LogicalJoinKind::Anti) {
                self.emit_pair(&left_row, None, &mut out)?;
            }
        }
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }

    fn close(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.left.close(ctx)?;
        self.right.close(ctx)?;
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}
