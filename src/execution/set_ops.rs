// Set operations: UNION [ALL], INTERSECT, EXCEPT.
//
// Hash strategy by default; when the optimizer sees both inputs already
// sorted the same way it picks the merge strategy, which walks the two
// sorted streams without building tables. UNION/INTERSECT/EXCEPT follow
// SQL set semantics (distinct output); UNION ALL keeps duplicates.

use crate::ast::SetOpKind;
use crate::common::Row;
use crate::error::Result;
use crate::execution::expressions::Schema;
use crate::execution::{ExecContext, Operator};
use crate::optimizer::physical::SetStrategy;
use std::collections::HashSet;

pub struct SetOpExec {
    left: Box<dyn Operator>,
    right: Box<dyn Operator>,
    kind: SetOpKind,
    strategy: SetStrategy,
    schema: Schema,
    output: std::vec::IntoIter<Row>,
}

impl SetOpExec {
    pub fn new(
        left: Box<dyn Operator>,
        right: Box<dyn Operator>,
        kind: SetOpKind,
        strategy: SetStrategy,
    ) -> Self {
        let schema = left.schema().clone();
        Self {
            left,
            right,
            kind,
            strategy,
            schema,
            output: Vec::new().into_iter(),
        }
    }

    fn drain(op: &mut Box<dyn Operator>, ctx: &ExecContext<'_>) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(batch) = op.next_batch(ctx)? {
            ctx.check_deadline()?;
            rows.extend(batch);
        }
        Ok(rows)
    }

    fn combine_hash(&self, left: Vec<Row>, right: Vec<Row>) -> Vec<Row> {
        match &self.kind {
            SetOpKind::Union { all: true } => {
                let mut out = left;
                out.extend(right);
                out
            }
            SetOpKind::Union { all: false } => {
                let mut seen: HashSet<Row> = HashSet::new();
                let mut out = Vec::new();
                for row in left.into_iter().chain(right) {
                    if seen.insert(row.clone()) {
                        out.push(row);
                    }
                }
                out
            }
            SetOpKind::Intersect => {
                let right_set: HashSet<Row> = right.into_iter().collect();
                let mut seen: HashSet<Row> = HashSet::new();
                left.into_iter()
                    .filter(|r| right_set.contains(r) && seen.insert(r.clone()))
                    .collect()
            }
            SetOpKind::Except => {
                let right_set: HashSet<Row> = right.into_iter().collect();
                let mut seen: HashSet<Row> = HashSet::new();
                left.into_iter()
                    .filter(|r| !right_set.contains(r) && seen.insert(r.clone()))
                    .collect()
            }
        }
    }

    /// Both inputs sorted identically: one linear pass, no hash tables.
    fn combine_merge(&self, left: Vec<Row>, right: Vec<Row>) -> Vec<Row> {
        use std::cmp::Ordering;
        let cmp = |a: &Row, b: &Row| -> Ordering {
            for (x, y) in a.iter().zip(b.iter()) {
                match x.total_cmp(y) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            a.len().cmp(&b.len())
        };
        let mut out = Vec::new();
        let (mut i, mut j) = (0usize, 0usize);
        let push_dedup = |out: &mut Vec<Row>, row: &Row| {
            if out.last().map(|l| cmp(l, row) != Ordering::Equal).unwrap_or(true) {
                out.push(row.clone());
            }
        };
        match &self.kind {
            SetOpKind::Union { all } => {
                while i < left.len() || j < right.len() {
                    let take_left = match (left.get(i), right.get(j)) {
                        (Some(l), Some(r)) => cmp(l, r) != Ordering::Greater,
                        (Some(_), None) => true,
                        _ => false,
                    };
                    let row = if take_left {
                        let r = &left[i];
                        i += 1;
                        r
                    } else {
                        let r = &right[j];
                        j += 1;
                        r
                    };
                    if *all {
                        out.push(row.clone());
                    } else {
                        push_dedup(&mut out, row);
                    }
                }
            }
            SetOpKind::Intersect => {
                while i < left.len() && j < right.len() {
                    match cmp(&left[i], &right[j]) {
                        Ordering::Less => i += 1,
                        Ordering::Greater => j += 1,
                        Ordering::Equal => {
                            push_dedup(&mut out, &left[i]);
                            i += 1;
                            j += 1;
                        }
                    }
                }
            }
            SetOpKind::Except => {
                while i < left.len() {
                    match right.get(j) {
                        None => {
                            push_dedup(&mut out, &left[i]);
                            i += 1;
                        }
                        Some(r) => match cmp(&left[i], r) {
                            Ordering::Less => {
                                push_dedup(&mut out, &left[i]);
                                i += 1;
                            }
                            Ordering::Equal => i += 1,
                            Ordering::Greater => j += 1,
                        },
                    }
                }
            }
        }
        out
    }
}

impl Operator for SetOpExec {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.left.open(ctx)?;
        self.right.open(ctx)?;
        let left = Self::drain(&mut self.left, ctx)?;
        let right = Self::drain(&mut self.right, ctx)?;
        let combined = match self.strategy {
            SetStrategy::Hash => self.combine_hash(left, right),
            SetStrategy::Merge => self.combine_merge(left, right),
        };
        self.output = combined.into_iter();
        Ok(())
    }

    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        ctx.check_deadline()?;
        let batch: Vec<Row> = self.output.by_ref().take(ctx.batch_size).collect();
        if batch.is_empty() {
            Ok(None)
        } else {
            Ok(Some(batch))
        }
    }

    fn close(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.left.close(ctx)?;
        self.right.close(ctx)?;
        self.output = Vec::new().into_iter();
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}
