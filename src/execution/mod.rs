// Execution engine kernel.
//
// Pull-based operators with vectorized batches (default 1024 rows). The
// executor lowers a physical plan into an operator tree, wraps every node
// with a row counter so the adaptive layer can compare actual against
// estimated cardinalities, and checks the statement deadline between
// batches.

pub mod aggregate;
pub mod expressions;
pub mod hash_join;
pub mod merge_join;
pub mod nested_loop;
pub mod scan;
pub mod set_ops;
pub mod simple;
pub mod sort;

pub use expressions::{evaluate, Schema};

use crate::btree::BTree;
use crate::catalog::Catalog;
use crate::common::{Lsn, Row};
use crate::error::{DbError, Result};
use crate::optimizer::{PhysNode, PhysicalPlan};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Resolves table and index trees; implemented by the engine.
pub trait TreeProvider: Send + Sync {
    fn primary(&self, table: &str) -> Result<Arc<BTree>>;
    fn index(&self, table: &str, index: &str) -> Result<Arc<BTree>>;
}

/// Per-statement execution context.
pub struct ExecContext<'a> {
    pub catalog: &'a Catalog,
    pub trees: &'a dyn TreeProvider,
    pub batch_size: usize,
    pub deadline: Instant,
    /// repeatable read captures a snapshot LSN at statement start; pages
    /// stamped past it are filtered
    pub snapshot_lsn: Option<Lsn>,
    pub tmp_dir: PathBuf,
    pub sort_memory_bytes: usize,
    pub hash_memory_bytes: usize,
    pub spill_partitions: usize,
    pub cancelled: Option<&'a std::sync::atomic::AtomicBool>,
}

impl<'a> ExecContext<'a> {
    /// Cooperative cancellation point, hit between batches and on I/O
    /// completion paths.
    pub fn check_deadline(&self) -> Result<()> {
        if let Some(flag) = self.cancelled {
            if flag.load(std::sync::atomic::Ordering::Acquire) {
                return Err(DbError::Cancelled);
            }
        }
        if Instant::now() > self.deadline {
            return Err(DbError::Timeout);
        }
        Ok(())
    }
}

/// The physical operator capability set: open, next_batch, close.
pub trait Operator: Send {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()>;
    /// None means exhausted; an empty batch means "keep pulling".
    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>>;
    fn close(&mut self, ctx: &ExecContext<'_>) -> Result<()>;
    fn schema(&self) -> &Schema;
}

/// Wraps an operator and counts emitted rows for the feedback loop.
struct CountingOperator {
    inner: Box<dyn Operator>,
    slot: usize,
    counts: Arc<parking_lot::Mutex<Vec<u64>>>,
}

impl Operator for CountingOperator {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.inner.open(ctx)
    }

    fn next_batch(&mut self, ctx: &ExecContext<'_>) -> Result<Option<Vec<Row>>> {
        let batch = self.inner.next_batch(ctx)?;
        if let Some(batch) = &batch {
            self.counts.lock()[self.slot] += batch.len() as u64;
        }
        Ok(batch)
    }

    fn close(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.inner.close(ctx)
    }

    fn schema(&self) -> &Schema {
        self.inner.schema()
    }
}

/// Result of running one plan.
pub struct QueryOutput {
    pub schema: Schema,
    pub rows: Vec<Row>,
    /// (operator label, estimated rows, actual rows) in plan preorder
    pub operator_rows: Vec<(String, f64, u64)>,
}

pub struct Executor;

impl Executor {
    /// Lower the plan, pull it dry, and return rows plus per-operator
    /// actuals. Latches and temp files are released on every exit path.
    pub fn run(plan: &PhysicalPlan, ctx: &ExecContext<'_>) -> Result<QueryOutput> {
        let estimates = plan.operator_estimates();
        let counts = Arc::new(parking_lot::Mutex::new(vec![0u64; estimates.len()]));
        let mut slot = 0usize;
        let mut root = Self::build(plan, &counts, &mut slot)?;

        let schema = root.schema().clone();
        if let Err(e) = root.open(ctx) {
            let _ = root.close(ctx);
            return Err(e);
        }
        let mut rows = Vec::new();
        let result = loop {
            ctx.check_deadline()?;
            match root.next_batch(ctx) {
                Ok(Some(batch)) => rows.extend(batch),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        // close unconditionally so spills and pins unwind
        let close_result = root.close(ctx);
        result?;
        close_result?;

        let counts = counts.lock();
        let operator_rows = estimates
            .into_iter()
            .zip(counts.iter())
            .map(|((label, est), actual)| (label, est, *actual))
            .collect();
        Ok(QueryOutput {
            schema,
            rows,
            operator_rows,
        })
    }

    /// Recursive preorder build mirroring `operator_estimates`.
    fn build(
        plan: &PhysicalPlan,
        counts: &Arc<parking_lot::Mutex<Vec<u64>>>,
        slot: &mut usize,
    ) -> Result<Box<dyn Operator>> {
        let my_slot = *slot;
        *slot += 1;
        let inner: Box<dyn Operator> = match &plan.node {
            PhysNode::SeqScan {
                table,
                alias,
                filter,
            } => Box::new(scan::SeqScan::new(
                table.clone(),
                alias.clone(),
                filter.clone(),
                plan.schema.clone(),
            )),
            PhysNode::IndexScan {
                table,
                alias,
                index,
                bounds,
                filter,
            } => Box::new(scan::IndexScan::new(
                table.clone(),
                alias.clone(),
                index.clone(),
                bounds.clone(),
                filter.clone(),
                plan.schema.clone(),
                false,
            )),
            PhysNode::IndexOnlyScan {
                table,
                alias,
                index,
                bounds,
                filter,
            } => Box::new(scan::IndexScan::new(
                table.clone(),
                alias.clone(),
                index.clone(),
                bounds.clone(),
                filter.clone(),
                plan.schema.clone(),
                true,
            )),
            PhysNode::BitmapOrScan {
                table,
                alias,
                probes,
                filter,
            } => Box::new(scan::BitmapOrScan::new(
                table.clone(),
                alias.clone(),
                probes.clone(),
                filter.clone(),
                plan.schema.clone(),
            )),
            PhysNode::HashJoin {
                left,
                right,
                left_keys,
                right_keys,
                kind,
                residual,
            } => Box::new(hash_join::HashJoin::new(
                Self::build(left, counts, slot)?,
                Self::build(right, counts, slot)?,
                left_keys.clone(),
                right_keys.clone(),
                *kind,
                residual.clone(),
                plan.schema.clone(),
            )),
            PhysNode::MergeJoin {
                left,
                right,
                left_keys,
                right_keys,
                kind,
                residual,
            } => Box::new(merge_join::MergeJoin::new(
                Self::build(left, counts, slot)?,
                Self::build(right, counts, slot)?,
                left_keys.clone(),
                right_keys.clone(),
                *kind,
                residual.clone(),
                plan.schema.clone(),
            )),
            PhysNode::NestedLoopJoin {
                left,
                right,
                kind,
                condition,
            } => Box::new(nested_loop::NestedLoopJoin::new(
                Self::build(left, counts, slot)?,
                Self::build(right, counts, slot)?,
                *kind,
                condition.clone(),
                plan.schema.clone(),
            )),
            PhysNode::IndexNestedLoopJoin {
                left,
                table,
                alias,
                index,
                outer_key,
                kind,
                residual,
            } => Box::new(nested_loop::IndexNestedLoop::new(
                Self::build(left, counts, slot)?,
                table.clone(),
                alias.clone(),
                index.clone(),
                outer_key.clone(),
                *kind,
                residual.clone(),
                plan.schema.clone(),
            )),
            PhysNode::Filter { input, predicate } => Box::new(simple::FilterOp::new(
                Self::build(input, counts, slot)?,
                predicate.clone(),
            )),
            PhysNode::Project { input, exprs } => Box::new(simple::ProjectOp::new(
                Self::build(input, counts, slot)?,
                exprs.clone(),
                plan.schema.clone(),
            )),
            PhysNode::HashAggregate {
                input,
                group_by,
                aggregates,
                having,
            } => Box::new(aggregate::Aggregate::new(
                Self::build(input, counts, slot)?,
                group_by.clone(),
                aggregates.clone(),
                having.clone(),
                plan.schema.clone(),
                aggregate::AggregateMode::Hash,
            )),
            PhysNode::StreamAggregate {
                input,
                group_by,
                aggregates,
                having,
            } => Box::new(aggregate::Aggregate::new(
                Self::build(input, counts, slot)?,
                group_by.clone(),
                aggregates.clone(),
                having.clone(),
                plan.schema.clone(),
                aggregate::AggregateMode::Stream,
            )),
            PhysNode::Sort { input, keys } => Box::new(sort::SortOp::new(
                Self::build(input, counts, slot)?,
                keys.clone(),
            )),
            PhysNode::Distinct { input } => {
                Box::new(simple::DistinctOp::new(Self::build(input, counts, slot)?))
            }
            PhysNode::Limit {
                input,
                limit,
                offset,
            } => Box::new(simple::LimitOp::new(
                Self::build(input, counts, slot)?,
                *limit,
                *offset,
            )),
            PhysNode::SetOp {
                left,
                right,
                kind,
                strategy,
            } => Box::new(set_ops::SetOpExec::new(
                Self::build(left, counts, slot)?,
                Self::build(right, counts, slot)?,
                kind.clone(),
                *strategy,
            )),
        };
        Ok(Box::new(CountingOperator {
            inner,
            slot: my_slot,
            counts: Arc::clone(counts),
        }))
    }
}
