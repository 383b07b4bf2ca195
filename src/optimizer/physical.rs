// Physical plan.
//
// Same shape as the logical tree with operator implementations and access
// paths chosen. Every node carries its estimated cost, output cardinality,
// and output ordering (used for interesting-order pruning in the join
// enumerator and to pick stream aggregates / merge joins).

use crate::ast::{Expr, SortDirection};
use crate::common::Value;
use crate::execution::expressions::Schema;
use crate::optimizer::logical::{AggExpr, LogicalJoinKind};

/// Abstract cost units, calibrated once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Cost {
    pub cpu: f64,
    pub io: f64,
    pub mem: f64,
    pub net: f64,
}

impl Cost {
    pub fn new(cpu: f64, io: f64, mem: f64, net: f64) -> Cost {
        Cost { cpu, io, mem, net }
    }

    #[inline]
    pub fn total(&self) -> f64 {
        self.cpu + self.io + self.mem + self.net
    }

    pub fn plus(&self, other: &Cost) -> Cost {
        Cost {
            cpu: self.cpu + other.cpu,
            io: self.io + other.io,
            mem: self.mem + other.mem,
            net: self.net + other.net,
        }
    }
}

/// Sargable bounds on an index's leading columns: an equality prefix plus
/// an optional range on the next column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexBounds {
    pub eq_prefix: Vec<Value>,
    pub lo: Option<(Value, bool)>,
    pub hi: Option<(Value, bool)>,
}

impl IndexBounds {
    pub fn is_point(&self) -> bool {
        self.lo.is_none() && self.hi.is_none() && !self.eq_prefix.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetStrategy {
    Hash,
    Merge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhysNode {
    SeqScan {
        table: String,
        alias: String,
        filter: Option<Expr>,
    },
    IndexScan {
        table: String,
        alias: String,
        index: String,
        bounds: IndexBounds,
        filter: Option<Expr>,
    },
    /// covered query: the index alone answers it, no heap access
    IndexOnlyScan {
        table: String,
        alias: String,
        index: String,
        bounds: IndexBounds,
        filter: Option<Expr>,
    },
    /// bitmap OR over several index probes, then one pass over the heap
    BitmapOrScan {
        table: String,
        alias: String,
        probes: Vec<(String, IndexBounds)>,
        filter: Option<Expr>,
    },
    HashJoin {
        left: Box<PhysicalPlan>,
        right: Box<PhysicalPlan>,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        kind: LogicalJoinKind,
        residual: Option<Expr>,
    },
    MergeJoin {
        left: Box<PhysicalPlan>,
        right: Box<PhysicalPlan>,
        left_keys: Vec<Expr>,
        right_keys: Vec<Expr>,
        kind: LogicalJoinKind,
        residual: Option<Expr>,
    },
    NestedLoopJoin {
        left: Box<PhysicalPlan>,
        right: Box<PhysicalPlan>,
        kind: LogicalJoinKind,
        condition: Option<Expr>,
    },
    /// nested loop whose inner side is an index probe re-bound per outer row
    IndexNestedLoopJoin {
        left: Box<PhysicalPlan>,
        table: String,
        alias: String,
        index: String,
        outer_key: Expr,
        kind: LogicalJoinKind,
        residual: Option<Expr>,
    },
    Filter {
        input: Box<PhysicalPlan>,
        predicate: Expr,
    },
    Project {
        input: Box<PhysicalPlan>,
        exprs: Vec<(Expr, String)>,
    },
    HashAggregate {
        input: Box<PhysicalPlan>,
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
        having: Option<Expr>,
    },
    /// input already sorted by the group keys
    StreamAggregate {
        input: Box<PhysicalPlan>,
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
        having: Option<Expr>,
    },
    Sort {
        input: Box<PhysicalPlan>,
        keys: Vec<(Expr, SortDirection)>,
    },
    Distinct {
        input: Box<PhysicalPlan>,
    },
    Limit {
        input: Box<PhysicalPlan>,
        limit: Option<u64>,
        offset: u64,
    },
    SetOp {
        left: Box<PhysicalPlan>,
        right: Box<PhysicalPlan>,
        kind: crate::ast::SetOpKind,
        strategy: SetStrategy,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalPlan {
    pub node: PhysNode,
    pub rows: f64,
    pub cost: Cost,
    /// qualified column names the output is ordered by (ascending)
    pub ordering: Vec<String>,
    pub schema: Schema,
}

impl PhysicalPlan {
    pub fn total_cost(&self) -> f64 {
        self.cost.total()
    }

    /// Per-operator (estimated rows, operator label) pairs, preorder; the
    /// adaptive layer matches these against actuals.
    pub fn operator_estimates(&self) -> Vec<(String, f64)> {
        let mut out = Vec::new();
        self.collect_estimates(&mut out);
        out
    }

    fn collect_estimates(&self, out: &mut Vec<(String, f64)>) {
        out.push((self.label(), self.rows));
        for child in self.children() {
            child.collect_estimates(out);
        }
    }

    pub fn label(&self) -> String {
        match &self.node {
            PhysNode::SeqScan { alias, .. } => format!("SeqScan({})", alias),
            PhysNode::IndexScan { alias, index, .. } => {
                format!("IndexScan({}.{})", alias, index)
            }
            PhysNode::IndexOnlyScan { alias, index, .. } => {
                format!("IndexOnlyScan({}.{})", alias, index)
            }
            PhysNode::BitmapOrScan { alias, .. } => format!("BitmapOrScan({})", alias),
            PhysNode::HashJoin { .. } => "HashJoin".to_string(),
            PhysNode::MergeJoin { .. } => "MergeJoin".to_string(),
            PhysNode::NestedLoopJoin { .. } => "NestedLoopJoin".to_string(),
            PhysNode::IndexNestedLoopJoin { alias, index, .. } => {
                format!("IndexNestedLoop({}.{})", alias, index)
            }
            PhysNode::Filter { .. } => "Filter".to_string(),
            PhysNode::Project { .. } => "Project".to_string(),
            PhysNode::HashAggregate { .. } => "HashAggregate".to_string(),
            PhysNode::StreamAggregate { .. } => "StreamAggregate".to_string(),
            PhysNode::Sort { .. } => "Sort".to_string(),
            PhysNode::Distinct { .. } => "Distinct".to_string(),
            PhysNode::Limit { .. } => "Limit".to_string(),
            PhysNode::SetOp { .. } => "SetOp".to_string(),
        }
    }

    pub fn children(&self) -> Vec<&PhysicalPlan> {
        match &self.node {
            PhysNode::SeqScan { .. }
            | PhysNode::IndexScan { .. }
            | PhysNode::IndexOnlyScan { .. }
            | PhysNode::BitmapOrScan { .. } => vec![],
            PhysNode::HashJoin { left, right, .. }
            | PhysNode::MergeJoin { left, right, .. }
            | PhysNode::NestedLoopJoin { left, right, .. }
            | PhysNode::SetOp { left, right, .. } => vec![left, right],
            PhysNode::IndexNestedLoopJoin { left, .. } => vec![left],
            PhysNode::Filter { input, .. }
            | PhysNode::Project { input, .. }
            | PhysNode::HashAggregate { input, .. }
            | PhysNode::StreamAggregate { input, .. }
            | PhysNode::Sort { input, .. }
            | PhysNode::Distinct { input }
            | PhysNode::Limit { input, .. } => vec![input],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_totals() {
        let c = Cost::new(1.0, 2.0, 3.0, 0.0);
        assert_eq!(c.total(), 6.0);
        let d = c.plus(&Cost::new(1.0, 1.0, 0.0, 0.0));
        assert_eq!(d.total(), 8.0);
    }

    #[test]
    fn test_operator_estimates_preorder() {
        let scan = PhysicalPlan {
            node: PhysNode::SeqScan {
                table: "t".into(),
                alias: "t".into(),
                filter: None,
            },
            rows: 100.0,
            cost: Cost::default(),
            ordering: vec![],
            schema: Schema::default(),
        };
        let limit = PhysicalPlan {
            node: PhysNode::Limit {
                input: Box::new(scan),
                limit: Some(10),
                offset: 0,
            },
            rows: 10.0,
            cost: Cost::default(),
            ordering: vec![],
            schema: Schema::default(),
        };
        let est = limit.operator_estimates();
        assert_eq!(est[0].0, "Limit");
        assert_eq!(est[1].0, "SeqScan(t)");
    }
}
