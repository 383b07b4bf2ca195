// Selinger-style join enumeration.
//
// Dynamic programming over relation subsets, keyed by (subset, ordering):
// the table keeps the best plan per interesting ordering plus the cheapest
// overall, with dominated entries discarded. Left-deep shapes always;
// bushy shapes join two composite subsets once the subset size reaches
// four (aggressive levels). A time budget degrades enumeration to greedy
// pairing and surfaces a warning rather than an error.

use crate::ast::Expr;
use crate::error::{DbError, Result};
use crate::execution::expressions::referenced_columns;
use crate::optimizer::cost::{CostModel, PlannerContext};
use crate::optimizer::logical::LogicalJoinKind;
use crate::optimizer::physical::{Cost, PhysNode, PhysicalPlan};
use crate::optimizer::transform::join_conjuncts;
use std::collections::HashMap;
use std::time::Instant;
use tracing::warn;

/// One equi-join edge between two relations.
#[derive(Debug, Clone)]
pub struct JoinPredicate {
    pub left_alias: String,
    pub right_alias: String,
    pub left_expr: Expr,
    pub right_expr: Expr,
    /// (table, column) pairs for NDV lookups
    pub left_col: (String, String),
    pub right_col: (String, String),
}

/// Non-equi predicates that involve more than one relation; applied at the
/// join that first covers their relations (forces nested loops there).
#[derive(Debug, Clone)]
pub struct ComplexPredicate {
    pub relations: Vec<String>,
    pub expr: Expr,
}

pub struct JoinGraph {
    /// access-path candidates per relation, densely indexed
    pub relations: Vec<(String, Vec<PhysicalPlan>)>,
    pub equi_preds: Vec<JoinPredicate>,
    pub complex_preds: Vec<ComplexPredicate>,
}

pub struct JoinEnumerator<'a> {
    pub model: &'a CostModel,
    pub ctx: &'a PlannerContext,
    pub bushy: bool,
    pub budget_ms: u64,
    /// subsets whose estimated rows exceed this skip bushy shapes
    pub bushy_row_ceiling: f64,
    pub interesting_orders: Vec<Vec<String>>,
}

#[derive(Default, Clone)]
struct DpCell {
    /// best plan per ordering signature; empty signature = cheapest overall
    plans: HashMap<Vec<String>, PhysicalPlan>,
}

impl DpCell {
    /// Dominance: keep a plan if it is the cheapest for its ordering, and
    /// drop orderings whose plan costs more than the unordered best while
    /// providing no ordering a later stage wants.
    fn offer(&mut self, plan: PhysicalPlan, interesting: &[Vec<String>]) {
        let signature = ordering_signature(&plan.ordering, interesting);
        match self.plans.get(&signature) {
            Some(existing) if existing.total_cost() <= plan.total_cost() => {}
            _ => {
                self.plans.insert(signature, plan);
            }
        }
    }

    fn best(&self) -> Option<&PhysicalPlan> {
        self.plans
            .values()
            .min_by(|a, b| a.total_cost().partial_cmp(&b.total_cost()).unwrap())
    }
}

/// The signature under which a plan competes: the longest interesting
/// ordering it satisfies as a prefix (or the empty signature).
fn ordering_signature(ordering: &[String], interesting: &[Vec<String>]) -> Vec<String> {
    let mut best: Vec<String> = Vec::new();
    for want in interesting {
        if !want.is_empty()
            && want.len() <= ordering.len()
            && ordering[..want.len()] == want[..]
            && want.len() > best.len()
        {
            best = want.clone();
        }
    }
    best
}

impl<'a> JoinEnumerator<'a> {
    /// Returns the chosen plan and whether the time budget expired.
    pub fn enumerate(&self, graph: &JoinGraph) -> Result<(PhysicalPlan, bool)> {
        let n = graph.relations.len();
        if n == 0 {
            return Err(DbError::Internal("join graph with no relations".into()));
        }
        if n == 1 {
            let best = self.best_single(&graph.relations[0].1)?;
            return Ok((best, false));
        }
        if n > 14 {
            // bitmap DP explodes past this point; go straight to greedy
            return Ok((self.greedy(graph)?, true));
        }

        let deadline = Instant::now() + std::time::Duration::from_millis(self.budget_ms);
        let mut table: Vec<HashMap<u64, DpCell>> = vec![HashMap::new(); n + 1];

        // level 1: every access path of every relation
        for (i, (_, candidates)) in graph.relations.iter().enumerate() {
            let mut cell = DpCell::default();
            for plan in candidates {
                cell.offer(plan.clone(), &self.interesting_orders);
            }
            table[1].insert(1u64 << i, cell);
        }

        for size in 2..=n {
            if Instant::now() > deadline {
                warn!(size, "join enumeration budget exhausted; falling back to greedy");
                return Ok((self.greedy(graph)?, true));
            }
            let masks: Vec<u64> = subsets_of_size(n, size);
            for mask in masks {
                let mut cell = DpCell::default();

                // left-deep: composite of size-1 plus one base relation
                for i in 0..n {
                    let bit = 1u64 << i;
                    if mask & bit == 0 {
                        continue;
                    }
                    let rest = mask & !bit;
                    if let Some(rest_cell) = table[size - 1].get(&rest) {
                        let rel_cell = &table[1][&bit];
                        self.combine(graph, rest_cell, rel_cell, rest, bit, &mut cell)?;
                    }
                }

                // bushy: both sides composite
                if self.bushy && size >= 4 {
                    let row_ok = |cell: &DpCell| {
                        cell.best()
                            .map(|p| p.rows <= self.bushy_row_ceiling)
                            .unwrap_or(false)
                    };
                    let mut sub = (mask.wrapping_sub(1)) & mask;
                    while sub != 0 {
                        let other = mask & !sub;
                        let sub_size = sub.count_ones() as usize;
                        if sub_size >= 2 && (size - sub_size) >= 2 && sub < other {
                            if let (Some(a), Some(b)) =
                                (table[sub_size].get(&sub), table[size - sub_size].get(&other))
                            {
                                if row_ok(a) && row_ok(b) {
                                    self.combine(graph, a, b, sub, other, &mut cell)?;
                                }
                            }
                        }
                        sub = (sub.wrapping_sub(1)) & mask;
                    }
                }

                if !cell.plans.is_empty() {
                    table[size].insert(mask, cell);
                }
            }
        }

        let full = (1u64 << n) - 1;
        let best = table[n]
            .get(&full)
            .and_then(|c| c.best())
            .cloned()
            .ok_or_else(|| DbError::Internal("join DP produced no full plan".into()))?;
        Ok((self.attach_complex(graph, best, full)?, false))
    }

    fn best_single(&self, candidates: &[PhysicalPlan]) -> Result<PhysicalPlan> {
        candidates
            .iter()
            .min_by(|a, b| a.total_cost().partial_cmp(&b.total_cost()).unwrap())
            .cloned()
            .ok_or_else(|| DbError::Internal("relation with no access path".into()))
    }

    /// Join every plan pair from two DP cells with every applicable method.
    fn combine(
        &self,
        graph: &JoinGraph,
        left_cell: &DpCell,
        right_cell: &DpCell,
        left_mask: u64,
        right_mask: u64,
        out: &mut DpCell,
    ) -> Result<()> {
        let preds = self.edge_predicates(graph, left_mask, right_mask);
        for left in left_cell.plans.values() {
            for right in right_cell.plans.values() {
                for plan in self.join_methods(graph, left, right, &preds)? {
                    out.offer(plan, &self.interesting_orders);
                }
            }
        }
        Ok(())
    }

    fn edge_predicates(
        &self,
        graph: &JoinGraph,
        left_mask: u64,
        right_mask: u64,
    ) -> Vec<JoinPredicate> {
        let in_mask = |alias: &str, mask: u64| {
            graph
                .relations
                .iter()
                .position(|(a, _)| a == alias)
                .map(|i| mask & (1u64 << i) != 0)
                .unwrap_or(false)
        };
        graph
            .equi_preds
            .iter()
            .filter(|p| {
                (in_mask(&p.left_alias, left_mask) && in_mask(&p.right_alias, right_mask))
                    || (in_mask(&p.left_alias, right_mask) && in_mask(&p.right_alias, left_mask))
            })
            .cloned()
            .collect()
    }

    /// Physical join alternatives for one (left, right) pair.
    fn join_methods(
        &self,
        _graph: &JoinGraph,
        left: &PhysicalPlan,
        right: &PhysicalPlan,
        preds: &[JoinPredicate],
    ) -> Result<Vec<PhysicalPlan>> {
        let mut out = Vec::new();
        let schema = left.schema.join(&right.schema);

        // orient each predicate to (left expr, right expr)
        let oriented: Vec<(Expr, Expr, (String, String), (String, String))> = preds
            .iter()
            .map(|p| {
                let left_has = left
                    .schema
                    .columns
                    .iter()
                    .any(|c| c.starts_with(&format!("{}.", p.left_alias)));
                if left_has {
                    (
                        p.left_expr.clone(),
                        p.right_expr.clone(),
                        p.left_col.clone(),
                        p.right_col.clone(),
                    )
                } else {
                    (
                        p.right_expr.clone(),
                        p.left_expr.clone(),
                        p.right_col.clone(),
                        p.left_col.clone(),
                    )
                }
            })
            .collect();

        let ndv_keys: Vec<(String, String, String, String)> = oriented
            .iter()
            .map(|(_, _, l, r)| (l.0.clone(), l.1.clone(), r.0.clone(), r.1.clone()))
            .collect();
        let out_rows = self
            .model
            .join_cardinality(left.rows, right.rows, &ndv_keys, self.ctx);
        let base_cost = left.cost.plus(&right.cost);

        if !oriented.is_empty() {
            // hash join builds on its right child at execution; emit both
            // orientations so the smaller side can be the build side
            let left_exprs: Vec<Expr> = oriented.iter().map(|(l, _, _, _)| l.clone()).collect();
            let right_exprs: Vec<Expr> = oriented.iter().map(|(_, r, _, _)| r.clone()).collect();
            for (outer, inner, probe_keys, build_keys) in [
                (left, right, &left_exprs, &right_exprs),
                (right, left, &right_exprs, &left_exprs),
            ] {
                let hash_cost =
                    base_cost.plus(&self.model.hash_join(inner.rows, outer.rows, out_rows));
                out.push(PhysicalPlan {
                    node: PhysNode::HashJoin {
                        left: Box::new(outer.clone()),
                        right: Box::new(inner.clone()),
                        left_keys: probe_keys.clone(),
                        right_keys: build_keys.clone(),
                        kind: LogicalJoinKind::Inner,
                        residual: None,
                    },
                    rows: out_rows,
                    cost: hash_cost,
                    ordering: Vec::new(),
                    schema: outer.schema.join(&inner.schema),
                });
            }

            // merge join: requires both inputs sorted on the keys; add
            // explicit sorts when they are not
            let left_keys: Vec<String> = oriented
                .iter()
                .filter_map(|(l, _, _, _)| qualified_name(l))
                .collect();
            let right_keys: Vec<String> = oriented
                .iter()
                .filter_map(|(_, r, _, _)| qualified_name(r))
                .collect();
            if left_keys.len() == oriented.len() && right_keys.len() == oriented.len() {
                let left_sorted = starts_with(&left.ordering, &left_keys);
                let right_sorted = starts_with(&right.ordering, &right_keys);
                let mut cost = base_cost.plus(&self.model.merge_join(
                    left.rows,
                    right.rows,
                    out_rows,
                ));
                if !left_sorted {
                    cost = cost.plus(&self.model.sort(left.rows, self.ctx.sort_memory_bytes));
                }
                if !right_sorted {
                    cost = cost.plus(&self.model.sort(right.rows, self.ctx.sort_memory_bytes));
                }
                let (ml, mr) = (
                    maybe_sorted(left.clone(), &left_keys, left_sorted),
                    maybe_sorted(right.clone(), &right_keys, right_sorted),
                );
                out.push(PhysicalPlan {
                    node: PhysNode::MergeJoin {
                        left: Box::new(ml),
                        right: Box::new(mr),
                        left_keys: oriented.iter().map(|(l, _, _, _)| l.clone()).collect(),
                        right_keys: oriented.iter().map(|(_, r, _, _)| r.clone()).collect(),
                        kind: LogicalJoinKind::Inner,
                        residual: None,
                    },
                    rows: out_rows,
                    cost,
                    // merge preserves the common key order
                    ordering: left_keys.clone(),
                    schema: schema.clone(),
                });
            }
        }

        // index nested loop: the inner side collapses to a point probe per
        // outer row when a single equi key lands on an index prefix
        if oriented.len() == 1 {
            if let PhysNode::SeqScan {
                table,
                alias,
                filter,
            } = &right.node
            {
                if let Some(desc) = self.ctx.tables.get(table) {
                    let (outer_key, inner_key, _, inner_col) = &oriented[0];
                    let inner_matches = matches!(inner_key, Expr::Column { .. });
                    if inner_matches {
                        for index in &desc.indexes {
                            if index.columns.first() == Some(&inner_col.1) {
                                let snapshot = self.ctx.snapshot(table);
                                let height = snapshot
                                    .and_then(|s| s.indexes.get(&index.name))
                                    .map(|i| i.height.max(1) as f64)
                                    .unwrap_or(2.0);
                                let cost = base_cost.plus(
                                    &self.model.index_nested_loop(left.rows, height),
                                );
                                out.push(PhysicalPlan {
                                    node: PhysNode::IndexNestedLoopJoin {
                                        left: Box::new(left.clone()),
                                        table: table.clone(),
                                        alias: alias.clone(),
                                        index: index.name.clone(),
                                        outer_key: outer_key.clone(),
                                        kind: LogicalJoinKind::Inner,
                                        residual: filter.clone(),
                                    },
                                    rows: out_rows,
                                    cost,
                                    ordering: left.ordering.clone(),
                                    schema: left.schema.join(&right.schema),
                                });
                                break;
                            }
                        }
                    }
                }
            }
        }

        // nested loop is always available and required without equi keys
        let condition = join_conjuncts(
            oriented
                .iter()
                .map(|(l, r, _, _)| Expr::eq(l.clone(), r.clone()))
                .collect(),
        );
        let nl_cost = base_cost.plus(&self.model.nested_loop_join(
            left.rows,
            right.rows,
            right.cost.total() / right.rows.max(1.0),
        ));
        out.push(PhysicalPlan {
            node: PhysNode::NestedLoopJoin {
                left: Box::new(left.clone()),
                right: Box::new(right.clone()),
                kind: LogicalJoinKind::Inner,
                condition,
            },
            rows: out_rows,
            cost: nl_cost,
            ordering: left.ordering.clone(),
            schema,
        });

        Ok(out)
    }

    /// Greedy fallback: start from the cheapest relation, repeatedly join
    /// the relation that yields the smallest intermediate result.
    fn greedy(&self, graph: &JoinGraph) -> Result<PhysicalPlan> {
        let n = graph.relations.len();
        let mut remaining: Vec<usize> = (0..n).collect();
        let mut bests: Vec<PhysicalPlan> = graph
            .relations
            .iter()
            .map(|(_, c)| self.best_single(c))
            .collect::<Result<_>>()?;

        // seed with the smallest relation
        let seed = remaining
            .iter()
            .copied()
            .min_by(|a, b| bests[*a].rows.partial_cmp(&bests[*b].rows).unwrap())
            .unwrap();
        remaining.retain(|&i| i != seed);
        let mut current = bests.remove(seed);
        // re-index bests after removal
        let mut idx_map: Vec<usize> = (0..n).filter(|&i| i != seed).collect();
        let mut current_mask = 1u64 << seed;

        while !remaining.is_empty() {
            let mut best_choice: Option<(usize, PhysicalPlan)> = None;
            for (pos, &rel) in remaining.iter().enumerate() {
                let bpos = idx_map.iter().position(|&i| i == rel).unwrap();
                let preds = self.edge_predicates(graph, current_mask, 1u64 << rel);
                for candidate in
                    self.join_methods(graph, &current, &bests[bpos], &preds)?
                {
                    let better = best_choice
                        .as_ref()
                        .map(|(_, b)| candidate.total_cost() < b.total_cost())
                        .unwrap_or(true);
                    if better {
                        best_choice = Some((pos, candidate));
                    }
                }
            }
            let (pos, plan) = best_choice
                .ok_or_else(|| DbError::Internal("greedy join found no candidate".into()))?;
            let rel = remaining.remove(pos);
            let bpos = idx_map.iter().position(|&i| i == rel).unwrap();
            bests.remove(bpos);
            idx_map.retain(|&i| i != rel);
            current_mask |= 1u64 << rel;
            current = plan;
        }
        self.attach_complex(graph, current, current_mask)
    }

    /// Apply multi-relation non-equi predicates as a filter above the final
    /// join tree.
    fn attach_complex(
        &self,
        graph: &JoinGraph,
        plan: PhysicalPlan,
        _mask: u64,
    ) -> Result<PhysicalPlan> {
        let exprs: Vec<Expr> = graph
            .complex_preds
            .iter()
            .map(|p| p.expr.clone())
            .collect();
        let Some(predicate) = join_conjuncts(exprs) else {
            return Ok(plan);
        };
        let rows = (plan.rows * 0.33).max(1.0);
        let cost = plan
            .cost
            .plus(&Cost::new(plan.rows * self.model.params.cpu_operator_cost, 0.0, 0.0, 0.0));
        let ordering = plan.ordering.clone();
        let schema = plan.schema.clone();
        Ok(PhysicalPlan {
            node: PhysNode::Filter {
                input: Box::new(plan),
                predicate,
            },
            rows,
            cost,
            ordering,
            schema,
        })
    }
}

fn qualified_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Column {
            table: Some(t),
            column,
        } => Some(format!("{}.{}", t, column)),
        _ => None,
    }
}

fn starts_with(ordering: &[String], keys: &[String]) -> bool {
    keys.len() <= ordering.len() && ordering[..keys.len()] == keys[..]
}

fn maybe_sorted(plan: PhysicalPlan, keys: &[String], already: bool) -> PhysicalPlan {
    if already {
        return plan;
    }
    let sort_keys: Vec<(Expr, crate::ast::SortDirection)> = keys
        .iter()
        .map(|k| {
            let (t, c) = k.split_once('.').unwrap_or(("", k.as_str()));
            (
                if t.is_empty() {
                    Expr::column(c)
                } else {
                    Expr::qualified(t, c)
                },
                crate::ast::SortDirection::Asc,
            )
        })
        .collect();
    let rows = plan.rows;
    let cost = plan.cost;
    let schema = plan.schema.clone();
    PhysicalPlan {
        node: PhysNode::Sort {
            input: Box::new(plan),
            keys: sort_keys,
        },
        rows,
        cost,
        ordering: keys.to_vec(),
        schema,
    }
}

/// All bitmasks over n bits with exactly `size` bits set.
fn subsets_of_size(n: usize, size: usize) -> Vec<u64> {
    let mut out = Vec::new();
    let full = 1u64 << n;
    for mask in 1..full {
        if mask.count_ones() as usize == size {
            out.push(mask);
        }
    }
    out
}

/// Extract the join graph inputs from expressions: equi edges between two
/// distinct relations, everything else complex.
pub fn classify_join_predicates(
    conjuncts: Vec<Expr>,
    alias_to_table: &HashMap<String, String>,
) -> (Vec<JoinPredicate>, Vec<ComplexPredicate>) {
    let mut equi = Vec::new();
    let mut complex = Vec::new();
    for c in conjuncts {
        if let Expr::Binary {
            op: crate::ast::BinaryOp::Eq,
            left,
            right,
        } = &c
        {
            if let (
                Expr::Column {
                    table: Some(lt),
                    column: lc,
                },
                Expr::Column {
                    table: Some(rt),
                    column: rc,
                },
            ) = (&**left, &**right)
            {
                if lt != rt {
                    equi.push(JoinPredicate {
                        left_alias: lt.clone(),
                        right_alias: rt.clone(),
                        left_expr: (**left).clone(),
                        right_expr: (**right).clone(),
                        left_col: (
                            alias_to_table.get(lt).cloned().unwrap_or_else(|| lt.clone()),
                            lc.clone(),
                        ),
                        right_col: (
                            alias_to_table.get(rt).cloned().unwrap_or_else(|| rt.clone()),
                            rc.clone(),
                        ),
                    });
                    continue;
                }
            }
        }
        let mut cols = Vec::new();
        referenced_columns(&c, &mut cols);
        let rels: Vec<String> = cols.into_iter().filter_map(|(t, _)| t).collect();
        complex.push(ComplexPredicate {
            relations: rels,
            expr: c,
        });
    }
    (equi, complex)
}
