// Cost-based query optimizer.
//
// Pipeline: bind -> transformation fixed point -> access-path selection ->
// Selinger join enumeration -> physical assembly, fronted by the bounded
// plan cache and closed by the adaptive feedback loop. Optimizer failures
// never corrupt state: budget exhaustion returns the best plan found with
// a warning, and a faulted rule is skipped by the transformer's guard.

pub mod access_path;
pub mod adaptive;
pub mod cost;
pub mod join_enum;
pub mod logical;
pub mod physical;
pub mod plan_cache;
pub mod transform;

pub use access_path::AccessPathSelector;
pub use adaptive::{AdaptiveFeedback, ExecutionMetrics};
pub use cost::{CostModel, CostParams, PlannerContext};
pub use join_enum::{JoinEnumerator, JoinGraph};
pub use logical::{bind_select, AggExpr, AggFunc, LogicalJoinKind, LogicalPlan};
pub use physical::{Cost, IndexBounds, PhysNode, PhysicalPlan};
pub use plan_cache::{CachedPlan, PlanCache, PlanCacheKey, ResultCache};
pub use transform::Transformer;

use crate::ast::{BinaryOp, Expr, Select, SetOpKind, SortDirection};
use crate::catalog::Catalog;
use crate::error::{DbError, Result};
use crate::execution::expressions::{referenced_columns, Schema};
use crate::OptimizerLevel;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Optimizer {
    pub model: CostModel,
    pub level: OptimizerLevel,
    /// accepted cost-increase fraction for transformations
    pub slack: f64,
    pub budget_ms: u64,
    pub plan_cache: PlanCache,
    pub adaptive: AdaptiveFeedback,
}

pub struct Optimized {
    pub plan: Arc<PhysicalPlan>,
    pub cache_key: PlanCacheKey,
    pub cache_hit: bool,
    pub budget_exhausted: bool,
}

impl Optimizer {
    pub fn new(level: OptimizerLevel, budget_ms: u64, plan_cache_entries: usize) -> Self {
        Self {
            model: CostModel::new(CostParams::default()),
            level,
            slack: 0.0,
            budget_ms,
            plan_cache: PlanCache::new(plan_cache_entries),
            adaptive: AdaptiveFeedback::new(
                adaptive::DEFAULT_DEVIATION_FACTOR,
                adaptive::DEFAULT_CONSECUTIVE_RUNS,
            ),
        }
    }

    pub fn optimize(
        &self,
        select: &Select,
        catalog: &Catalog,
        mut ctx: PlannerContext,
    ) -> Result<Optimized> {
        let logical = bind_select(select, catalog, 0)?;
        let key = self.cache_key(&logical, catalog, &ctx);

        if let Some(cached) = self.plan_cache.get(&key) {
            return Ok(Optimized {
                plan: Arc::clone(&cached.plan),
                cache_key: key,
                cache_hit: true,
                budget_exhausted: false,
            });
        }

        // a poisoned plan left observed-row hints behind
        let hints = self.adaptive.take_hints(key.identity());
        ctx.row_hints.extend(hints);

        let (transformed, rules) = {
            let rows = |t: &str| ctx.table_rows(t);
            let transformer = Transformer::new(catalog, Box::new(rows), self.slack);
            let enable = self.level >= OptimizerLevel::Standard;
            if enable {
                transformer.transform(logical)?
            } else {
                (logical, Vec::new())
            }
        };
        debug!(rules = rules.len(), "transformation pass done");

        let (plan, budget_exhausted) = self.lower(&transformed, &ctx)?;
        if budget_exhausted {
            warn!("optimizer budget exhausted; best-effort plan in use");
        }
        let plan = Arc::new(plan);
        self.plan_cache
            .insert(key.clone(), Arc::clone(&plan), plan.total_cost());
        Ok(Optimized {
            plan,
            cache_key: key,
            cache_hit: false,
            budget_exhausted,
        })
    }

    fn cache_key(
        &self,
        logical: &LogicalPlan,
        catalog: &Catalog,
        ctx: &PlannerContext,
    ) -> PlanCacheKey {
        let mut hasher = DefaultHasher::new();
        logical.hash(&mut hasher);
        let plan_hash = hasher.finish();

        let mut tables: Vec<String> = Vec::new();
        logical.walk(&mut |p| {
            if let LogicalPlan::Scan { table, .. } = p {
                if !tables.contains(table) {
                    tables.push(table.clone());
                }
            }
        });
        tables.sort();
        let snapshots = tables
            .into_iter()
            .map(|t| {
                let id = ctx.snapshot(&t).map(|s| s.id).unwrap_or(0);
                (t, id)
            })
            .collect();
        PlanCacheKey {
            plan_hash,
            param_signature: 0,
            schema_version: catalog.schema_version(),
            snapshots,
        }
    }

    // ------------------------------------------------------------------
    // physical lowering
    // ------------------------------------------------------------------

    fn lower(&self, plan: &LogicalPlan, ctx: &PlannerContext) -> Result<(PhysicalPlan, bool)> {
        let interesting = collect_interesting_orders(plan);
        let required = collect_required_columns(plan);
        let mut exhausted = false;
        let lowered = self.lower_node(plan, ctx, &interesting, &required, &mut exhausted)?;
        Ok((lowered, exhausted))
    }

    fn lower_node(
        &self,
        plan: &LogicalPlan,
        ctx: &PlannerContext,
        interesting: &[Vec<String>],
        required: &HashMap<String, HashSet<String>>,
        exhausted: &mut bool,
    ) -> Result<PhysicalPlan> {
        // an inner-join cluster over base tables goes through the DP
        if let Some((leaves, conditions)) = flatten_inner_joins(plan) {
            if leaves.len() > 1 {
                return self.lower_join_cluster(&leaves, conditions, ctx, interesting, required, exhausted);
            }
        }

        match plan {
            LogicalPlan::Scan {
                table,
                alias,
                filter,
            } => {
                let selector = AccessPathSelector {
                    model: &self.model,
                    ctx,
                    level: self.level,
                };
                let candidates =
                    selector.candidates(table, alias, filter.as_ref(), required.get(alias))?;
                candidates
                    .into_iter()
                    .min_by(|a, b| a.total_cost().partial_cmp(&b.total_cost()).unwrap())
                    .ok_or_else(|| DbError::Internal("no access path".into()))
            }
            LogicalPlan::Join {
                left,
                right,
                kind,
                condition,
            } => {
                let l = self.lower_node(left, ctx, interesting, required, exhausted)?;
                let r = self.lower_node(right, ctx, interesting, required, exhausted)?;
                self.lower_structural_join(l, r, *kind, condition.clone())
            }
            LogicalPlan::Filter { input, predicate } => {
                let child = self.lower_node(input, ctx, interesting, required, exhausted)?;
                let sel = single_relation_of(predicate)
                    .map(|t| self.model.selectivity(predicate, &t, ctx))
                    .unwrap_or(0.33);
                let rows = (child.rows * sel).max(1.0);
                let cost = child.cost.plus(&Cost::new(
                    child.rows * self.model.params.cpu_operator_cost,
                    0.0,
                    0.0,
                    0.0,
                ));
                let ordering = child.ordering.clone();
                let schema = child.schema.clone();
                Ok(PhysicalPlan {
                    node: PhysNode::Filter {
                        input: Box::new(child),
                        predicate: predicate.clone(),
                    },
                    rows,
                    cost,
                    ordering,
                    schema,
                })
            }
            LogicalPlan::Project { input, exprs } => {
                let child = self.lower_node(input, ctx, interesting, required, exhausted)?;
                let schema = Schema::new(exprs.iter().map(|(_, a)| a.clone()).collect());
                // ordering survives when the leading order columns are
                // forwarded unchanged
                let forwarded: HashSet<String> = exprs
                    .iter()
                    .filter_map(|(e, _)| qualified_of(e))
                    .collect();
                let mut ordering = Vec::new();
                for col in &child.ordering {
                    if forwarded.contains(col) {
                        ordering.push(col.clone());
                    } else {
                        break;
                    }
                }
                let rows = child.rows;
                let cost = child.cost.plus(&Cost::new(
                    rows * self.model.params.cpu_operator_cost,
                    0.0,
                    0.0,
                    0.0,
                ));
                Ok(PhysicalPlan {
                    node: PhysNode::Project {
                        input: Box::new(child),
                        exprs: exprs.clone(),
                    },
                    rows,
                    cost,
                    ordering,
                    schema,
                })
            }
            LogicalPlan::Aggregate {
                input,
                group_by,
                aggregates,
                having,
            } => {
                let child = self.lower_node(input, ctx, interesting, required, exhausted)?;
                let group_cols: Vec<String> =
                    group_by.iter().filter_map(qualified_of).collect();
                let streamable = !group_by.is_empty()
                    && group_cols.len() == group_by.len()
                    && starts_with(&child.ordering, &group_cols);
                let groups = if group_by.is_empty() {
                    1.0
                } else {
                    (child.rows * 0.1).max(1.0)
                };
                let cost = child
                    .cost
                    .plus(&self.model.aggregate(child.rows, groups, !streamable));
                let mut columns: Vec<String> = group_by
                    .iter()
                    .enumerate()
                    .map(|(i, e)| qualified_of(e).unwrap_or_else(|| format!("group_{}", i)))
                    .collect();
                columns.extend(aggregates.iter().map(|a| a.alias.clone()));
                let schema = Schema::new(columns);
                let node = if streamable {
                    PhysNode::StreamAggregate {
                        input: Box::new(child.clone()),
                        group_by: group_by.clone(),
                        aggregates: aggregates.clone(),
                        having: having.clone(),
                    }
                } else {
                    PhysNode::HashAggregate {
                        input: Box::new(child.clone()),
                        group_by: group_by.clone(),
                        aggregates: aggregates.clone(),
                        having: having.clone(),
                    }
                };
                Ok(PhysicalPlan {
                    node,
                    rows: groups,
                    cost,
                    ordering: if streamable { group_cols } else { Vec::new() },
                    schema,
                })
            }
            LogicalPlan::Sort { input, keys } => {
                let child = self.lower_node(input, ctx, interesting, required, exhausted)?;
                let asc_cols: Vec<String> = keys
                    .iter()
                    .filter(|(_, d)| *d == SortDirection::Asc)
                    .filter_map(|(e, _)| qualified_of(e))
                    .collect();
                if asc_cols.len() == keys.len() && starts_with(&child.ordering, &asc_cols) {
                    // interesting ordering already satisfied upstream
                    return Ok(child);
                }
                let cost = child
                    .cost
                    .plus(&self.model.sort(child.rows, ctx.sort_memory_bytes));
                let rows = child.rows;
                let schema = child.schema.clone();
                Ok(PhysicalPlan {
                    node: PhysNode::Sort {
                        input: Box::new(child),
                        keys: keys.clone(),
                    },
                    rows,
                    cost,
                    ordering: asc_cols,
                    schema,
                })
            }
            LogicalPlan::Distinct { input } => {
                let child = self.lower_node(input, ctx, interesting, required, exhausted)?;
                let rows = (child.rows * 0.5).max(1.0);
                let cost = child
                    .cost
                    .plus(&self.model.aggregate(child.rows, rows, true));
                let schema = child.schema.clone();
                Ok(PhysicalPlan {
                    node: PhysNode::Distinct {
                        input: Box::new(child),
                    },
                    rows,
                    cost,
                    ordering: Vec::new(),
                    schema,
                })
            }
            LogicalPlan::Limit {
                input,
                limit,
                offset,
            } => {
                let child = self.lower_node(input, ctx, interesting, required, exhausted)?;
                let rows = limit
                    .map(|l| (l as f64).min(child.rows))
                    .unwrap_or(child.rows);
                let cost = child.cost;
                let ordering = child.ordering.clone();
                let schema = child.schema.clone();
                Ok(PhysicalPlan {
                    node: PhysNode::Limit {
                        input: Box::new(child),
                        limit: *limit,
                        offset: *offset,
                    },
                    rows,
                    cost,
                    ordering,
                    schema,
                })
            }
            LogicalPlan::SetOp { left, right, kind } => {
                let l = self.lower_node(left, ctx, interesting, required, exhausted)?;
                let r = self.lower_node(right, ctx, interesting, required, exhausted)?;
                let strategy = if !l.ordering.is_empty() && l.ordering == r.ordering {
                    physical::SetStrategy::Merge
                } else {
                    physical::SetStrategy::Hash
                };
                let rows = match kind {
                    SetOpKind::Union { all: true } => l.rows + r.rows,
                    SetOpKind::Union { all: false } => (l.rows + r.rows) * 0.7,
                    SetOpKind::Intersect => l.rows.min(r.rows) * 0.5,
                    SetOpKind::Except => l.rows,
                };
                let cost = l
                    .cost
                    .plus(&r.cost)
                    .plus(&self.model.aggregate(l.rows + r.rows, rows, true));
                let schema = l.schema.clone();
                Ok(PhysicalPlan {
                    node: PhysNode::SetOp {
                        left: Box::new(l),
                        right: Box::new(r),
                        kind: kind.clone(),
                        strategy,
                    },
                    rows: rows.max(1.0),
                    cost,
                    ordering: Vec::new(),
                    schema,
                })
            }
        }
    }

    fn lower_join_cluster(
        &self,
        leaves: &[(String, String, Option<Expr>)],
        conditions: Vec<Expr>,
        ctx: &PlannerContext,
        interesting: &[Vec<String>],
        required: &HashMap<String, HashSet<String>>,
        exhausted: &mut bool,
    ) -> Result<PhysicalPlan> {
        let selector = AccessPathSelector {
            model: &self.model,
            ctx,
            level: self.level,
        };
        let mut relations = Vec::new();
        let mut alias_to_table = HashMap::new();
        for (table, alias, filter) in leaves {
            let candidates =
                selector.candidates(table, alias, filter.as_ref(), required.get(alias))?;
            alias_to_table.insert(alias.clone(), table.clone());
            relations.push((alias.clone(), candidates));
        }
        let conjuncts: Vec<Expr> = conditions
            .iter()
            .flat_map(|c| transform::split_conjuncts(c))
            .collect();
        let (equi, complex) = join_enum::classify_join_predicates(conjuncts, &alias_to_table);
        let graph = JoinGraph {
            relations,
            equi_preds: equi,
            complex_preds: complex,
        };
        let enumerator = JoinEnumerator {
            model: &self.model,
            ctx,
            bushy: self.level >= OptimizerLevel::Aggressive,
            budget_ms: self.budget_ms,
            bushy_row_ceiling: 10_000_000.0,
            interesting_orders: interesting.to_vec(),
        };
        let (plan, budget_hit) = enumerator.enumerate(&graph)?;
        if budget_hit {
            *exhausted = true;
        }
        Ok(plan)
    }

    fn lower_structural_join(
        &self,
        left: PhysicalPlan,
        right: PhysicalPlan,
        kind: LogicalJoinKind,
        condition: Option<Expr>,
    ) -> Result<PhysicalPlan> {
        let schema = match kind {
            // semi and anti joins emit only the left side
            LogicalJoinKind::Semi | LogicalJoinKind::Anti => left.schema.clone(),
            _ => left.schema.join(&right.schema),
        };
        let (equi, residual) = split_equi_condition(condition.as_ref(), &left, &right);
        let rows = match kind {
            LogicalJoinKind::Semi => (left.rows * 0.5).max(1.0),
            LogicalJoinKind::Anti => (left.rows * 0.5).max(1.0),
            LogicalJoinKind::Cross => left.rows * right.rows,
            _ => (left.rows * right.rows * 0.01).max(left.rows.min(right.rows)),
        };
        if !equi.is_empty() {
            let cost = left.cost.plus(&right.cost).plus(&self.model.hash_join(
                right.rows,
                left.rows,
                rows,
            ));
            Ok(PhysicalPlan {
                node: PhysNode::HashJoin {
                    left: Box::new(left),
                    right: Box::new(right),
                    left_keys: equi.iter().map(|(l, _)| l.clone()).collect(),
                    right_keys: equi.iter().map(|(_, r)| r.clone()).collect(),
                    kind,
                    residual,
                },
                rows,
                cost,
                ordering: Vec::new(),
                schema,
            })
        } else {
            let cost = left.cost.plus(&right.cost).plus(&self.model.nested_loop_join(
                left.rows,
                right.rows,
                right.cost.total() / right.rows.max(1.0),
            ));
            let ordering = left.ordering.clone();
            Ok(PhysicalPlan {
                node: PhysNode::NestedLoopJoin {
                    left: Box::new(left),
                    right: Box::new(right),
                    kind,
                    condition,
                },
                rows,
                cost,
                ordering,
                schema,
            })
        }
    }
}

// ----------------------------------------------------------------------
// lowering helpers
// ----------------------------------------------------------------------

/// Flatten a pure inner/cross-join tree over base scans. Returns the scan
/// leaves (table, alias, filter) and the join conditions.
#[allow(clippy::type_complexity)]
fn flatten_inner_joins(
    plan: &LogicalPlan,
) -> Option<(Vec<(String, String, Option<Expr>)>, Vec<Expr>)> {
    fn walk(
        plan: &LogicalPlan,
        leaves: &mut Vec<(String, String, Option<Expr>)>,
        conditions: &mut Vec<Expr>,
    ) -> bool {
        match plan {
            LogicalPlan::Scan {
                table,
                alias,
                filter,
            } => {
                leaves.push((table.clone(), alias.clone(), filter.clone()));
                true
            }
            LogicalPlan::Join {
                left,
                right,
                kind: LogicalJoinKind::Inner | LogicalJoinKind::Cross,
                condition,
            } => {
                if let Some(c) = condition {
                    conditions.push(c.clone());
                }
                walk(left, leaves, conditions) && walk(right, leaves, conditions)
            }
            // a residual WHERE above the join block joins the condition set
            LogicalPlan::Filter { input, predicate } => {
                if matches!(**input, LogicalPlan::Join { .. }) && walk(input, leaves, conditions)
                {
                    conditions.push(predicate.clone());
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
    let mut leaves = Vec::new();
    let mut conditions = Vec::new();
    if walk(plan, &mut leaves, &mut conditions) {
        Some((leaves, conditions))
    } else {
        None
    }
}

fn qualified_of(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Column {
            table: Some(t),
            column,
        } => Some(format!("{}.{}", t, column)),
        Expr::Column {
            table: None,
            column,
        } => Some(column.clone()),
        _ => None,
    }
}

fn starts_with(ordering: &[String], keys: &[String]) -> bool {
    !keys.is_empty() && keys.len() <= ordering.len() && ordering[..keys.len()] == keys[..]
}

fn single_relation_of(expr: &Expr) -> Option<String> {
    let mut cols = Vec::new();
    referenced_columns(expr, &mut cols);
    let rels: HashSet<String> = cols.into_iter().filter_map(|(t, _)| t).collect();
    if rels.len() == 1 {
        rels.into_iter().next()
    } else {
        None
    }
}

/// Split a join condition into equi pairs (left expr from the left schema)
/// and a residual.
fn split_equi_condition(
    condition: Option<&Expr>,
    left: &PhysicalPlan,
    right: &PhysicalPlan,
) -> (Vec<(Expr, Expr)>, Option<Expr>) {
    let Some(condition) = condition else {
        return (Vec::new(), None);
    };
    let belongs = |e: &Expr, schema: &Schema| {
        let mut cols = Vec::new();
        referenced_columns(e, &mut cols);
        !cols.is_empty()
            && cols.iter().all(|(t, c)| {
                let name = match t {
                    Some(t) => format!("{}.{}", t, c),
                    None => c.clone(),
                };
                schema.columns.iter().any(|sc| {
                    sc == &name || sc.rsplit_once('.').map(|(_, b)| b == c).unwrap_or(false) && t.is_none()
                })
            })
    };
    let mut equi = Vec::new();
    let mut residual = Vec::new();
    for conjunct in transform::split_conjuncts(condition) {
        if let Expr::Binary {
            op: BinaryOp::Eq,
            left: l,
            right: r,
        } = &conjunct
        {
            if belongs(l, &left.schema) && belongs(r, &right.schema) {
                equi.push(((**l).clone(), (**r).clone()));
                continue;
            }
            if belongs(r, &left.schema) && belongs(l, &right.schema) {
                equi.push(((**r).clone(), (**l).clone()));
                continue;
            }
        }
        residual.push(conjunct);
    }
    (equi, transform::join_conjuncts(residual))
}

/// Orders that can save work later: join keys, GROUP BY keys, ORDER BY
/// prefixes.
fn collect_interesting_orders(plan: &LogicalPlan) -> Vec<Vec<String>> {
    let mut out: Vec<Vec<String>> = Vec::new();
    plan.walk(&mut |node| match node {
        LogicalPlan::Sort { keys, .. } => {
            let cols: Vec<String> = keys
                .iter()
                .filter(|(_, d)| *d == SortDirection::Asc)
                .filter_map(|(e, _)| qualified_of(e))
                .collect();
            if cols.len() == keys.len() && !cols.is_empty() {
                out.push(cols);
            }
        }
        LogicalPlan::Aggregate { group_by, .. } => {
            let cols: Vec<String> = group_by.iter().filter_map(qualified_of).collect();
            if cols.len() == group_by.len() && !cols.is_empty() {
                out.push(cols);
            }
        }
        LogicalPlan::Join {
            condition: Some(c), ..
        } => {
            for conjunct in transform::split_conjuncts(c) {
                if let Expr::Binary {
                    op: BinaryOp::Eq,
                    left,
                    right,
                } = &conjunct
                {
                    for side in [left, right] {
                        if let Some(q) = qualified_of(side) {
                            out.push(vec![q]);
                        }
                    }
                }
            }
        }
        _ => {}
    });
    out.sort();
    out.dedup();
    out
}

/// Bare column names each alias needs anywhere in the query (for covered
/// index detection).
fn collect_required_columns(plan: &LogicalPlan) -> HashMap<String, HashSet<String>> {
    let mut out: HashMap<String, HashSet<String>> = HashMap::new();
    let mut visit_expr = |e: &Expr, out: &mut HashMap<String, HashSet<String>>| {
        let mut cols = Vec::new();
        referenced_columns(e, &mut cols);
        for (t, c) in cols {
            if let Some(t) = t {
                out.entry(t).or_default().insert(c);
            }
        }
    };
    plan.walk(&mut |node| match node {
        LogicalPlan::Scan { filter: Some(f), .. } => visit_expr(f, &mut out),
        LogicalPlan::Filter { predicate, .. } => visit_expr(predicate, &mut out),
        LogicalPlan::Project { exprs, .. } => {
            for (e, _) in exprs {
                visit_expr(e, &mut out);
            }
        }
        LogicalPlan::Join {
            condition: Some(c), ..
        } => visit_expr(c, &mut out),
        LogicalPlan::Aggregate {
            group_by,
            aggregates,
            having,
            ..
        } => {
            for e in group_by {
                visit_expr(e, &mut out);
            }
            for a in aggregates {
                if let Some(arg) = &a.arg {
                    visit_expr(arg, &mut out);
                }
            }
            if let Some(h) = having {
                visit_expr(h, &mut out);
            }
        }
        LogicalPlan::Sort { keys, .. } => {
            for (e, _) in keys {
                visit_expr(e, &mut out);
            }
        }
        _ => {}
    });
    out
}
