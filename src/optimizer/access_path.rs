// Access-path selection.
//
// For each base relation enumerate: full scan, index scan per usable
// index, index-only scan when the index covers every referenced column,
// and a bitmap OR over several indexes for selective disjunctions
// (aggressive level). The caller keeps the cheapest plus the cheapest per
// interesting ordering.

use crate::ast::{BinaryOp, Expr};
use crate::common::Value;
use crate::error::Result;
use crate::execution::expressions::Schema;
use crate::optimizer::cost::{CostModel, PlannerContext};
use crate::optimizer::physical::{IndexBounds, PhysNode, PhysicalPlan};
use crate::optimizer::transform::{join_conjuncts, split_conjuncts};
use crate::OptimizerLevel;
use std::collections::HashSet;

pub struct AccessPathSelector<'a> {
    pub model: &'a CostModel,
    pub ctx: &'a PlannerContext,
    pub level: OptimizerLevel,
}

impl<'a> AccessPathSelector<'a> {
    /// All candidate scans for one relation. `required` is the set of bare
    /// column names the query touches on this alias (None = unknown, skip
    /// covered scans).
    pub fn candidates(
        &self,
        table: &str,
        alias: &str,
        filter: Option<&Expr>,
        required: Option<&HashSet<String>>,
    ) -> Result<Vec<PhysicalPlan>> {
        let desc = self
            .ctx
            .tables
            .get(table)
            .ok_or_else(|| crate::error::DbError::NotFound(format!("table {}", table)))?;
        let schema = Schema::new(
            desc.columns
                .iter()
                .map(|c| format!("{}.{}", alias, c.name))
                .collect(),
        );
        let pk_ordering: Vec<String> = desc
            .primary_key_columns()
            .iter()
            .map(|i| format!("{}.{}", alias, desc.columns[*i].name))
            .collect();

        let conjuncts = filter.map(split_conjuncts).unwrap_or_default();
        let mut sel = filter
            .map(|f| self.model.selectivity(f, table, self.ctx))
            .unwrap_or(1.0);
        // adaptive feedback: observed rows from a mis-estimated plan
        // override the histogram estimate, and the costs with it
        let hinted_sel = self.ctx.row_hints.get(alias).map(|h| {
            (h / self.ctx.table_rows(table).max(1.0)).clamp(0.0, 1.0)
        });
        if let Some(h) = hinted_sel {
            sel = h;
        }

        let mut out = Vec::new();

        // sequential scan of the clustered tree; output follows PK order
        let (rows, cost) = self.model.seq_scan(table, sel, self.ctx);
        out.push(PhysicalPlan {
            node: PhysNode::SeqScan {
                table: table.to_string(),
                alias: alias.to_string(),
                filter: filter.cloned(),
            },
            rows,
            cost,
            ordering: pk_ordering.clone(),
            schema: schema.clone(),
        });

        for index in &desc.indexes {
            let Some((bounds, residual)) =
                extract_bounds(&conjuncts, &index.columns, alias)
            else {
                continue;
            };
            let bound_sel = self.bounds_selectivity(table, &index.columns, &bounds);
            let residual_sel = residual
                .as_ref()
                .map(|r| self.model.selectivity(r, table, self.ctx))
                .unwrap_or(1.0);
            let total_sel = hinted_sel.unwrap_or((bound_sel * residual_sel).clamp(0.0, 1.0));

            let index_ordering: Vec<String> = index
                .columns
                .iter()
                .map(|c| format!("{}.{}", alias, c))
                .collect();

            let (rows, cost) =
                self.model
                    .index_scan(table, &index.name, total_sel, false, self.ctx);
            out.push(PhysicalPlan {
                node: PhysNode::IndexScan {
                    table: table.to_string(),
                    alias: alias.to_string(),
                    index: index.name.clone(),
                    bounds: bounds.clone(),
                    filter: residual.clone(),
                },
                rows,
                cost,
                ordering: index_ordering.clone(),
                schema: schema.clone(),
            });

            // covered: every column the query touches lives in the index
            if let Some(required) = required {
                let covered = required
                    .iter()
                    .all(|c| index.columns.iter().any(|ic| ic == c));
                if covered {
                    let (rows, cost) =
                        self.model
                            .index_scan(table, &index.name, total_sel, true, self.ctx);
                    let covered_schema = Schema::new(
                        index
                            .columns
                            .iter()
                            .map(|c| format!("{}.{}", alias, c))
                            .collect(),
                    );
                    out.push(PhysicalPlan {
                        node: PhysNode::IndexOnlyScan {
                            table: table.to_string(),
                            alias: alias.to_string(),
                            index: index.name.clone(),
                            bounds,
                            filter: residual,
                        },
                        rows,
                        cost,
                        ordering: index_ordering,
                        schema: covered_schema,
                    });
                }
            }
        }

        // bitmap OR for disjunctions where each arm is selective on its
        // own index
        if self.level >= OptimizerLevel::Aggressive {
            if let Some(plan) =
                self.bitmap_candidate(table, alias, filter, desc, &schema, &pk_ordering)?
            {
                out.push(plan);
            }
        }

        Ok(out)
    }

    fn bounds_selectivity(&self, table: &str, columns: &[String], bounds: &IndexBounds) -> f64 {
        let mut sel = 1.0;
        for (i, v) in bounds.eq_prefix.iter().enumerate() {
            let pred = Expr::eq(Expr::column(&columns[i]), Expr::Literal(v.clone()));
            sel *= self.model.selectivity(&pred, table, self.ctx);
        }
        if bounds.lo.is_some() || bounds.hi.is_some() {
            let col = &columns[bounds.eq_prefix.len()];
            let mut range_sel = 1.0;
            if let Some((v, inclusive)) = &bounds.lo {
                let op = if *inclusive { BinaryOp::GtEq } else { BinaryOp::Gt };
                let pred = Expr::binary(op, Expr::column(col), Expr::Literal(v.clone()));
                range_sel *= self.model.selectivity(&pred, table, self.ctx);
            }
            if let Some((v, inclusive)) = &bounds.hi {
                let op = if *inclusive { BinaryOp::LtEq } else { BinaryOp::Lt };
                let pred = Expr::binary(op, Expr::column(col), Expr::Literal(v.clone()));
                range_sel *= self.model.selectivity(&pred, table, self.ctx);
            }
            sel *= range_sel;
        }
        sel.clamp(0.0, 1.0)
    }

    fn bitmap_candidate(
        &self,
        table: &str,
        alias: &str,
        filter: Option<&Expr>,
        desc: &crate::catalog::TableDescriptor,
        schema: &Schema,
        _pk_ordering: &[String],
    ) -> Result<Option<PhysicalPlan>> {
        let Some(Expr::Binary {
            op: BinaryOp::Or, ..
        }) = filter
        else {
            return Ok(None);
        };
        let arms = split_disjuncts(filter.unwrap());
        if arms.len() < 2 {
            return Ok(None);
        }
        let mut probes = Vec::new();
        let mut sels = Vec::new();
        for arm in &arms {
            let conjuncts = split_conjuncts(arm);
            let mut matched = false;
            for index in &desc.indexes {
                if let Some((bounds, None)) = extract_bounds(&conjuncts, &index.columns, alias) {
                    let sel = self.bounds_selectivity(table, &index.columns, &bounds);
                    if sel <= 0.2 {
                        probes.push((index.name.clone(), bounds));
                        sels.push(sel);
                        matched = true;
                        break;
                    }
                }
            }
            if !matched {
                // one unindexed arm sinks the whole bitmap plan
                return Ok(None);
            }
        }
        let (rows, cost) = self.model.bitmap_or_scan(table, &sels, self.ctx);
        Ok(Some(PhysicalPlan {
            node: PhysNode::BitmapOrScan {
                table: table.to_string(),
                alias: alias.to_string(),
                probes,
                filter: filter.cloned(),
            },
            rows,
            cost,
            // bitmap output comes back in heap (primary key) order
            ordering: _pk_ordering.to_vec(),
            schema: schema.clone(),
        }))
    }
}

/// Match conjuncts against an index's column list: a run of equalities on
/// the leading columns, then at most one range on the next. Returns the
/// bounds and the unconsumed conjuncts.
pub fn extract_bounds(
    conjuncts: &[Expr],
    index_columns: &[String],
    alias: &str,
) -> Option<(IndexBounds, Option<Expr>)> {
    let mut bounds = IndexBounds::default();
    let mut used = vec![false; conjuncts.len()];

    for col in index_columns {
        let mut advanced = false;
        // equality extends the prefix
        for (i, c) in conjuncts.iter().enumerate() {
            if used[i] {
                continue;
            }
            if let Some(v) = match_eq(c, col, alias) {
                bounds.eq_prefix.push(v);
                used[i] = true;
                advanced = true;
                break;
            }
        }
        if advanced {
            continue;
        }
        // otherwise a range on this column ends the match
        for (i, c) in conjuncts.iter().enumerate() {
            if used[i] {
                continue;
            }
            if let Some((lo, hi)) = match_range(c, col, alias) {
                if let Some(lo) = lo {
                    bounds.lo = Some(match bounds.lo.take() {
                        Some(existing) => tighter_lo(existing, lo),
                        None => lo,
                    });
                }
                if let Some(hi) = hi {
                    bounds.hi = Some(match bounds.hi.take() {
                        Some(existing) => tighter_hi(existing, hi),
                        None => hi,
                    });
                }
                used[i] = true;
            }
        }
        break;
    }

    if bounds.eq_prefix.is_empty() && bounds.lo.is_none() && bounds.hi.is_none() {
        return None;
    }
    let residual: Vec<Expr> = conjuncts
        .iter()
        .enumerate()
        .filter(|(i, _)| !used[*i])
        .map(|(_, c)| c.clone())
        .collect();
    Some((bounds, join_conjuncts(residual)))
}

fn column_matches(expr: &Expr, col: &str, alias: &str) -> bool {
    matches!(expr, Expr::Column { table, column }
        if column == col && table.as_deref().map(|t| t == alias).unwrap_or(true))
}

fn match_eq(conjunct: &Expr, col: &str, alias: &str) -> Option<Value> {
    if let Expr::Binary {
        op: BinaryOp::Eq,
        left,
        right,
    } = conjunct
    {
        if column_matches(left, col, alias) {
            if let Expr::Literal(v) = &**right {
                return Some(v.clone());
            }
        }
        if column_matches(right, col, alias) {
            if let Expr::Literal(v) = &**left {
                return Some(v.clone());
            }
        }
    }
    None
}

type RangeBound = Option<(Value, bool)>;

fn match_range(conjunct: &Expr, col: &str, alias: &str) -> Option<(RangeBound, RangeBound)> {
    let Expr::Binary { op, left, right } = conjunct else {
        return None;
    };
    let (op, lit) = if column_matches(left, col, alias) {
        let Expr::Literal(v) = &**right else {
            return None;
        };
        (*op, v.clone())
    } else if column_matches(right, col, alias) {
        let Expr::Literal(v) = &**left else {
            return None;
        };
        let flipped = match op {
            BinaryOp::Lt => BinaryOp::Gt,
            BinaryOp::LtEq => BinaryOp::GtEq,
            BinaryOp::Gt => BinaryOp::Lt,
            BinaryOp::GtEq => BinaryOp::LtEq,
            other => *other,
        };
        (flipped, v.clone())
    } else {
        return None;
    };
    match op {
        BinaryOp::Lt => Some((None, Some((lit, false)))),
        BinaryOp::LtEq => Some((None, Some((lit, true)))),
        BinaryOp::Gt => Some((Some((lit, false)), None)),
        BinaryOp::GtEq => Some((Some((lit, true)), None)),
        _ => None,
    }
}

fn tighter_lo(a: (Value, bool), b: (Value, bool)) -> (Value, bool) {
    match a.0.total_cmp(&b.0) {
        std::cmp::Ordering::Greater => a,
        std::cmp::Ordering::Less => b,
        std::cmp::Ordering::Equal => (a.0, a.1 && b.1),
    }
}

fn tighter_hi(a: (Value, bool), b: (Value, bool)) -> (Value, bool) {
    match a.0.total_cmp(&b.0) {
        std::cmp::Ordering::Less => a,
        std::cmp::Ordering::Greater => b,
        std::cmp::Ordering::Equal => (a.0, a.1 && b.1),
    }
}

fn split_disjuncts(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::Binary {
            op: BinaryOp::Or,
            left,
            right,
        } => {
            let mut out = split_disjuncts(left);
            out.extend(split_disjuncts(right));
            out
        }
        other => vec![other.clone()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_eq_bound() {
        let conjuncts = vec![Expr::eq(
            Expr::qualified("u", "email"),
            Expr::literal(Value::String("a@x".into())),
        )];
        let (bounds, residual) =
            extract_bounds(&conjuncts, &["email".to_string()], "u").unwrap();
        assert_eq!(bounds.eq_prefix.len(), 1);
        assert!(residual.is_none());
        assert!(bounds.is_point());
    }

    #[test]
    fn test_extract_range_bounds() {
        let conjuncts = vec![
            Expr::binary(
                BinaryOp::GtEq,
                Expr::qualified("t", "x"),
                Expr::literal(Value::Integer(10)),
            ),
            Expr::binary(
                BinaryOp::Lt,
                Expr::qualified("t", "x"),
                Expr::literal(Value::Integer(20)),
            ),
        ];
        let (bounds, residual) = extract_bounds(&conjuncts, &["x".to_string()], "t").unwrap();
        assert_eq!(bounds.lo, Some((Value::Integer(10), true)));
        assert_eq!(bounds.hi, Some((Value::Integer(20), false)));
        assert!(residual.is_none());
    }

    #[test]
    fn test_composite_prefix_then_range() {
        let conjuncts = vec![
            Expr::eq(Expr::qualified("t", "a"), Expr::literal(Value::Integer(1))),
            Expr::binary(
                BinaryOp::Gt,
                Expr::qualified("t", "b"),
                Expr::literal(Value::Integer(5)),
            ),
            Expr::eq(Expr::qualified("t", "z"), Expr::literal(Value::Integer(9))),
        ];
        let cols = vec!["a".to_string(), "b".to_string()];
        let (bounds, residual) = extract_bounds(&conjuncts, &cols, "t").unwrap();
        assert_eq!(bounds.eq_prefix, vec![Value::Integer(1)]);
        assert_eq!(bounds.lo, Some((Value::Integer(5), false)));
        assert!(residual.is_some(), "z conjunct stays residual");
    }

    #[test]
    fn test_unusable_conjuncts() {
        let conjuncts = vec![Expr::eq(
            Expr::qualified("t", "other"),
            Expr::literal(Value::Integer(1)),
        )];
        assert!(extract_bounds(&conjuncts, &["x".to_string()], "t").is_none());
    }
}
