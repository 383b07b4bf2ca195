// Aggregation.
//
// Hash mode groups arbitrary input; stream mode assumes the input arrives
// sorted by the group keys and emits each group as it closes. COUNT, SUM,
// AVG, MIN, MAX; AVG accumulates with Kahan compensation so long streams
// of small values stay numerically stable.

use crate::ast::Expr;
use crate::common::{Row, Value};
use crate::error::Result;
use crate::execution::expressions::{evaluate, truthy, Schema};
use crate::execution::{ExecContext, Operator};
use crate::optimizer::{AggExpr, AggFunc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateMode {
    Hash,
    Stream,
}

/// Kahan-compensated running sum.
#[derive(Debug, Clone, Default)]
struct KahanSum {
    sum: f64,
    compensation: f64,
}

impl KahanSum {
    fn add(&mut self, x: f64) {
        let y = x - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    fn value(&self) -> f64 {
        self.sum
    }
}

#[derive(Debug, Clone)]
enum AggState {
    Count(u64),
    SumInt { total: i64, any: bool },
    SumDouble { total: KahanSum, any: bool },
    Avg { total: KahanSum, count: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
}

impl AggState {
    fn new(func: AggFunc, first: Option<&Value>) -> AggState {
        match func {
            AggFunc::Count => AggState::Count(0),
            AggFunc::Sum => match first {
                Some(Value::Double(_)) => AggState::SumDouble {
                    total: KahanSum::default(),
                    any: false,
                },
                _ => AggState::SumInt {
                    total: 0,
                    any: false,
                },
            },
            AggFunc::Avg => AggState::Avg {
                total: KahanSum::default(),
                count: 0,
            },
            AggFunc::Min => AggState::Min(None),
            AggFunc::Max => AggState::Max(None),
        }
    }

    fn update(&mut self, value: Option<&Value>) {
        match self {
            AggState::Count(n) => {
                // COUNT(*) counts rows, COUNT(expr) counts non-nulls; the
                // caller passes None only for missing args (star form)
                match value {
                    Some(v) if v.is_null() => {}
                    _ => *n += 1,
                }
            }
            AggState::SumInt { total, any } => {
                if let Some(v) = value {
                    match v {
                        Value::Integer(i) => {
                            *total += i;
                            *any = true;
                        }
                        Value::Double(_) => {
                            // type widened mid-stream: convert
                            let mut wide = KahanSum::default();
                            wide.add(*total as f64);
                            if let Some(x) = v.as_f64() {
                                wide.add(x);
                            }
                            *self = AggState::SumDouble {
                                total: wide,
                                any: true,
                            };
                        }
                        _ => {}
                    }
                }
            }
            AggState::SumDouble { total, any } => {
                if let Some(x) = value.and_then(|v| v.as_f64()) {
                    total.add(x);
                    *any = true;
                }
            }
            AggState::Avg { total, count } => {
                if let Some(x) = value.and_then(|v| v.as_f64()) {
                    total.add(x);
                    *count += 1;
                }
            }
            AggState::Min(cur) => {
                if let Some(v) = value {
                    if !v.is_null()
                        && cur
                            .as_ref()
                            .map(|c| v.total_cmp(c) == std::cmp::Ordering::Less)
                            .unwrap_or(true)
                    {
                        *cur = Some(v.clone());
                    }
                }
            }
            AggState::Max(cur) => {
                if let Some(v) = value {
                    if !v.is_null()
                        && cur
                            .as_ref()
                            .map(|c| v.total_cmp(c) == std::cmp::Ordering::Greater)
                            .unwrap_or(true)
                    {
                        *cur = Some(v.clone());
                    }
                }
            }
        }
    }

    fn finish(&self) -> Value {
        match self {
            AggState::Count(n) => Value::Integer(*n as i64),
            AggState::SumInt { total, any } => {
                if *any {
                    Value::Integer(*total)
                } else {
                    Value::Null
                }
            }
            AggState::SumDouble { total, any } => {
                if *any {
                    Value::Double(total.value())
                } else {
                    Value::Null
                }
            }
            AggState::Avg { total, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Double(total.value() / *count as f64)
                }
            }
            AggState::Min(v) | AggState::Max(v) => v.clone().unwrap_or(Value::Null),
        }
    }
}

pub struct Aggregate {
    input: Box<dyn Operator>,
    group_by: Vec<Expr>,
    aggregates: Vec<AggExpr>,
    having: Option<Expr>,
    schema: Schema,
    mode: AggregateMode,
    output: std::vec::IntoIter<Row>,
    opened: bool,
}

impl Aggregate {
    pub fn new(
        input: Box<dyn Operator>,
        group_by: Vec<Expr>,
        aggregates: Vec<AggExpr>,
        having: Option<Expr>,
        schema: Schema,
        mode: AggregateMode,
    ) -> Self {
        Self {
            input,
            group_by,
            aggregates,
            having,
            schema,
            mode,
            output: Vec::new().into_iter(),
            opened: false,
        }
    }

    fn group_key(&self, row: &Row, schema: &Schema) -> Result<Vec<Value>> {
        self.group_by
            .iter()
            .map(|e| evaluate(e, schema, row))
            .collect()
    }

    fn new_states(&self, schema: &Schema, row: &Row) -> Result<Vec<AggState>> {
        self.aggregates
            .iter()
            .map(|a| {
                let sample = match &a.arg {
                    Some(arg) => Some(evaluate(arg, schema, row)?),
                    None => None,
                };
                Ok(AggState::new(a.func, sample.as_ref()))
            })
            .collect()
    }

    fn update_states(
        &self,
        states: &mut [AggState],
        schema: &Schema,
        row: &Row,
    ) -> Result<()> {
        for (agg, state) in self.aggregates.iter().zip(states.iter_mut()) {
            match &agg.arg {
                Some(arg) => {
                    let v = evaluate(arg, schema, row)?;
                    state.update(Some(&v));
                }
                None => state.update(None),
            }
        }
        Ok(())
    }

    fn finish_group(&self, key: Vec<Value>, states: &[AggState]) -> Result<Option<Row>> {
        let mut row = key;
        row.extend(states.iter().map(|s| s.finish()));
        if let Some(having) = &self.having {
            if !truthy(&evaluate(having, &self.schema, &row)?) {
                return Ok(None);
            }
        }
        Ok(Some(row))
    }
}

impl Operator for Aggregate {
    fn open(&mut self, ctx: &ExecContext<'_>) -> Result<()> {
        self.input.open(ctx)?;
        let input_schema = self.input.schema().clone();
        let mut out = Vec::new();

        match self.mode {
            AggregateMode::Hash => {
                let mut groups: HashMap<Vec<Value>, Vec<AggState>> = HashMap::new();
                let mut order: Vec<Vec<Value>> = Vec::new();
                let mut saw_rows = false;
                while let Some(batch) = self.input.next_batch(ctx)? {
                    ctx.check_deadline()?;
                    for row in &batch {
                        saw_rows = true;
                        let key = self.group_key(row, &input_schema)?;
                        if !groups.contains_key(&key) {
                            order.push(key.clone());
                            let states = self.new_states(&input_schema, row)?;
                            groups.insert(key.clone(), states);
                        }
                        let states = groups.get_mut(&key).expect("just inserted");
                        self.update_states(states, &input_schema, row)?;
                    }
                }
                if self.group_by.is_empty() {
                    // a global aggregate over zero rows still yields one row
                    if !saw_rows {
                        let states: Vec<AggState> = self
                            .aggregates
                            .iter()
                            .map(|a| AggState::new(a.func, None))
                            .collect();
                        if let Some(row) = self.finish_group(Vec::new(), &states)? {
                            out.push(row);
                        }
                    } else {
                        for key in order {
                            let states = &groups[&key];
                            if let Some(row) = self.finish_group(key.clone(), states)? {
                                out.push(row);
                            }
                        }
                    }
                } else {
                    for key in order {
                        let states = &groups[&key];
                        if let Some(row) = self.finish_group(key.clone(), states)? {
                            out.push(row);
                        }
                    }
                }
            }
            AggregateMode::Stream => {
                let mut current: Option<(Vec<Value>, Vec<AggState>)> = None;
                while let Some(batch) = self.input.next_batch(ctx)? {
                    ctx.check_deadline()?;
                    for row in &batch {
                        let key = self.group_key(row, &input_schema)?;
                        match &mut current {
                            Some((cur_key, states)) if *cur_key == key => {
                                self.update_states(states, &input_schema, row)?;
                            }
                            _ => {
                                if let Some((k, s)) = current.take() {
                                    if let Some(done) = self.finish_group(k, &s)? {
                                        out.push(done);
                                    }
                                }
                                let mut states = self.new_states(&input_schema, row)?;
                                self.update_states(&mut states, &input_schema, row)?;
                                current = Some((key, states));
                            }
                        }
                    }
                }
                if let Some((k, s)) = current.take() {
                    if let Some(done) = self.finish_group(k, &s)? {
                        out.push(done);
                    }
                }
            }
        }

        self.output = out.into_iter();
        self.opened = true;
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
        self.input.close(ctx)?;
        self.output = Vec::new().into_iter();
        Ok(())
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kahan_stability() {
        // summing 1e8 copies of 0.1 naively drifts; Kahan holds tight
        let mut k = KahanSum::default();
        for _ in 0..1_000_000 {
            k.add(0.1);
        }
        assert!((k.value() - 100_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_count_ignores_nulls_for_expr() {
        let mut s = AggState::Count(0);
        s.update(Some(&Value::Integer(1)));
        s.update(Some(&Value::Null));
        s.update(None); // COUNT(*) form
        assert_eq!(s.finish(), Value::Integer(2));
    }

    #[test]
    fn test_sum_widens_to_double() {
        let mut s = AggState::new(AggFunc::Sum, Some(&Value::Integer(0)));
        s.update(Some(&Value::Integer(2)));
        s.update(Some(&Value::Double(0.5)));
        assert_eq!(s.finish(), Value::Double(2.5));
    }

    #[test]
    fn test_min_max_skip_nulls() {
        let mut min = AggState::new(AggFunc::Min, None);
        let mut max = AggState::new(AggFunc::Max, None);
        for v in [Value::Integer(5), Value::Null, Value::Integer(2)] {
            min.update(Some(&v));
            max.update(Some(&v));
        }
        assert_eq!(min.finish(), Value::Integer(2));
        assert_eq!(max.finish(), Value::Integer(5));
    }

    #[test]
    fn test_empty_sum_is_null() {
        let s = AggState::new(AggFunc::Sum, None);
        assert_eq!(s.finish(), Value::Null);
    }
}
