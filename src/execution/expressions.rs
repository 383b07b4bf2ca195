// Expression evaluation.
//
// Operators resolve column references by name against their input schema
// (qualified "alias.column" plus the bare column name when unambiguous).
// Three-valued logic: NULL comparisons yield NULL, which filters treat as
// false.

use crate::ast::{BinaryOp, Expr};
use crate::common::{Row, Value};
use crate::error::{DbError, Result};
use std::cmp::Ordering;

/// Output schema of an operator: qualified column names in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    pub columns: Vec<String>,
}

impl Schema {
    pub fn new(columns: Vec<String>) -> Self {
        Self { columns }
    }

    /// Resolve a column reference. A bare name matches the suffix after
    /// the qualifier; ambiguity is an error.
    pub fn resolve(&self, table: Option<&str>, column: &str) -> Result<usize> {
        let target = match table {
            Some(t) => format!("{}.{}", t, column),
            None => column.to_string(),
        };
        let mut found: Option<usize> = None;
        for (i, name) in self.columns.iter().enumerate() {
            let matches = if table.is_some() {
                name == &target
            } else {
                name == column
                    || name
                        .rsplit_once('.')
                        .map(|(_, c)| c == column)
                        .unwrap_or(false)
            };
            if matches {
                if found.is_some() {
                    return Err(DbError::InvalidArgument(format!(
                        "ambiguous column {}",
                        column
                    )));
                }
                found = Some(i);
            }
        }
        found.ok_or_else(|| DbError::NotFound(format!("column {}", target)))
    }

    pub fn join(&self, other: &Schema) -> Schema {
        let mut columns = self.columns.clone();
        columns.extend(other.columns.iter().cloned());
        Schema::new(columns)
    }
}

/// Evaluate an expression against one row.
pub fn evaluate(expr: &Expr, schema: &Schema, row: &Row) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Column { table, column } => {
            let idx = schema.resolve(table.as_deref(), column)?;
            Ok(row.get(idx).cloned().unwrap_or(Value::Null))
        }
        Expr::Binary { op, left, right } => {
            let l = evaluate(left, schema, row)?;
            let r = evaluate(right, schema, row)?;
            apply_binary(*op, &l, &r)
        }
        Expr::IsNull(inner) => Ok(Value::Boolean(evaluate(inner, schema, row)?.is_null())),
        Expr::IsNotNull(inner) => Ok(Value::Boolean(!evaluate(inner, schema, row)?.is_null())),
        Expr::Not(inner) => match evaluate(inner, schema, row)? {
            Value::Null => Ok(Value::Null),
            v => Ok(Value::Boolean(!truthy(&v))),
        },
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let probe = evaluate(expr, schema, row)?;
            if probe.is_null() {
                return Ok(Value::Null);
            }
            let mut saw_null = false;
            for item in list {
                let v = evaluate(item, schema, row)?;
                if v.is_null() {
                    saw_null = true;
                } else if values_equal(&probe, &v) {
                    return Ok(Value::Boolean(!negated));
                }
            }
            if saw_null {
                Ok(Value::Null)
            } else {
                Ok(Value::Boolean(*negated))
            }
        }
        Expr::Call { function, args } => scalar_function(function, args, schema, row),
        Expr::Exists { .. } | Expr::InSubquery { .. } => Err(DbError::Internal(
            "subquery expression survived unnesting".into(),
        )),
    }
}

/// SQL truthiness: only TRUE passes a filter.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Boolean(b) => *b,
        Value::Integer(i) => *i != 0,
        Value::Null => false,
        _ => false,
    }
}

/// Equality for join keys and IN lists; NULL never equals anything.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        return false;
    }
    compare(a, b) == Some(Ordering::Equal)
}

/// Ordering for comparisons; None when either side is NULL.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    Some(a.total_cmp(b))
}

pub fn apply_binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    use BinaryOp::*;
    match op {
        And => Ok(match (bool3(l), bool3(r)) {
            (Some(false), _) | (_, Some(false)) => Value::Boolean(false),
            (Some(true), Some(true)) => Value::Boolean(true),
            _ => Value::Null,
        }),
        Or => Ok(match (bool3(l), bool3(r)) {
            (Some(true), _) | (_, Some(true)) => Value::Boolean(true),
            (Some(false), Some(false)) => Value::Boolean(false),
            _ => Value::Null,
        }),
        Eq | NotEq | Lt | LtEq | Gt | GtEq => {
            let Some(ord) = compare(l, r) else {
                return Ok(Value::Null);
            };
            let b = match op {
                Eq => ord == Ordering::Equal,
                NotEq => ord != Ordering::Equal,
                Lt => ord == Ordering::Less,
                LtEq => ord != Ordering::Greater,
                Gt => ord == Ordering::Greater,
                GtEq => ord != Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Boolean(b))
        }
        Add | Subtract | Multiply | Divide | Modulo => arithmetic(op, l, r),
        Like => match (l, r) {
            (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
            (Value::String(s), Value::String(pattern)) => {
                Ok(Value::Boolean(like_match(s, pattern)))
            }
            _ => Err(DbError::TypeMismatch(format!(
                "LIKE over {} and {}",
                l.type_name(),
                r.type_name()
            ))),
        },
    }
}

fn bool3(v: &Value) -> Option<bool> {
    match v {
        Value::Null => None,
        v => Some(truthy(v)),
    }
}

fn arithmetic(op: BinaryOp, l: &Value, r: &Value) -> Result<Value> {
    use BinaryOp::*;
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    match (l, r) {
        (Value::Integer(a), Value::Integer(b)) => match op {
            Add => Ok(Value::Integer(a.wrapping_add(*b))),
            Subtract => Ok(Value::Integer(a.wrapping_sub(*b))),
            Multiply => Ok(Value::Integer(a.wrapping_mul(*b))),
            Divide => {
                if *b == 0 {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Integer(a / b))
                }
            }
            Modulo => {
                if *b == 0 {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Integer(a % b))
                }
            }
            _ => unreachable!(),
        },
        _ => {
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                return Err(DbError::TypeMismatch(format!(
                    "arithmetic over {} and {}",
                    l.type_name(),
                    r.type_name()
                )));
            };
            let out = match op {
                Add => a + b,
                Subtract => a - b,
                Multiply => a * b,
                Divide => {
                    if b == 0.0 {
                        return Ok(Value::Null);
                    }
                    a / b
                }
                Modulo => {
                    if b == 0.0 {
                        return Ok(Value::Null);
                    }
                    a % b
                }
                _ => unreachable!(),
            };
            Ok(Value::Double(out))
        }
    }
}

/// SQL LIKE with % and _ wildcards.
fn like_match(s: &str, pattern: &str) -> bool {
    fn inner(s: &[char], p: &[char]) -> bool {
        match (s, p) {
            (_, []) => s.is_empty(),
            (_, ['%', rest @ ..]) => {
                (0..=s.len()).any(|i| inner(&s[i..], rest))
            }
            ([], _) => false,
            ([sc, srest @ ..], [pc, prest @ ..]) => {
                (*pc == '_' || sc == pc) && inner(srest, prest)
            }
        }
    }
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    inner(&s, &p)
}

fn scalar_function(name: &str, args: &[Expr], schema: &Schema, row: &Row) -> Result<Value> {
    let vals: Vec<Value> = args
        .iter()
        .map(|a| evaluate(a, schema, row))
        .collect::<Result<_>>()?;
    match name.to_ascii_uppercase().as_str() {
        "ABS" => match vals.first() {
            Some(Value::Integer(i)) => Ok(Value::Integer(i.abs())),
            Some(Value::Double(d)) => Ok(Value::Double(d.abs())),
            Some(Value::Null) | None => Ok(Value::Null),
            Some(v) => Err(DbError::TypeMismatch(format!("ABS({})", v.type_name()))),
        },
        "UPPER" => match vals.first() {
            Some(Value::String(s)) => Ok(Value::String(s.to_uppercase())),
            Some(Value::Null) | None => Ok(Value::Null),
            Some(v) => Err(DbError::TypeMismatch(format!("UPPER({})", v.type_name()))),
        },
        "LOWER" => match vals.first() {
            Some(Value::String(s)) => Ok(Value::String(s.to_lowercase())),
            Some(Value::Null) | None => Ok(Value::Null),
            Some(v) => Err(DbError::TypeMismatch(format!("LOWER({})", v.type_name()))),
        },
        "LENGTH" => match vals.first() {
            Some(Value::String(s)) => Ok(Value::Integer(s.chars().count() as i64)),
            Some(Value::Null) | None => Ok(Value::Null),
            Some(v) => Err(DbError::TypeMismatch(format!("LENGTH({})", v.type_name()))),
        },
        "COALESCE" => Ok(vals
            .into_iter()
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null)),
        other => Err(DbError::NotFound(format!("function {}", other))),
    }
}

/// Collect every column reference in an expression.
pub fn referenced_columns(expr: &Expr, out: &mut Vec<(Option<String>, String)>) {
    match expr {
        Expr::Column { table, column } => out.push((table.clone(), column.clone())),
        Expr::Literal(_) => {}
        Expr::Binary { left, right, .. } => {
            referenced_columns(left, out);
            referenced_columns(right, out);
        }
        Expr::Call { args, .. } => {
            for a in args {
                referenced_columns(a, out);
            }
        }
        Expr::IsNull(e) | Expr::IsNotNull(e) | Expr::Not(e) => referenced_columns(e, out),
        Expr::InList { expr, list, .. } => {
            referenced_columns(expr, out);
            for e in list {
                referenced_columns(e, out);
            }
        }
        Expr::Exists { .. } => {}
        Expr::InSubquery { expr, .. } => referenced_columns(expr, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec!["t.a".into(), "t.b".into()])
    }

    #[test]
    fn test_column_resolution() {
        let s = schema();
        assert_eq!(s.resolve(Some("t"), "a").unwrap(), 0);
        assert_eq!(s.resolve(None, "b").unwrap(), 1);
        assert!(s.resolve(None, "zzz").is_err());
    }

    #[test]
    fn test_ambiguous_bare_column() {
        let s = Schema::new(vec!["x.id".into(), "y.id".into()]);
        assert!(s.resolve(None, "id").is_err());
        assert_eq!(s.resolve(Some("y"), "id").unwrap(), 1);
    }

    #[test]
    fn test_comparison_and_arithmetic() {
        let s = schema();
        let row = vec![Value::Integer(4), Value::Integer(10)];
        let e = Expr::binary(
            BinaryOp::Lt,
            Expr::binary(BinaryOp::Add, Expr::column("a"), Expr::literal(Value::Integer(5))),
            Expr::column("b"),
        );
        assert_eq!(evaluate(&e, &s, &row).unwrap(), Value::Boolean(true));
    }

    #[test]
    fn test_null_comparison_is_null() {
        let s = schema();
        let row = vec![Value::Null, Value::Integer(1)];
        let e = Expr::eq(Expr::column("a"), Expr::literal(Value::Integer(1)));
        assert_eq!(evaluate(&e, &s, &row).unwrap(), Value::Null);
        assert!(!truthy(&Value::Null));
    }

    #[test]
    fn test_three_valued_and_or() {
        assert_eq!(
            apply_binary(BinaryOp::And, &Value::Null, &Value::Boolean(false)).unwrap(),
            Value::Boolean(false)
        );
        assert_eq!(
            apply_binary(BinaryOp::Or, &Value::Null, &Value::Boolean(true)).unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            apply_binary(BinaryOp::And, &Value::Null, &Value::Boolean(true)).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_like() {
        assert_eq!(
            apply_binary(
                BinaryOp::Like,
                &Value::String("hello world".into()),
                &Value::String("hello%".into())
            )
            .unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            apply_binary(
                BinaryOp::Like,
                &Value::String("abc".into()),
                &Value::String("a_c".into())
            )
            .unwrap(),
            Value::Boolean(true)
        );
        assert_eq!(
            apply_binary(
                BinaryOp::Like,
                &Value::String("abc".into()),
                &Value::String("a_d".into())
            )
            .unwrap(),
            Value::Boolean(false)
        );
    }

    #[test]
    fn test_division_by_zero_is_null() {
        assert_eq!(
            apply_binary(BinaryOp::Divide, &Value::Integer(5), &Value::Integer(0)).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_in_list_with_null() {
        let s = schema();
        let row = vec![Value::Integer(5), Value::Null];
        let e = Expr::InList {
            expr: Box::new(Expr::column("a")),
            list: vec![
                Expr::literal(Value::Integer(3)),
                Expr::literal(Value::Null),
            ],
            negated: false,
        };
        // 5 not in (3, NULL) is NULL, not false
        assert_eq!(evaluate(&e, &s, &row).unwrap(), Value::Null);
    }
}
