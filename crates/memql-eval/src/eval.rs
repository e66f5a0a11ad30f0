//! Row-at-a-time evaluation with SQL NULL semantics

use std::cmp::Ordering;
use std::collections::HashMap;

use memql_sql::{BinOp, Expr, UnOp, Value};
use tracing::trace;

use crate::EvalError;

/// Evaluates expressions against a single row of named values.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    row: HashMap<String, Value>,
}

impl Evaluator {
    pub fn new(row: HashMap<String, Value>) -> Self {
        Self { row }
    }

    /// Pairs column names with the values of one row.
    pub fn from_row<S: AsRef<str>>(columns: &[S], values: &[Value]) -> Self {
        let row = columns
            .iter()
            .zip(values)
            .map(|(name, value)| (name.as_ref().to_string(), value.clone()))
            .collect();
        Self { row }
    }

    pub fn evaluate(&self, expr: &Expr) -> Result<Value, EvalError> {
        let value = match expr {
            Expr::Literal { value } => value.clone(),
            Expr::Column { name } => self.column(name)?,
            Expr::Binary { op, left, right } => self.binary(*op, left, right)?,
            Expr::Unary { op: UnOp::Neg, expr } => negate(self.evaluate(expr)?)?,
            Expr::Unary { op: UnOp::Not, expr } => match truth(&self.evaluate(expr)?)? {
                Some(b) => Value::Bool(!b),
                None => Value::Null,
            },
            Expr::Func { name, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.evaluate(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                call(name, &args)?
            }
            Expr::Case {
                branches,
                otherwise,
            } => {
                for branch in branches {
                    // Only the selected branch is evaluated
                    if truth(&self.evaluate(&branch.when)?)? == Some(true) {
                        return self.evaluate(&branch.then);
                    }
                }
                self.evaluate(otherwise)?
            }
            Expr::IsNull { expr, negated } => Value::Bool(self.evaluate(expr)?.is_null() != *negated),
            Expr::Cast { expr, to } => cast(self.evaluate(expr)?, to)?,
        };
        trace!("{} => {}", expr, value);
        Ok(value)
    }

    fn column(&self, name: &str) -> Result<Value, EvalError> {
        if let Some(value) = self.row.get(name) {
            return Ok(value.clone());
        }
        let unquoted = name
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .map(|inner| inner.replace("\"\"", "\""));
        unquoted
            .and_then(|inner| self.row.get(&inner).cloned())
            .ok_or_else(|| EvalError::UnknownColumn(name.to_string()))
    }

    fn binary(&self, op: BinOp, left: &Expr, right: &Expr) -> Result<Value, EvalError> {
        match op {
            BinOp::And => {
                let lhs = truth(&self.evaluate(left)?)?;
                if lhs == Some(false) {
                    return Ok(Value::Bool(false));
                }
                Ok(match (lhs, truth(&self.evaluate(right)?)?) {
                    (_, Some(false)) => Value::Bool(false),
                    (Some(true), Some(true)) => Value::Bool(true),
                    _ => Value::Null,
                })
            }
            BinOp::Or => {
                let lhs = truth(&self.evaluate(left)?)?;
                if lhs == Some(true) {
                    return Ok(Value::Bool(true));
                }
                Ok(match (lhs, truth(&self.evaluate(right)?)?) {
                    (_, Some(true)) => Value::Bool(true),
                    (Some(false), Some(false)) => Value::Bool(false),
                    _ => Value::Null,
                })
            }
            _ => {
                let lhs = self.evaluate(left)?;
                let rhs = self.evaluate(right)?;
                if lhs.is_null() || rhs.is_null() {
                    return Ok(Value::Null);
                }
                if op.is_comparison() {
                    compare(op, &lhs, &rhs)
                } else {
                    arithmetic(op, &lhs, &rhs)
                }
            }
        }
    }
}

/// SQL truth value: `None` is UNKNOWN.
fn truth(value: &Value) -> Result<Option<bool>, EvalError> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        Value::Int(i) => Ok(Some(*i != 0)),
        Value::Float(x) => Ok(Some(*x != 0.0)),
        Value::String(s) => Err(EvalError::TypeMismatch(format!(
            "'{}' is not a boolean",
            s
        ))),
    }
}

fn number(value: &Value) -> Result<f64, EvalError> {
    match value {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(x) => Ok(*x),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| EvalError::TypeMismatch(format!("'{}' is not a number", s))),
        other => Err(EvalError::TypeMismatch(format!("{} is not a number", other))),
    }
}

fn negate(value: Value) -> Result<Value, EvalError> {
    match value {
        Value::Null => Ok(Value::Null),
        Value::Int(i) => Ok(i
            .checked_neg()
            .map(Value::Int)
            .unwrap_or(Value::Float(-(i as f64)))),
        other => Ok(Value::Float(-number(&other)?)),
    }
}

fn arithmetic(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        let exact = match op {
            BinOp::Add => a.checked_add(*b),
            BinOp::Sub => a.checked_sub(*b),
            BinOp::Mul => a.checked_mul(*b),
            _ => None,
        };
        if let Some(result) = exact {
            return Ok(Value::Int(result));
        }
    }

    let a = number(lhs)?;
    let b = number(rhs)?;
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            a / b
        }
        other => {
            return Err(EvalError::Syntax(format!(
                "'{}' is not an arithmetic operator",
                other.symbol()
            )))
        }
    };
    Ok(Value::Float(result))
}

fn compare(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let ordering = match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => number(lhs)?.partial_cmp(&number(rhs)?),
    };
    // Any comparison involving NaN is false, except `<>`.
    let Some(ordering) = ordering else {
        return Ok(Value::Bool(op == BinOp::Ne));
    };
    let result = match op {
        BinOp::Eq => ordering == Ordering::Equal,
        BinOp::Ne => ordering != Ordering::Equal,
        BinOp::Lt => ordering == Ordering::Less,
        BinOp::Le => ordering != Ordering::Greater,
        BinOp::Gt => ordering == Ordering::Greater,
        BinOp::Ge => ordering != Ordering::Less,
        other => {
            return Err(EvalError::Syntax(format!(
                "'{}' is not a comparison",
                other.symbol()
            )))
        }
    };
    Ok(Value::Bool(result))
}

fn call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    let name = name.to_ascii_uppercase();
    let expected = match name.as_str() {
        "EXP" | "ABS" | "LN" | "SQRT" => 1,
        "POWER" => 2,
        _ => return Err(EvalError::UnknownFunction(name)),
    };
    if args.len() != expected {
        return Err(EvalError::Arity {
            name,
            expected,
            actual: args.len(),
        });
    }
    if args.iter().any(Value::is_null) {
        return Ok(Value::Null);
    }

    if let ("ABS", Value::Int(i)) = (name.as_str(), &args[0]) {
        if let Some(abs) = i.checked_abs() {
            return Ok(Value::Int(abs));
        }
    }
    let x = number(&args[0])?;
    let result = match name.as_str() {
        "EXP" => x.exp(),
        "ABS" => x.abs(),
        "LN" => x.ln(),
        "SQRT" => x.sqrt(),
        _ => x.powf(number(&args[1])?),
    };
    Ok(Value::Float(result))
}

fn cast(value: Value, to: &str) -> Result<Value, EvalError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let failed = |value: &Value| EvalError::Cast {
        value: value.clone(),
        to: to.to_string(),
    };
    match to.to_ascii_lowercase().as_str() {
        "int" | "integer" | "bigint" => match &value {
            Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::String(s) if s.trim().parse::<i64>().is_ok() => {
                Ok(s.trim().parse().map(Value::Int).unwrap_or(Value::Null))
            }
            _ => {
                let x = value.as_f64().ok_or_else(|| failed(&value))?;
                if !x.is_finite() {
                    return Err(failed(&value));
                }
                Ok(Value::Int(x.round() as i64))
            }
        },
        "float" | "double" | "float8" | "real" => match &value {
            Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            _ => value
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| failed(&value)),
        },
        "varchar" | "text" | "string" => Ok(Value::String(value.to_string())),
        "bool" | "boolean" => truth(&value)
            .ok()
            .flatten()
            .map(Value::Bool)
            .ok_or_else(|| failed(&value)),
        other => Err(EvalError::UnknownType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    fn eval(sql: &str, row: &[(&str, Value)]) -> Result<Value, EvalError> {
        let evaluator = Evaluator::new(
            row.iter()
                .map(|(name, value)| (name.to_string(), value.clone()))
                .collect(),
        );
        evaluator.evaluate(&parse(sql)?.expr)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(eval("1 + 2 * 3", &[]).unwrap(), Value::Int(7));
        assert_eq!(eval("1 / 4", &[]).unwrap(), Value::Float(0.25));
        assert_eq!(eval("1.5 + x", &[("x", Value::Int(2))]).unwrap(), Value::Float(3.5));
        assert_eq!(eval("-x", &[("x", Value::Int(2))]).unwrap(), Value::Int(-2));
        assert!(matches!(eval("1 / 0", &[]), Err(EvalError::DivisionByZero)));
    }

    #[test]
    fn test_null_propagation() {
        let row = [("x", Value::Null)];
        assert_eq!(eval("x + 1", &row).unwrap(), Value::Null);
        assert_eq!(eval("x < 1", &row).unwrap(), Value::Null);
        assert_eq!(eval("EXP(x)", &row).unwrap(), Value::Null);
        assert_eq!(eval("x IS NULL", &row).unwrap(), Value::Bool(true));
        assert_eq!(eval("x IS NOT NULL", &row).unwrap(), Value::Bool(false));
        assert_eq!(eval("x::int", &row).unwrap(), Value::Null);
    }

    #[test]
    fn test_three_valued_logic() {
        let row = [("x", Value::Null)];
        assert_eq!(eval("x < 1 AND FALSE", &row).unwrap(), Value::Bool(false));
        assert_eq!(eval("x < 1 AND TRUE", &row).unwrap(), Value::Null);
        assert_eq!(eval("x < 1 OR TRUE", &row).unwrap(), Value::Bool(true));
        assert_eq!(eval("x < 1 OR FALSE", &row).unwrap(), Value::Null);
        assert_eq!(eval("NOT x < 1", &row).unwrap(), Value::Null);
    }

    #[test]
    fn test_case_takes_first_true_branch() {
        let sql = "CASE WHEN x IS NULL THEN NULL WHEN x < 2 THEN 'low' ELSE 'high' END";
        assert_eq!(eval(sql, &[("x", Value::Int(1))]).unwrap(), Value::from("low"));
        assert_eq!(eval(sql, &[("x", Value::Int(5))]).unwrap(), Value::from("high"));
        assert_eq!(eval(sql, &[("x", Value::Null)]).unwrap(), Value::Null);
        // The untaken branch would divide by zero
        assert_eq!(
            eval("CASE WHEN x = 0 THEN 1.0 ELSE 1 / x END", &[("x", Value::Int(0))]).unwrap(),
            Value::Float(1.0)
        );
        assert_eq!(eval("CASE WHEN FALSE THEN 1 END", &[]).unwrap(), Value::Null);
    }

    #[test]
    fn test_string_comparison() {
        let row = [("sex", Value::from("female"))];
        assert_eq!(eval("sex = 'female'", &row).unwrap(), Value::Bool(true));
        assert_eq!(eval("sex = 'male'", &row).unwrap(), Value::Bool(false));
        assert_eq!(eval("x = '2'", &[("x", Value::Int(2))]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval("POWER(2, 3)", &[]).unwrap(), Value::Float(8.0));
        assert_eq!(eval("ABS(-3)", &[]).unwrap(), Value::Int(3));
        assert_eq!(eval("sqrt(4.0)", &[]).unwrap(), Value::Float(2.0));
        assert_eq!(eval("EXP(0)", &[]).unwrap(), Value::Float(1.0));
        assert!(matches!(eval("FOO(1)", &[]), Err(EvalError::UnknownFunction(_))));
        assert!(matches!(eval("POWER(1)", &[]), Err(EvalError::Arity { .. })));
    }

    #[test]
    fn test_casts() {
        assert_eq!(eval("(0.7 > 0.5)::int", &[]).unwrap(), Value::Int(1));
        assert_eq!(eval("2.6::int", &[]).unwrap(), Value::Int(3));
        assert_eq!(eval("'12'::int", &[]).unwrap(), Value::Int(12));
        assert_eq!(eval("3::float", &[]).unwrap(), Value::Float(3.0));
        assert!(matches!(eval("'NaN'::float", &[]).unwrap(), Value::Float(x) if x.is_nan()));
        assert_eq!(eval("'Infinity'::float", &[]).unwrap(), Value::Float(f64::INFINITY));
        assert_eq!(eval("1.5::varchar", &[]).unwrap(), Value::from("1.5"));
        assert!(matches!(eval("'abc'::int", &[]), Err(EvalError::Cast { .. })));
        assert!(matches!(eval("1::blob", &[]), Err(EvalError::UnknownType(_))));
    }

    #[test]
    fn test_columns() {
        let evaluator = Evaluator::from_row(&["my col", "b"], &[Value::Int(1), Value::Int(2)]);
        let expr = parse("\"my col\" + b").unwrap().expr;
        assert_eq!(evaluator.evaluate(&expr).unwrap(), Value::Int(3));
        assert!(matches!(
            evaluator.evaluate(&Expr::column("c")),
            Err(EvalError::UnknownColumn(_))
        ));
    }
}
