//! Scalar SQL expression tree and its renderer

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops;

use crate::Value;

/// Expression types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expr {
    Literal { value: Value },
    /// Caller-supplied column reference (or literal text), emitted verbatim.
    Column { name: String },
    Binary { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    Unary { op: UnOp, expr: Box<Expr> },
    Func { name: String, args: Vec<Expr> },
    Case { branches: Vec<WhenThen>, otherwise: Box<Expr> },
    IsNull { expr: Box<Expr>, negated: bool },
    Cast { expr: Box<Expr>, to: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhenThen {
    pub when: Expr,
    pub then: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    // Arithmetic
    Add, Sub, Mul, Div,
    // Comparison
    Eq, Ne, Lt, Le, Gt, Ge,
    // Logical
    And, Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

// Binding strength, loosest first. The parser in memql-eval uses the same order.
const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_NOT: u8 = 3;
const PREC_CMP: u8 = 4;
const PREC_ADD: u8 = 5;
const PREC_MUL: u8 = 6;
const PREC_NEG: u8 = 7;
const PREC_CAST: u8 = 8;
const PREC_ATOM: u8 = 9;

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Eq => "=",
            BinOp::Ne => "<>",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "AND",
            BinOp::Or => "OR",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    fn precedence(self) -> u8 {
        match self {
            BinOp::Or => PREC_OR,
            BinOp::And => PREC_AND,
            BinOp::Add | BinOp::Sub => PREC_ADD,
            BinOp::Mul | BinOp::Div => PREC_MUL,
            _ => PREC_CMP,
        }
    }
}

impl Expr {
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal {
            value: value.into(),
        }
    }

    pub fn null() -> Self {
        Expr::Literal { value: Value::Null }
    }

    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column { name: name.into() }
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Func {
            name: name.into(),
            args,
        }
    }

    pub fn exp(self) -> Self {
        Expr::func("EXP", vec![self])
    }

    pub fn abs(self) -> Self {
        Expr::func("ABS", vec![self])
    }

    pub fn power(self, exponent: Expr) -> Self {
        Expr::func("POWER", vec![self, exponent])
    }

    pub fn equals(self, other: Expr) -> Self {
        Expr::binary(BinOp::Eq, self, other)
    }

    pub fn less_than(self, other: Expr) -> Self {
        Expr::binary(BinOp::Lt, self, other)
    }

    pub fn greater_than(self, other: Expr) -> Self {
        Expr::binary(BinOp::Gt, self, other)
    }

    pub fn and(self, other: Expr) -> Self {
        Expr::binary(BinOp::And, self, other)
    }

    pub fn or(self, other: Expr) -> Self {
        Expr::binary(BinOp::Or, self, other)
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn cast(self, to: impl Into<String>) -> Self {
        Expr::Cast {
            expr: Box::new(self),
            to: to.into(),
        }
    }

    pub fn case(branches: Vec<(Expr, Expr)>, otherwise: Expr) -> Self {
        Expr::Case {
            branches: branches
                .into_iter()
                .map(|(when, then)| WhenThen { when, then })
                .collect(),
            otherwise: Box::new(otherwise),
        }
    }

    /// `CASE WHEN condition THEN then ELSE otherwise END`
    pub fn case_when(condition: Expr, then: Expr, otherwise: Expr) -> Self {
        Expr::case(vec![(condition, then)], otherwise)
    }

    /// Left-folded `a + b + c`; an empty input yields the literal `0`.
    pub fn sum(terms: impl IntoIterator<Item = Expr>) -> Self {
        Self::fold(terms, BinOp::Add).unwrap_or_else(|| Expr::lit(0))
    }

    /// Conjunction of all conditions; an empty input yields `TRUE`.
    pub fn all(conditions: impl IntoIterator<Item = Expr>) -> Self {
        Self::fold(conditions, BinOp::And).unwrap_or_else(|| Expr::lit(true))
    }

    /// Disjunction of all conditions; an empty input yields `FALSE`.
    pub fn any(conditions: impl IntoIterator<Item = Expr>) -> Self {
        Self::fold(conditions, BinOp::Or).unwrap_or_else(|| Expr::lit(false))
    }

    fn fold(items: impl IntoIterator<Item = Expr>, op: BinOp) -> Option<Expr> {
        items
            .into_iter()
            .reduce(|acc, item| Expr::binary(op, acc, item))
    }

    /// `1 / (1 + EXP(-(self)))`
    pub fn sigmoid(self) -> Self {
        Expr::lit(1) / (Expr::lit(1) + (-self).exp())
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Literal { value } => match value {
                Value::Int(i) if *i < 0 => PREC_NEG,
                Value::Float(x) if x.is_sign_negative() && x.is_finite() => PREC_NEG,
                Value::Float(x) if !x.is_finite() => PREC_CAST,
                _ => PREC_ATOM,
            },
            Expr::Column { .. } | Expr::Func { .. } | Expr::Case { .. } => PREC_ATOM,
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Unary { op: UnOp::Neg, .. } => PREC_NEG,
            Expr::Unary { op: UnOp::Not, .. } => PREC_NOT,
            Expr::IsNull { .. } => PREC_CMP,
            Expr::Cast { .. } => PREC_CAST,
        }
    }
}

/// Wraps `body` so that it yields NULL whenever any of `inputs` is NULL.
///
/// When `body` is already a `CASE`, the guard becomes its first branch instead
/// of adding another level of nesting.
pub fn null_guard(inputs: impl IntoIterator<Item = Expr>, body: Expr) -> Expr {
    let guard = Expr::any(inputs.into_iter().map(Expr::is_null));
    match body {
        Expr::Case {
            mut branches,
            otherwise,
        } => {
            branches.insert(
                0,
                WhenThen {
                    when: guard,
                    then: Expr::null(),
                },
            );
            Expr::Case {
                branches,
                otherwise,
            }
        }
        body => Expr::case_when(guard, Expr::null(), body),
    }
}

/// Picks the label of the winning score with an ordered `CASE`.
///
/// Candidate `i` is emitted as `WHEN s_i op s_j AND ... (for every j > i) THEN l_i`,
/// checked from the lowest index up, and the last candidate is the `ELSE`. With
/// `op = Le` this selects the minimum, with `op = Ge` the maximum; in both cases
/// the lowest index wins ties. Returns `None` when there are no candidates.
pub fn tournament(candidates: Vec<(Expr, Expr)>, op: BinOp) -> Option<Expr> {
    let scores: Vec<Expr> = candidates.iter().map(|(score, _)| score.clone()).collect();
    let mut labels: Vec<Expr> = candidates.into_iter().map(|(_, label)| label).collect();
    let last = labels.pop()?;
    if labels.is_empty() {
        return Some(last);
    }
    let branches = labels
        .into_iter()
        .enumerate()
        .map(|(i, label)| {
            let condition = Expr::all(
                scores[i + 1..]
                    .iter()
                    .map(|other| Expr::binary(op, scores[i].clone(), other.clone())),
            );
            (condition, label)
        })
        .collect();
    Some(Expr::case(branches, last))
}

impl ops::Add for Expr {
    type Output = Expr;

    fn add(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Add, self, rhs)
    }
}

impl ops::Sub for Expr {
    type Output = Expr;

    fn sub(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Sub, self, rhs)
    }
}

impl ops::Mul for Expr {
    type Output = Expr;

    fn mul(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Mul, self, rhs)
    }
}

impl ops::Div for Expr {
    type Output = Expr;

    fn div(self, rhs: Expr) -> Expr {
        Expr::binary(BinOp::Div, self, rhs)
    }
}

impl ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::Unary {
            op: UnOp::Neg,
            expr: Box::new(self),
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr, parenthesize: bool) -> fmt::Result {
    if parenthesize {
        write!(f, "({})", expr)
    } else {
        write!(f, "{}", expr)
    }
}

fn write_literal(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::Null => f.write_str("NULL"),
        Value::Bool(true) => f.write_str("TRUE"),
        Value::Bool(false) => f.write_str("FALSE"),
        Value::Int(i) => write!(f, "{}", i),
        Value::Float(x) if x.is_nan() => f.write_str("'NaN'::float"),
        Value::Float(x) if x.is_infinite() && *x > 0.0 => f.write_str("'Infinity'::float"),
        Value::Float(x) if x.is_infinite() => f.write_str("'-Infinity'::float"),
        Value::Float(x) => write!(f, "{:?}", x),
        Value::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal { value } => write_literal(f, value),
            Expr::Column { name } => f.write_str(name),
            Expr::Binary { op, left, right } => {
                let prec = op.precedence();
                let left_prec = left.precedence();
                write_operand(
                    f,
                    left,
                    left_prec < prec || (op.is_comparison() && left_prec == prec),
                )?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, right, right.precedence() <= prec)
            }
            Expr::Unary { op: UnOp::Neg, expr } => {
                f.write_str("-")?;
                write_operand(f, expr, expr.precedence() <= PREC_NEG)
            }
            Expr::Unary { op: UnOp::Not, expr } => {
                f.write_str("NOT ")?;
                write_operand(f, expr, expr.precedence() <= PREC_NOT)
            }
            Expr::Func { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
            Expr::Case {
                branches,
                otherwise,
            } => {
                f.write_str("CASE")?;
                for WhenThen { when, then } in branches {
                    write!(f, " WHEN {} THEN {}", when, then)?;
                }
                write!(f, " ELSE {} END", otherwise)
            }
            Expr::IsNull { expr, negated } => {
                write_operand(f, expr, expr.precedence() < PREC_ATOM)?;
                f.write_str(if *negated { " IS NOT NULL" } else { " IS NULL" })
            }
            Expr::Cast { expr, to } => {
                write_operand(f, expr, expr.precedence() < PREC_CAST)?;
                write!(f, "::{}", to)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x() -> Expr {
        Expr::column("x")
    }

    #[test]
    fn test_arithmetic_parenthesizes_only_when_needed() {
        let expr = Expr::lit(1.0) + Expr::lit(2.0) * x() + Expr::lit(3.0) * Expr::column("y");
        assert_eq!(expr.to_string(), "1.0 + 2.0 * x + 3.0 * y");

        let expr = (x() - Expr::lit(0.5)) * Expr::lit(2.0);
        assert_eq!(expr.to_string(), "(x - 0.5) * 2.0");

        let expr = x() - (Expr::column("y") - Expr::lit(1));
        assert_eq!(expr.to_string(), "x - (y - 1)");
    }

    #[test]
    fn test_negative_literals() {
        assert_eq!((x() - Expr::lit(-1.5)).to_string(), "x - -1.5");
        assert_eq!((-Expr::lit(-1.5)).to_string(), "-(-1.5)");
        assert_eq!(Expr::lit(-1).cast("int").to_string(), "(-1)::int");
    }

    #[test]
    fn test_sigmoid() {
        let expr = (Expr::lit(1.0) + Expr::lit(2.0) * x()).sigmoid();
        assert_eq!(expr.to_string(), "1 / (1 + EXP(-(1.0 + 2.0 * x)))");
    }

    #[test]
    fn test_case_and_cast() {
        let expr = Expr::case_when(x().less_than(Expr::lit(2.5)), Expr::lit(1.0), Expr::lit(0.0));
        assert_eq!(expr.to_string(), "CASE WHEN x < 2.5 THEN 1.0 ELSE 0.0 END");

        let expr = x().greater_than(Expr::lit(0.5)).cast("int");
        assert_eq!(expr.to_string(), "(x > 0.5)::int");
    }

    #[test]
    fn test_string_literal_escaping() {
        assert_eq!(Expr::lit("o'clock").to_string(), "'o''clock'");
    }

    #[test]
    fn test_tournament_lowest_index_wins_ties() {
        let candidates = vec![
            (Expr::column("d0"), Expr::lit(0)),
            (Expr::column("d1"), Expr::lit(1)),
            (Expr::column("d2"), Expr::lit(2)),
        ];
        let expr = tournament(candidates, BinOp::Le).unwrap();
        assert_eq!(
            expr.to_string(),
            "CASE WHEN d0 <= d1 AND d0 <= d2 THEN 0 WHEN d1 <= d2 THEN 1 ELSE 2 END"
        );
    }

    #[test]
    fn test_tournament_single_candidate() {
        let expr = tournament(vec![(x(), Expr::lit("a"))], BinOp::Ge).unwrap();
        assert_eq!(expr.to_string(), "'a'");
        assert!(tournament(vec![], BinOp::Ge).is_none());
    }

    #[test]
    fn test_null_guard_merges_into_case() {
        let body = Expr::case_when(x().less_than(Expr::column("y")), Expr::lit(0), Expr::lit(1));
        let expr = null_guard(vec![x(), Expr::column("y")], body);
        assert_eq!(
            expr.to_string(),
            "CASE WHEN x IS NULL OR y IS NULL THEN NULL WHEN x < y THEN 0 ELSE 1 END"
        );
    }
}
