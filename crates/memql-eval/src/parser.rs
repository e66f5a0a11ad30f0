//! Pest-based parser for scalar SQL expressions

use std::sync::OnceLock;

use memql_sql::{BinOp, Expr, UnOp, Value, WhenThen};
use pest::iterators::{Pair, Pairs};
use pest::pratt_parser::{Assoc, Op, PrattParser};
use pest::Parser;
use pest_derive::Parser;

use crate::EvalError;

#[derive(Parser)]
#[grammar = "scalar.pest"]
pub struct ScalarParser;

/// A parsed expression and its optional `AS "alias"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub expr: Expr,
    pub alias: Option<String>,
}

fn pratt() -> &'static PrattParser<Rule> {
    static PRATT: OnceLock<PrattParser<Rule>> = OnceLock::new();
    PRATT.get_or_init(|| {
        // Loosest binding first; must agree with the renderer in memql-sql.
        PrattParser::new()
            .op(Op::infix(Rule::op_or, Assoc::Left))
            .op(Op::infix(Rule::op_and, Assoc::Left))
            .op(Op::prefix(Rule::op_not))
            .op(Op::infix(Rule::op_eq, Assoc::Left)
                | Op::infix(Rule::op_ne, Assoc::Left)
                | Op::infix(Rule::op_lt, Assoc::Left)
                | Op::infix(Rule::op_le, Assoc::Left)
                | Op::infix(Rule::op_gt, Assoc::Left)
                | Op::infix(Rule::op_ge, Assoc::Left)
                | Op::postfix(Rule::is_null)
                | Op::postfix(Rule::is_not_null))
            .op(Op::infix(Rule::op_add, Assoc::Left) | Op::infix(Rule::op_sub, Assoc::Left))
            .op(Op::infix(Rule::op_mul, Assoc::Left) | Op::infix(Rule::op_div, Assoc::Left))
            .op(Op::prefix(Rule::op_neg))
            .op(Op::postfix(Rule::cast))
    })
}

/// Parse one SQL expression, optionally followed by `AS <alias>`.
pub fn parse(source: &str) -> Result<Parsed, EvalError> {
    let statement = ScalarParser::parse(Rule::statement, source)
        .map_err(Box::new)?
        .next()
        .ok_or_else(|| EvalError::Syntax("Empty input".to_string()))?;

    let mut expr = None;
    let mut alias = None;
    for pair in statement.into_inner() {
        match pair.as_rule() {
            Rule::expr => expr = Some(parse_expr(pair.into_inner())?),
            Rule::alias => alias = Some(parse_alias(pair)?),
            _ => {}
        }
    }

    Ok(Parsed {
        expr: expr.ok_or_else(|| EvalError::Syntax("Missing expression".to_string()))?,
        alias,
    })
}

fn parse_expr(pairs: Pairs<Rule>) -> Result<Expr, EvalError> {
    pratt()
        .map_primary(parse_primary)
        .map_prefix(|op, rhs| {
            let rhs = rhs?;
            Ok(match op.as_rule() {
                Rule::op_neg => match rhs {
                    Expr::Literal { value: Value::Int(i) } => Expr::lit(-i),
                    Expr::Literal { value: Value::Float(x) } => Expr::lit(-x),
                    other => -other,
                },
                Rule::op_not => Expr::Unary {
                    op: UnOp::Not,
                    expr: Box::new(rhs),
                },
                rule => return Err(EvalError::Syntax(format!("Unexpected prefix: {:?}", rule))),
            })
        })
        .map_postfix(|lhs, op| {
            let lhs = lhs?;
            Ok(match op.as_rule() {
                Rule::is_null => Expr::IsNull {
                    expr: Box::new(lhs),
                    negated: false,
                },
                Rule::is_not_null => Expr::IsNull {
                    expr: Box::new(lhs),
                    negated: true,
                },
                Rule::cast => {
                    let to = op
                        .into_inner()
                        .next()
                        .map(|name| name.as_str().to_ascii_lowercase())
                        .ok_or_else(|| EvalError::Syntax("Missing cast type".to_string()))?;
                    lhs.cast(to)
                }
                rule => return Err(EvalError::Syntax(format!("Unexpected postfix: {:?}", rule))),
            })
        })
        .map_infix(|lhs, op, rhs| {
            let op = match op.as_rule() {
                Rule::op_or => BinOp::Or,
                Rule::op_and => BinOp::And,
                Rule::op_eq => BinOp::Eq,
                Rule::op_ne => BinOp::Ne,
                Rule::op_lt => BinOp::Lt,
                Rule::op_le => BinOp::Le,
                Rule::op_gt => BinOp::Gt,
                Rule::op_ge => BinOp::Ge,
                Rule::op_add => BinOp::Add,
                Rule::op_sub => BinOp::Sub,
                Rule::op_mul => BinOp::Mul,
                Rule::op_div => BinOp::Div,
                rule => return Err(EvalError::Syntax(format!("Unexpected operator: {:?}", rule))),
            };
            Ok(Expr::binary(op, lhs?, rhs?))
        })
        .parse(pairs)
}

fn parse_primary(pair: Pair<Rule>) -> Result<Expr, EvalError> {
    match pair.as_rule() {
        Rule::expr => parse_expr(pair.into_inner()),
        Rule::null => Ok(Expr::null()),
        Rule::boolean => Ok(Expr::lit(pair.as_str().eq_ignore_ascii_case("true"))),
        Rule::number => parse_number(pair.as_str()),
        Rule::string => Ok(Expr::lit(unquote(&pair, "''", "'"))),
        Rule::identifier | Rule::quoted_identifier => Ok(Expr::column(pair.as_str())),
        Rule::func_call => parse_func_call(pair),
        Rule::case_expr => parse_case(pair),
        rule => Err(EvalError::Syntax(format!("Unexpected operand: {:?}", rule))),
    }
}

fn parse_number(text: &str) -> Result<Expr, EvalError> {
    if let Ok(int) = text.parse::<i64>() {
        return Ok(Expr::lit(int));
    }
    text.parse::<f64>()
        .map(Expr::lit)
        .map_err(|_| EvalError::Syntax(format!("Invalid number: {}", text)))
}

/// Text between the delimiters of a string or quoted identifier, escapes resolved.
fn unquote(pair: &Pair<Rule>, escaped: &str, quote: &str) -> String {
    pair.clone()
        .into_inner()
        .next()
        .map(|inner| inner.as_str().replace(escaped, quote))
        .unwrap_or_default()
}

fn parse_func_call(pair: Pair<Rule>) -> Result<Expr, EvalError> {
    let mut inner = pair.into_inner();
    let name = inner
        .next()
        .ok_or_else(|| EvalError::Syntax("Missing function name".to_string()))?
        .as_str()
        .to_ascii_uppercase();
    let args = inner
        .map(|arg| parse_expr(arg.into_inner()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Expr::func(name, args))
}

fn parse_case(pair: Pair<Rule>) -> Result<Expr, EvalError> {
    let mut branches = Vec::new();
    let mut otherwise = Expr::null();
    for clause in pair.into_inner() {
        match clause.as_rule() {
            Rule::when_clause => {
                let mut parts = clause.into_inner();
                let (Some(when), Some(then)) = (parts.next(), parts.next()) else {
                    return Err(EvalError::Syntax("Incomplete WHEN clause".to_string()));
                };
                branches.push(WhenThen {
                    when: parse_expr(when.into_inner())?,
                    then: parse_expr(then.into_inner())?,
                });
            }
            Rule::else_clause => {
                if let Some(value) = clause.into_inner().next() {
                    otherwise = parse_expr(value.into_inner())?;
                }
            }
            _ => {}
        }
    }
    Ok(Expr::Case {
        branches,
        otherwise: Box::new(otherwise),
    })
}

fn parse_alias(pair: Pair<Rule>) -> Result<String, EvalError> {
    let name = pair
        .into_inner()
        .next()
        .ok_or_else(|| EvalError::Syntax("Missing alias".to_string()))?;
    Ok(match name.as_rule() {
        Rule::quoted_identifier => unquote(&name, "\"\"", "\""),
        _ => name.as_str().to_string(),
    })
}
