//! Reference evaluator for the SQL that memql descriptors emit
//!
//! Parses one scalar expression (optionally with `AS "alias"`) into a
//! [`memql_sql::Expr`] and evaluates it against a single row of named values
//! with SQL NULL semantics. It exists so generated SQL can be checked against
//! numeric inference without a database.

mod eval;
mod parser;

pub use eval::Evaluator;
pub use parser::{parse, Parsed, Rule, ScalarParser};

use memql_sql::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("Parse error: {0}")]
    Parse(#[from] Box<pest::error::Error<Rule>>),

    #[error("Syntax error: {0}")]
    Syntax(String),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Function {name} expects {expected} argument(s), got {actual}")]
    Arity {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Cannot cast {value} to {to}")]
    Cast { value: Value, to: String },
}
