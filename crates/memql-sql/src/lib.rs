//! memql scalar SQL expressions
//!
//! Typed expression tree shared by every model evaluator. Rendering is
//! deterministic so generated expressions can be cached and compared.

mod expr;
mod value;

pub use expr::*;
pub use value::Value;
