//! Row-level helpers shared by the evaluators

use memql_sql::{Expr, Value};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::error::{ModelError, Result};

pub(crate) fn check_width(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ModelError::LengthMismatch {
            what,
            expected,
            actual,
        })
    }
}

/// Reads a feature as a number; NULL becomes NaN.
pub(crate) fn numeric(value: &Value) -> Result<f64> {
    value.as_f64().ok_or_else(|| ModelError::InvalidValue {
        value: value.clone(),
    })
}

pub(crate) fn numeric_row(row: ArrayView1<'_, Value>) -> Result<Vec<f64>> {
    row.iter().map(numeric).collect()
}

pub(crate) fn feature<'r>(row: &'r ArrayView1<'_, Value>, index: usize) -> Result<&'r Value> {
    row.get(index).ok_or(ModelError::Index {
        index,
        width: row.len(),
    })
}

pub(crate) fn predict_rows(
    x: ArrayView2<'_, Value>,
    f: impl FnMut(ArrayView1<'_, Value>) -> Result<Value>,
) -> Result<Array1<Value>> {
    x.rows()
        .into_iter()
        .map(f)
        .collect::<Result<Vec<_>>>()
        .map(Array1::from)
}

/// Evaluates `f` on every row and stacks the results into a `rows x width` matrix.
pub(crate) fn matrix_rows(
    x: ArrayView2<'_, Value>,
    width: usize,
    mut f: impl FnMut(ArrayView1<'_, Value>) -> Result<Vec<f64>>,
) -> Result<Array2<f64>> {
    let mut data = Vec::with_capacity(x.nrows() * width);
    for row in x.rows() {
        let values = f(row)?;
        check_width("output row", width, values.len())?;
        data.extend(values);
    }
    Array2::from_shape_vec((x.nrows(), width), data).map_err(|_| ModelError::LengthMismatch {
        what: "output matrix",
        expected: x.nrows() * width,
        actual: 0,
    })
}

/// Index of the first maximum.
pub(crate) fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, value) in values.iter().enumerate().skip(1) {
        if *value > values[best] {
            best = i;
        }
    }
    best
}

/// Index of the first minimum.
pub(crate) fn argmin(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, value) in values.iter().enumerate().skip(1) {
        if *value < values[best] {
            best = i;
        }
    }
    best
}

/// Label for class `index`: the matching entry of `classes`, or the index itself.
pub(crate) fn class_label(classes: &[Value], index: usize) -> Value {
    classes.get(index).cloned().unwrap_or_else(|| Value::from(index))
}

/// Categorical match: a non-NULL value whose textual form equals `text`.
pub(crate) fn same_text(value: &Value, text: &str) -> bool {
    !value.is_null() && value.to_string() == text
}

/// `x::varchar = '<text>'`, the SQL form of [`same_text`].
pub(crate) fn same_text_sql(column: Expr, text: &str) -> Expr {
    column.cast("varchar").equals(Expr::lit(text))
}

pub(crate) fn columns<S: AsRef<str>>(columns: &[S]) -> Vec<Expr> {
    columns.iter().map(|c| Expr::column(c.as_ref())).collect()
}
