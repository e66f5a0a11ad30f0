//! Affine models with an optional logistic link

use memql_sql::{Expr, Value};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::batch;
use crate::error::Result;

/// Output link, implied by the model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    Identity,
    Logistic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    pub(crate) coefficients: Vec<f64>,
    pub(crate) intercept: f64,
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl Linear {
    /// `intercept + c0 * x0 + c1 * x1 + ...`, NaN when a feature is NULL.
    fn score(&self, row: &ArrayView1<'_, Value>) -> Result<f64> {
        batch::check_width("coefficients", self.coefficients.len(), row.len())?;
        let mut total = self.intercept;
        for (coefficient, value) in self.coefficients.iter().zip(row.iter()) {
            total += coefficient * batch::numeric(value)?;
        }
        Ok(total)
    }

    fn activate(&self, row: &ArrayView1<'_, Value>, link: Link) -> Result<f64> {
        let z = self.score(row)?;
        Ok(match link {
            Link::Identity => z,
            Link::Logistic => sigmoid(z),
        })
    }

    /// Raw output for regressors, a 0/1 class for logistic models.
    pub fn predict(&self, x: ArrayView2<'_, Value>, link: Link) -> Result<Array1<Value>> {
        batch::predict_rows(x, |row| {
            let output = self.activate(&row, link)?;
            Ok(match link {
                _ if output.is_nan() => Value::Null,
                Link::Identity => Value::Float(output),
                Link::Logistic => Value::Int(i64::from(output > 0.5)),
            })
        })
    }

    /// `[1 - p, p]` per row.
    pub fn predict_proba(&self, x: ArrayView2<'_, Value>) -> Result<Array2<f64>> {
        batch::matrix_rows(x, 2, |row| {
            let p = self.activate(&row, Link::Logistic)?;
            Ok(vec![1.0 - p, p])
        })
    }

    fn score_sql(&self, columns: &[Expr]) -> Result<Expr> {
        batch::check_width("coefficients", self.coefficients.len(), columns.len())?;
        let terms = self
            .coefficients
            .iter()
            .zip(columns)
            .map(|(coefficient, column)| Expr::lit(*coefficient) * column.clone());
        Ok(Expr::sum(std::iter::once(Expr::lit(self.intercept)).chain(terms)))
    }

    pub fn predict_sql(&self, columns: &[Expr], link: Link) -> Result<Expr> {
        let score = self.score_sql(columns)?;
        Ok(match link {
            Link::Identity => score,
            Link::Logistic => score.sigmoid().greater_than(Expr::lit(0.5)).cast("int"),
        })
    }

    pub fn predict_proba_sql(&self, columns: &[Expr]) -> Result<Vec<Expr>> {
        let p = self.score_sql(columns)?.sigmoid();
        Ok(vec![Expr::lit(1) - p.clone(), p])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn model() -> Linear {
        Linear {
            coefficients: vec![2.0, 3.0],
            intercept: 1.0,
        }
    }

    #[test]
    fn test_identity_link() {
        let x = array![[Value::Int(1), Value::Int(1)], [Value::Null, Value::Int(1)]];
        let predictions = model().predict(x.view(), Link::Identity).unwrap();
        assert_eq!(predictions.to_vec(), vec![Value::Float(6.0), Value::Null]);
    }

    #[test]
    fn test_logistic_link() {
        let x = array![[Value::Int(-1), Value::Int(-1)], [Value::Int(1), Value::Int(1)]];
        let proba = model().predict_proba(x.view()).unwrap();
        assert_relative_eq!(proba[[1, 0]], 0.00247, epsilon = 1e-5);
        assert_relative_eq!(proba[[1, 1]], 0.99753, epsilon = 1e-5);
        let predictions = model().predict(x.view(), Link::Logistic).unwrap();
        assert_eq!(predictions.to_vec(), vec![Value::Int(0), Value::Int(1)]);
    }

    #[test]
    fn test_sql() {
        let columns = batch::columns(&["a", "b"]);
        assert_eq!(
            model().predict_sql(&columns, Link::Identity).unwrap().to_string(),
            "1.0 + 2.0 * a + 3.0 * b"
        );
        assert_eq!(
            model().predict_sql(&columns, Link::Logistic).unwrap().to_string(),
            "(1 / (1 + EXP(-(1.0 + 2.0 * a + 3.0 * b))) > 0.5)::int"
        );
        let proba = model().predict_proba_sql(&columns).unwrap();
        assert_eq!(
            proba[0].to_string(),
            "1 - 1 / (1 + EXP(-(1.0 + 2.0 * a + 3.0 * b)))"
        );
    }

    #[test]
    fn test_width_mismatch() {
        let x = array![[Value::Int(1)]];
        assert!(model().predict(x.view(), Link::Identity).is_err());
        assert!(model().predict_sql(&batch::columns(&["a"]), Link::Identity).is_err());
    }
}
