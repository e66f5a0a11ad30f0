//! Feature-space transforms: projections, rescaling and one-hot expansion

use std::collections::HashMap;

use memql_sql::{Expr, Value};
use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::batch;
use crate::error::Result;

fn check_matrix(name: &str, matrix: &[Vec<f64>]) -> std::result::Result<usize, String> {
    let width = matrix
        .first()
        .map(Vec::len)
        .ok_or_else(|| format!("'{}' must have at least one row", name))?;
    if width == 0 {
        return Err(format!("'{}' must have at least one column", name));
    }
    if let Some(i) = matrix.iter().position(|row| row.len() != width) {
        return Err(format!(
            "row {} of '{}' has {} entries, expected {}",
            i,
            name,
            matrix[i].len(),
            width
        ));
    }
    Ok(width)
}

fn read_row(row: &ArrayView1<'_, Value>, width: usize) -> Result<Vec<f64>> {
    batch::check_width("input features", width, row.len())?;
    batch::numeric_row(row.view())
}

/// Principal component projection: `(x - mean) . components`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pca {
    /// One row per input feature, one column per component.
    pub(crate) principal_components: Vec<Vec<f64>>,
    pub(crate) mean: Vec<f64>,
}

impl Pca {
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        check_matrix("principal_components", &self.principal_components)?;
        if self.mean.len() != self.principal_components.len() {
            return Err(format!(
                "'mean' has {} entries, expected one per feature ({})",
                self.mean.len(),
                self.principal_components.len()
            ));
        }
        Ok(())
    }

    pub fn principal_components(&self) -> &[Vec<f64>] {
        &self.principal_components
    }

    fn n_components(&self) -> usize {
        self.principal_components[0].len()
    }

    pub fn transform(&self, x: ArrayView2<'_, Value>) -> Result<Array2<f64>> {
        let k = self.n_components();
        batch::matrix_rows(x, k, |row| {
            let values = read_row(&row, self.mean.len())?;
            Ok((0..k)
                .map(|j| {
                    values
                        .iter()
                        .zip(&self.mean)
                        .zip(&self.principal_components)
                        .map(|((x, mean), component)| (x - mean) * component[j])
                        .sum::<f64>()
                })
                .collect())
        })
    }

    pub fn transform_sql(&self, columns: &[Expr]) -> Result<Vec<Expr>> {
        batch::check_width("input features", self.mean.len(), columns.len())?;
        Ok((0..self.n_components())
            .map(|j| {
                Expr::sum(
                    columns
                        .iter()
                        .zip(&self.mean)
                        .zip(&self.principal_components)
                        .map(|((x, mean), component)| {
                            (x.clone() - Expr::lit(*mean)) * Expr::lit(component[j])
                        }),
                )
            })
            .collect())
    }
}

/// Projection on right singular vectors scaled by the singular values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Svd {
    pub(crate) vectors: Vec<Vec<f64>>,
    pub(crate) values: Vec<f64>,
}

impl Svd {
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        let k = check_matrix("vectors", &self.vectors)?;
        if self.values.len() != k {
            return Err(format!(
                "'values' has {} entries, expected one per vector ({})",
                self.values.len(),
                k
            ));
        }
        if self.values.iter().any(|value| *value == 0.0) {
            return Err("singular values must be non-zero".to_string());
        }
        Ok(())
    }

    pub fn transform(&self, x: ArrayView2<'_, Value>) -> Result<Array2<f64>> {
        batch::matrix_rows(x, self.values.len(), |row| {
            let values = read_row(&row, self.vectors.len())?;
            Ok(self
                .values
                .iter()
                .enumerate()
                .map(|(j, singular)| {
                    values
                        .iter()
                        .zip(&self.vectors)
                        .map(|(x, vector)| x * vector[j] / singular)
                        .sum::<f64>()
                })
                .collect())
        })
    }

    pub fn transform_sql(&self, columns: &[Expr]) -> Result<Vec<Expr>> {
        batch::check_width("input features", self.vectors.len(), columns.len())?;
        Ok(self
            .values
            .iter()
            .enumerate()
            .map(|(j, singular)| {
                Expr::sum(columns.iter().zip(&self.vectors).map(|(x, vector)| {
                    x.clone() * Expr::lit(vector[j]) / Expr::lit(*singular)
                }))
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizerMethod {
    Zscore,
    RobustZscore,
    Minmax,
}

/// Per-feature rescaling `(x - loc) / scale`.
///
/// `values` holds `(mean, std)`, `(median, mad)` or `(min, max)` pairs
/// depending on `method`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    pub(crate) values: Vec<(f64, f64)>,
    pub(crate) method: NormalizerMethod,
}

impl Normalizer {
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        if self.values.is_empty() {
            return Err("'values' must have one pair per feature".to_string());
        }
        if let Some(i) = self
            .location_scale()
            .position(|(_, scale)| scale == 0.0 || !scale.is_finite())
        {
            return Err(format!("feature {} has a zero or non-finite scale", i));
        }
        Ok(())
    }

    fn location_scale(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.values.iter().map(|(a, b)| match self.method {
            NormalizerMethod::Minmax => (*a, b - a),
            NormalizerMethod::Zscore | NormalizerMethod::RobustZscore => (*a, *b),
        })
    }

    pub fn transform(&self, x: ArrayView2<'_, Value>) -> Result<Array2<f64>> {
        batch::matrix_rows(x, self.values.len(), |row| {
            let values = read_row(&row, self.values.len())?;
            Ok(values
                .iter()
                .zip(self.location_scale())
                .map(|(x, (loc, scale))| (x - loc) / scale)
                .collect())
        })
    }

    pub fn transform_sql(&self, columns: &[Expr]) -> Result<Vec<Expr>> {
        batch::check_width("input features", self.values.len(), columns.len())?;
        Ok(columns
            .iter()
            .zip(self.location_scale())
            .map(|(x, (loc, scale))| (x.clone() - Expr::lit(loc)) / Expr::lit(scale))
            .collect())
    }
}

/// Output column naming for one-hot expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnNaming {
    /// `"<column>_<category index>"`
    Indices,
    /// `"<column>_<category>"`, duplicates suffixed with `_0`, `_1`, ...
    Values,
    /// `"<column>_<category>"`, duplicates kept as is.
    ValuesRelaxed,
}

fn default_column_naming() -> Option<ColumnNaming> {
    Some(ColumnNaming::Indices)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneHotEncoder {
    pub(crate) categories: Vec<Vec<Value>>,
    #[serde(default)]
    pub(crate) drop_first: bool,
    /// `None` emits the indicator expressions without aliases.
    #[serde(default = "default_column_naming")]
    pub(crate) column_naming: Option<ColumnNaming>,
}

fn indicator(value: &Value, category: &Value) -> bool {
    if category.is_null() {
        value.is_null()
    } else {
        batch::same_text(value, &category.to_string())
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl OneHotEncoder {
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        if self.categories.is_empty() {
            return Err("'categories' must have one list per feature".to_string());
        }
        Ok(())
    }

    /// `(feature, category index)` of every output column.
    fn outputs(&self) -> Vec<(usize, usize)> {
        let skip = usize::from(self.drop_first);
        self.categories
            .iter()
            .enumerate()
            .flat_map(|(i, categories)| (skip..categories.len()).map(move |j| (i, j)))
            .collect()
    }

    pub fn transform(&self, x: ArrayView2<'_, Value>) -> Result<Array2<f64>> {
        let outputs = self.outputs();
        batch::matrix_rows(x, outputs.len(), |row| {
            batch::check_width("input features", self.categories.len(), row.len())?;
            Ok(outputs
                .iter()
                .map(|&(i, j)| {
                    if indicator(&row[i], &self.categories[i][j]) {
                        1.0
                    } else {
                        0.0
                    }
                })
                .collect())
        })
    }

    fn aliases<S: AsRef<str>>(&self, columns: &[S], outputs: &[(usize, usize)]) -> Option<Vec<String>> {
        let naming = self.column_naming?;
        let mut names: Vec<String> = outputs
            .iter()
            .map(|&(i, j)| {
                let base = columns[i].as_ref().replace('"', "");
                match naming {
                    ColumnNaming::Indices => format!("{}_{}", base, j),
                    ColumnNaming::Values | ColumnNaming::ValuesRelaxed => {
                        format!("{}_{}", base, self.categories[i][j])
                    }
                }
            })
            .collect();
        if naming == ColumnNaming::Values {
            let mut counts: HashMap<String, usize> = HashMap::new();
            for name in &names {
                *counts.entry(name.clone()).or_default() += 1;
            }
            let mut seen: HashMap<String, usize> = HashMap::new();
            for name in names.iter_mut() {
                if counts[name.as_str()] > 1 {
                    let n = seen.entry(name.clone()).or_default();
                    let suffixed = format!("{}_{}", name, n);
                    *n += 1;
                    *name = suffixed;
                }
            }
        }
        Some(names)
    }

    /// One `CASE` indicator per output column, aliased according to `column_naming`.
    pub fn transform_sql<S: AsRef<str>>(&self, columns: &[S]) -> Result<Vec<String>> {
        batch::check_width("input features", self.categories.len(), columns.len())?;
        let outputs = self.outputs();
        let exprs = outputs.iter().map(|&(i, j)| {
            let column = Expr::column(columns[i].as_ref());
            let category = &self.categories[i][j];
            let condition = if category.is_null() {
                column.is_null()
            } else {
                batch::same_text_sql(column, &category.to_string())
            };
            Expr::case_when(condition, Expr::lit(1), Expr::lit(0))
        });
        Ok(match self.aliases(columns, &outputs) {
            Some(names) => exprs
                .zip(names)
                .map(|(expr, name)| format!("{} AS {}", expr, quote_identifier(&name)))
                .collect(),
            None => exprs.map(|expr| expr.to_string()).collect(),
        })
    }
}
