//! p-norm distances to centroids, flat and bisecting

use memql_sql::{null_guard, tournament, BinOp, Expr, Value};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::batch;
use crate::error::Result;
use crate::tree::{check_acyclic, node_ids};

/// Offset added to distances before inverting them into weights.
const EPSILON: f64 = 1e-99;

fn default_p() -> u32 {
    2
}

fn check_centroids(clusters: &[Vec<f64>], p: u32) -> std::result::Result<(), String> {
    let width = clusters
        .first()
        .map(Vec::len)
        .ok_or_else(|| "'clusters' must contain at least one centroid".to_string())?;
    if width == 0 {
        return Err("centroids must have at least one coordinate".to_string());
    }
    if let Some(i) = clusters.iter().position(|c| c.len() != width) {
        return Err(format!(
            "centroid {} has {} coordinates, expected {}",
            i,
            clusters[i].len(),
            width
        ));
    }
    if p == 0 {
        return Err("'p' must be at least 1".to_string());
    }
    Ok(())
}

/// Centroid geometry shared by the flat and bisecting models.
struct Metric<'a> {
    clusters: &'a [Vec<f64>],
    p: u32,
}

impl Metric<'_> {
    fn width(&self) -> usize {
        self.clusters[0].len()
    }

    /// `sum |x - c|^p`, the un-rooted distance used for comparisons.
    fn powered(&self, row: &[f64], centroid: usize) -> f64 {
        row.iter()
            .zip(&self.clusters[centroid])
            .map(|(x, c)| (x - c).abs().powf(f64::from(self.p)))
            .sum()
    }

    fn distance(&self, row: &[f64], centroid: usize) -> f64 {
        self.powered(row, centroid).powf(1.0 / f64::from(self.p))
    }

    /// Numeric row, or `None` when a feature is NULL.
    fn read(&self, row: &ArrayView1<'_, Value>) -> Result<Option<Vec<f64>>> {
        batch::check_width("centroid coordinates", self.width(), row.len())?;
        if row.iter().any(Value::is_null) {
            return Ok(None);
        }
        batch::numeric_row(row.view()).map(Some)
    }

    fn distances(&self, x: ArrayView2<'_, Value>) -> Result<Array2<f64>> {
        let k = self.clusters.len();
        batch::matrix_rows(x, k, |row| {
            Ok(match self.read(&row)? {
                Some(values) => (0..k).map(|i| self.distance(&values, i)).collect(),
                None => vec![f64::NAN; k],
            })
        })
    }

    fn check_columns(&self, columns: &[Expr]) -> Result<()> {
        batch::check_width("centroid coordinates", self.width(), columns.len())
    }

    fn powered_sql(&self, columns: &[Expr], centroid: usize) -> Expr {
        Expr::sum(
            columns
                .iter()
                .zip(&self.clusters[centroid])
                .map(|(x, c)| (x.clone() - Expr::lit(*c)).abs().power(Expr::lit(self.p))),
        )
    }

    fn distance_sql(&self, columns: &[Expr], centroid: usize) -> Expr {
        self.powered_sql(columns, centroid)
            .power(Expr::lit(1.0 / f64::from(self.p)))
    }

    fn distances_sql(&self, columns: &[Expr]) -> Result<Vec<Expr>> {
        self.check_columns(columns)?;
        Ok((0..self.clusters.len())
            .map(|i| self.distance_sql(columns, i))
            .collect())
    }
}

/// Flat centroid model (KMeans, NearestCentroids).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clusters {
    pub(crate) clusters: Vec<Vec<f64>>,
    #[serde(default = "default_p")]
    pub(crate) p: u32,
    #[serde(default)]
    pub(crate) classes: Option<Vec<Value>>,
}

impl Clusters {
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        check_centroids(&self.clusters, self.p)?;
        match &self.classes {
            Some(classes) if classes.len() != self.clusters.len() => Err(format!(
                "'classes' has {} entries, expected one per centroid ({})",
                classes.len(),
                self.clusters.len()
            )),
            _ => Ok(()),
        }
    }

    fn metric(&self) -> Metric<'_> {
        Metric {
            clusters: &self.clusters,
            p: self.p,
        }
    }

    fn label(&self, index: usize) -> Value {
        batch::class_label(self.classes.as_deref().unwrap_or(&[]), index)
    }

    /// Nearest centroid (lowest index on ties), NULL when a feature is NULL.
    pub fn predict(&self, x: ArrayView2<'_, Value>) -> Result<Array1<Value>> {
        let metric = self.metric();
        batch::predict_rows(x, |row| {
            Ok(match metric.read(&row)? {
                Some(values) => {
                    let powered: Vec<f64> = (0..self.clusters.len())
                        .map(|i| metric.powered(&values, i))
                        .collect();
                    self.label(batch::argmin(&powered))
                }
                None => Value::Null,
            })
        })
    }

    /// Inverse-distance weights normalized per row.
    pub fn predict_proba(&self, x: ArrayView2<'_, Value>) -> Result<Array2<f64>> {
        let mut proba = self.metric().distances(x)?;
        for mut row in proba.rows_mut() {
            row.mapv_inplace(|d| 1.0 / (d + EPSILON));
            let total = row.sum();
            row.mapv_inplace(|w| w / total);
        }
        Ok(proba)
    }

    pub fn transform(&self, x: ArrayView2<'_, Value>) -> Result<Array2<f64>> {
        self.metric().distances(x)
    }

    pub fn predict_sql(&self, columns: &[Expr]) -> Result<Expr> {
        let metric = self.metric();
        metric.check_columns(columns)?;
        let candidates = (0..self.clusters.len())
            .map(|i| (metric.powered_sql(columns, i), Expr::lit(self.label(i))))
            .collect();
        let winner = tournament(candidates, BinOp::Le).unwrap_or_else(Expr::null);
        Ok(null_guard(columns.iter().cloned(), winner))
    }

    pub fn predict_proba_sql(&self, columns: &[Expr]) -> Result<Vec<Expr>> {
        let distances = self.metric().distances_sql(columns)?;
        let zero = || Expr::lit(0);
        let total = Expr::sum(distances.iter().map(|d| Expr::lit(1) / d.clone()));
        // Centroids sitting on the row share the whole weight evenly.
        let coincident = Expr::sum(
            distances
                .iter()
                .map(|d| Expr::case_when(d.clone().equals(zero()), Expr::lit(1), Expr::lit(0))),
        );
        Ok(distances
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let mut branches = vec![(
                    d.clone().equals(zero()),
                    Expr::lit(1.0) / coincident.clone(),
                )];
                let others: Vec<Expr> = distances
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, other)| other.clone().equals(zero()))
                    .collect();
                if !others.is_empty() {
                    branches.push((Expr::any(others), Expr::lit(0.0)));
                }
                Expr::case(branches, Expr::lit(1) / d.clone() / total.clone())
            })
            .collect())
    }

    pub fn transform_sql(&self, columns: &[Expr]) -> Result<Vec<Expr>> {
        self.metric().distances_sql(columns)
    }
}

/// Hierarchical centroid model; node ids are centroid ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BisectingKMeans {
    pub(crate) clusters: Vec<Vec<f64>>,
    #[serde(deserialize_with = "node_ids")]
    pub(crate) left_child: Vec<Option<usize>>,
    #[serde(deserialize_with = "node_ids")]
    pub(crate) right_child: Vec<Option<usize>>,
    #[serde(default = "default_p")]
    pub(crate) p: u32,
}

impl BisectingKMeans {
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        check_centroids(&self.clusters, self.p)?;
        let k = self.clusters.len();
        for (name, len) in [
            ("left_child", self.left_child.len()),
            ("right_child", self.right_child.len()),
        ] {
            if len != k {
                return Err(format!("'{}' has {} entries, expected {}", name, len, k));
            }
        }
        for node in 0..k {
            match (self.left_child[node], self.right_child[node]) {
                (None, None) => {}
                (Some(left), Some(right)) if left < k && right < k => {}
                (Some(_), Some(_)) => {
                    return Err(format!("node {} has a child outside 0..{}", node, k))
                }
                _ => return Err(format!("node {} has exactly one child", node)),
            }
        }
        check_acyclic(k, |node| self.children(node))
    }

    fn children(&self, node: usize) -> Option<(usize, usize)> {
        self.left_child[node].zip(self.right_child[node])
    }

    fn metric(&self) -> Metric<'_> {
        Metric {
            clusters: &self.clusters,
            p: self.p,
        }
    }

    /// Leaf cluster reached by descending toward the closer child centroid.
    pub fn predict(&self, x: ArrayView2<'_, Value>) -> Result<Array1<Value>> {
        let metric = self.metric();
        batch::predict_rows(x, |row| {
            let Some(values) = metric.read(&row)? else {
                return Ok(Value::Null);
            };
            let mut node = 0;
            while let Some((left, right)) = self.children(node) {
                node = if metric.powered(&values, left) < metric.powered(&values, right) {
                    left
                } else {
                    right
                };
            }
            Ok(Value::from(node))
        })
    }

    pub fn transform(&self, x: ArrayView2<'_, Value>) -> Result<Array2<f64>> {
        self.metric().distances(x)
    }

    fn descent_sql(&self, metric: &Metric<'_>, columns: &[Expr], node: usize) -> Expr {
        match self.children(node) {
            None => Expr::lit(node),
            Some((left, right)) => Expr::case_when(
                metric
                    .powered_sql(columns, left)
                    .less_than(metric.powered_sql(columns, right)),
                self.descent_sql(metric, columns, left),
                self.descent_sql(metric, columns, right),
            ),
        }
    }

    pub fn predict_sql(&self, columns: &[Expr]) -> Result<Expr> {
        let metric = self.metric();
        metric.check_columns(columns)?;
        let descent = self.descent_sql(&metric, columns, 0);
        Ok(null_guard(columns.iter().cloned(), descent))
    }

    pub fn transform_sql(&self, columns: &[Expr]) -> Result<Vec<Expr>> {
        self.metric().distances_sql(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use serde_json::json;

    fn kmeans() -> Clusters {
        let model: Clusters =
            serde_json::from_value(json!({"clusters": [[0.0, 0.0], [10.0, 10.0]]})).unwrap();
        model.check().unwrap();
        model
    }

    #[test]
    fn test_nearest_centroid() {
        let model = kmeans();
        let x = array![
            [Value::Int(1), Value::Int(1)],
            [Value::Int(9), Value::Int(8)],
            [Value::Null, Value::Int(8)],
        ];
        assert_eq!(
            model.predict(x.view()).unwrap().to_vec(),
            vec![Value::Int(0), Value::Int(1), Value::Null]
        );
        let proba = model.predict_proba(x.view()).unwrap();
        assert!(proba[[0, 0]] > proba[[0, 1]]);
        assert_relative_eq!(proba.row(1).sum(), 1.0);
    }

    #[test]
    fn test_ties_go_to_lowest_index() {
        let model = kmeans();
        let x = array![[Value::Int(5), Value::Int(5)]];
        assert_eq!(model.predict(x.view()).unwrap()[0], Value::Int(0));
    }

    #[test]
    fn test_transform_distances() {
        let model: Clusters = serde_json::from_value(json!({
            "clusters": [[0.0, 0.0], [3.0, 4.0]],
            "p": 1,
            "classes": ["near", "far"]
        }))
        .unwrap();
        let x = array![[Value::Int(0), Value::Int(0)]];
        assert_eq!(model.transform(x.view()).unwrap().row(0).to_vec(), vec![0.0, 7.0]);
        assert_eq!(model.predict(x.view()).unwrap()[0], Value::from("near"));

        let euclidean = kmeans();
        let x = array![[Value::Int(3), Value::Int(4)]];
        assert_relative_eq!(euclidean.transform(x.view()).unwrap()[[0, 0]], 5.0);
    }

    #[test]
    fn test_exact_centroid_gets_full_weight() {
        let model = kmeans();
        let x = array![[Value::Int(0), Value::Int(0)]];
        let proba = model.predict_proba(x.view()).unwrap();
        assert_relative_eq!(proba[[0, 0]], 1.0);
        assert_relative_eq!(proba[[0, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_coincident_centroids_share_weight() {
        let model: Clusters =
            serde_json::from_value(json!({"clusters": [[0.0], [0.0], [5.0]]})).unwrap();
        model.check().unwrap();
        let x = array![[Value::Float(0.0)]];
        let proba = model.predict_proba(x.view()).unwrap();
        assert_relative_eq!(proba[[0, 0]], 0.5);
        assert_relative_eq!(proba[[0, 1]], 0.5);
        assert_relative_eq!(proba[[0, 2]], 0.0, epsilon = 1e-12);

        let sql = model.predict_proba_sql(&batch::columns(&["a"])).unwrap();
        assert!(sql[0]
            .to_string()
            .contains("THEN 1.0 / (CASE WHEN POWER(POWER(ABS(a - 0.0), 2), 0.5) = 0 THEN 1 ELSE 0 END + "));
    }

    #[test]
    fn test_large_p_is_not_truncated() {
        let model: Clusters =
            serde_json::from_value(json!({"clusters": [[0.0], [3.0]], "p": 3_000_000_000u64})).unwrap();
        model.check().unwrap();
        let x = array![[Value::Float(1.0)]];
        assert_eq!(model.predict(x.view()).unwrap()[0], Value::Int(0));
    }

    #[test]
    fn test_predict_sql() {
        let sql = kmeans().predict_sql(&batch::columns(&["a", "b"])).unwrap().to_string();
        assert_eq!(
            sql,
            "CASE WHEN a IS NULL OR b IS NULL THEN NULL \
             WHEN POWER(ABS(a - 0.0), 2) + POWER(ABS(b - 0.0), 2) <= POWER(ABS(a - 10.0), 2) + POWER(ABS(b - 10.0), 2) THEN 0 \
             ELSE 1 END"
        );
    }

    #[test]
    fn test_proba_sql_guards_zero_distance() {
        let sql = kmeans().predict_proba_sql(&batch::columns(&["a", "b"])).unwrap();
        assert_eq!(sql.len(), 2);
        let first = sql[0].to_string();
        assert!(first.starts_with(
            "CASE WHEN POWER(POWER(ABS(a - 0.0), 2) + POWER(ABS(b - 0.0), 2), 0.5) = 0 \
             THEN 1.0 / (CASE WHEN POWER("
        ));
        assert!(first.contains("THEN 0.0 ELSE 1 / POWER("));
    }

    #[test]
    fn test_rejects_bad_centroids() {
        let ragged: Clusters =
            serde_json::from_value(json!({"clusters": [[0.0, 0.0], [1.0]]})).unwrap();
        assert!(ragged.check().is_err());
        let empty: Clusters = serde_json::from_value(json!({"clusters": []})).unwrap();
        assert!(empty.check().is_err());
        let zero_p: Clusters =
            serde_json::from_value(json!({"clusters": [[0.0]], "p": 0})).unwrap();
        assert!(zero_p.check().is_err());
        let labels: Clusters =
            serde_json::from_value(json!({"clusters": [[0.0]], "classes": ["a", "b"]})).unwrap();
        assert!(labels.check().is_err());
    }

    fn bisecting() -> BisectingKMeans {
        let model: BisectingKMeans = serde_json::from_value(json!({
            "clusters": [[5.0, 5.0], [0.0, 0.0], [10.0, 10.0], [8.0, 8.0], [12.0, 12.0]],
            "left_child": [1, -1, 3, -1, -1],
            "right_child": [2, -1, 4, -1, -1]
        }))
        .unwrap();
        model.check().unwrap();
        model
    }

    #[test]
    fn test_bisecting_descent() {
        let model = bisecting();
        let x = array![
            [Value::Int(1), Value::Int(1)],
            [Value::Int(7), Value::Int(7)],
            [Value::Int(13), Value::Int(13)],
            [Value::Int(1), Value::Null],
        ];
        assert_eq!(
            model.predict(x.view()).unwrap().to_vec(),
            vec![Value::Int(1), Value::Int(3), Value::Int(4), Value::Null]
        );
        assert_eq!(model.transform(x.view()).unwrap().ncols(), 5);
    }

    #[test]
    fn test_bisecting_sql_shape() {
        let sql = bisecting().predict_sql(&batch::columns(&["a", "b"])).unwrap().to_string();
        assert!(sql.starts_with("CASE WHEN a IS NULL OR b IS NULL THEN NULL WHEN "));
        assert!(sql.ends_with("THEN 3 ELSE 4 END END"));
    }

    #[test]
    fn test_bisecting_rejects_single_child() {
        let model: BisectingKMeans = serde_json::from_value(json!({
            "clusters": [[0.0], [1.0]],
            "left_child": [1, null],
            "right_child": [null, null]
        }))
        .unwrap();
        assert!(model.check().is_err());
    }
}
