//! Forest and boosting aggregation over binary trees

use memql_sql::{tournament, BinOp, Expr, Value};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::batch;
use crate::error::Result;
use crate::tree::{ClassificationTree, RegressionTree};

/// Ensemble member of a regression ensemble, stored as a nested descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model_type", content = "attributes")]
pub enum RegressorMember {
    BinaryTreeRegressor(RegressionTree),
}

impl RegressorMember {
    pub fn tree(&self) -> &RegressionTree {
        match self {
            RegressorMember::BinaryTreeRegressor(tree) => tree,
        }
    }
}

/// Ensemble member of a classification ensemble, stored as a nested descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model_type", content = "attributes")]
pub enum ClassifierMember {
    BinaryTreeClassifier(ClassificationTree),
}

impl ClassifierMember {
    pub fn tree(&self) -> &ClassificationTree {
        match self {
            ClassifierMember::BinaryTreeClassifier(tree) => tree,
        }
    }
}

fn check_not_empty<T>(trees: &[T]) -> std::result::Result<(), String> {
    if trees.is_empty() {
        Err("'trees' must contain at least one tree".to_string())
    } else {
        Ok(())
    }
}

/// All members must score the same classes in the same order.
fn check_class_layout(trees: &[ClassifierMember]) -> std::result::Result<(), String> {
    check_not_empty(trees)?;
    let first = trees[0].tree();
    for (i, member) in trees.iter().enumerate().skip(1) {
        let tree = member.tree();
        if tree.n_classes() != first.n_classes() || tree.classes() != first.classes() {
            return Err(format!(
                "tree {} does not share the class layout of tree 0",
                i
            ));
        }
    }
    Ok(())
}

fn sum_rows(trees: &[RegressorMember], row: &ArrayView1<'_, Value>) -> Result<f64> {
    let mut total = 0.0;
    for member in trees {
        total += member.tree().predict_row(row)?;
    }
    Ok(total)
}

fn sum_sql(trees: &[RegressorMember], columns: &[Expr]) -> Result<Expr> {
    let terms = trees
        .iter()
        .map(|member| member.tree().predict_sql(columns))
        .collect::<Result<Vec<_>>>()?;
    Ok(Expr::sum(terms))
}

/// Per-class expressions, one tree walk per class and member.
fn class_sums_sql(
    trees: impl Iterator<Item = ClassificationTree>,
    n_classes: usize,
    columns: &[Expr],
) -> Result<Vec<Expr>> {
    let mut per_class: Vec<Vec<Expr>> = vec![Vec::new(); n_classes];
    for tree in trees {
        for (class, expr) in tree.predict_proba_sql(columns)?.into_iter().enumerate() {
            per_class[class].push(expr);
        }
    }
    Ok(per_class.into_iter().map(Expr::sum).collect())
}

fn argmax_sql(probabilities: Vec<Expr>, first: &ClassificationTree) -> Expr {
    let candidates = probabilities
        .into_iter()
        .enumerate()
        .map(|(class, score)| (score, Expr::lit(first.class_label(class))))
        .collect();
    tournament(candidates, BinOp::Ge).unwrap_or_else(Expr::null)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForestRegressor {
    pub(crate) trees: Vec<RegressorMember>,
}

impl RandomForestRegressor {
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        check_not_empty(&self.trees)
    }

    pub fn predict(&self, x: ArrayView2<'_, Value>) -> Result<Array1<Value>> {
        let n = self.trees.len() as f64;
        batch::predict_rows(x, |row| Ok(Value::Float(sum_rows(&self.trees, &row)? / n)))
    }

    pub fn predict_sql(&self, columns: &[Expr]) -> Result<Expr> {
        Ok(sum_sql(&self.trees, columns)? / Expr::lit(self.trees.len()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XGBoostRegressor {
    pub(crate) trees: Vec<RegressorMember>,
    pub(crate) learning_rate: f64,
    pub(crate) mean: f64,
}

impl XGBoostRegressor {
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        check_not_empty(&self.trees)
    }

    pub fn predict(&self, x: ArrayView2<'_, Value>) -> Result<Array1<Value>> {
        batch::predict_rows(x, |row| {
            let total = sum_rows(&self.trees, &row)?;
            Ok(Value::Float(total * self.learning_rate + self.mean))
        })
    }

    pub fn predict_sql(&self, columns: &[Expr]) -> Result<Expr> {
        Ok(sum_sql(&self.trees, columns)? * Expr::lit(self.learning_rate) + Expr::lit(self.mean))
    }
}

/// Hard-voting forest: probabilities are vote fractions, not averaged leaf scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomForestClassifier {
    pub(crate) trees: Vec<ClassifierMember>,
}

impl RandomForestClassifier {
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        check_class_layout(&self.trees)
    }

    fn first(&self) -> &ClassificationTree {
        self.trees[0].tree()
    }

    fn proba_row(&self, row: &ArrayView1<'_, Value>) -> Result<Vec<f64>> {
        let mut votes = vec![0.0; self.first().n_classes()];
        for member in &self.trees {
            votes[batch::argmax(member.tree().leaf_scores(row)?)] += 1.0;
        }
        let n = self.trees.len() as f64;
        Ok(votes.into_iter().map(|count| count / n).collect())
    }

    pub fn predict(&self, x: ArrayView2<'_, Value>) -> Result<Array1<Value>> {
        batch::predict_rows(x, |row| {
            let proba = self.proba_row(&row)?;
            Ok(self.first().class_label(batch::argmax(&proba)))
        })
    }

    pub fn predict_proba(&self, x: ArrayView2<'_, Value>) -> Result<Array2<f64>> {
        batch::matrix_rows(x, self.first().n_classes(), |row| self.proba_row(&row))
    }

    pub fn predict_proba_sql(&self, columns: &[Expr]) -> Result<Vec<Expr>> {
        let voters = self.trees.iter().map(|member| member.tree().one_hot_leaves());
        let n = self.trees.len();
        Ok(class_sums_sql(voters, self.first().n_classes(), columns)?
            .into_iter()
            .map(|votes| votes / Expr::lit(n))
            .collect())
    }

    pub fn predict_sql(&self, columns: &[Expr]) -> Result<Expr> {
        Ok(argmax_sql(self.predict_proba_sql(columns)?, self.first()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XGBoostClassifier {
    pub(crate) trees: Vec<ClassifierMember>,
    pub(crate) learning_rate: f64,
    pub(crate) logodds: Vec<f64>,
}

impl XGBoostClassifier {
    pub(crate) fn check(&self) -> std::result::Result<(), String> {
        check_class_layout(&self.trees)?;
        let n_classes = self.first().n_classes();
        if self.logodds.len() != n_classes {
            return Err(format!(
                "'logodds' has {} entries, expected one per class ({})",
                self.logodds.len(),
                n_classes
            ));
        }
        Ok(())
    }

    fn first(&self) -> &ClassificationTree {
        self.trees[0].tree()
    }

    fn proba_row(&self, row: &ArrayView1<'_, Value>) -> Result<Vec<f64>> {
        let mut sums = vec![0.0; self.logodds.len()];
        for member in &self.trees {
            for (total, score) in sums.iter_mut().zip(member.tree().leaf_scores(row)?) {
                *total += score;
            }
        }
        let activated: Vec<f64> = self
            .logodds
            .iter()
            .zip(&sums)
            .map(|(logodds, total)| 1.0 / (1.0 + (-(logodds + self.learning_rate * total)).exp()))
            .collect();
        let norm: f64 = activated.iter().sum();
        Ok(activated.into_iter().map(|p| p / norm).collect())
    }

    pub fn predict(&self, x: ArrayView2<'_, Value>) -> Result<Array1<Value>> {
        batch::predict_rows(x, |row| {
            let proba = self.proba_row(&row)?;
            Ok(self.first().class_label(batch::argmax(&proba)))
        })
    }

    pub fn predict_proba(&self, x: ArrayView2<'_, Value>) -> Result<Array2<f64>> {
        batch::matrix_rows(x, self.logodds.len(), |row| self.proba_row(&row))
    }

    pub fn predict_proba_sql(&self, columns: &[Expr]) -> Result<Vec<Expr>> {
        let trees = self.trees.iter().map(|member| member.tree().clone());
        let activated: Vec<Expr> = class_sums_sql(trees, self.logodds.len(), columns)?
            .into_iter()
            .zip(&self.logodds)
            .map(|(total, logodds)| {
                (Expr::lit(*logodds) + Expr::lit(self.learning_rate) * total).sigmoid()
            })
            .collect();
        let norm = Expr::sum(activated.iter().cloned());
        Ok(activated
            .into_iter()
            .map(|p| p / norm.clone())
            .collect())
    }

    pub fn predict_sql(&self, columns: &[Expr]) -> Result<Expr> {
        Ok(argmax_sql(self.predict_proba_sql(columns)?, self.first()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use serde_json::json;

    fn stump(threshold: f64, left: serde_json::Value, right: serde_json::Value) -> serde_json::Value {
        json!({
            "children_left": [1, null, null],
            "children_right": [2, null, null],
            "feature": [0, null, null],
            "threshold": [threshold, null, null],
            "value": [null, left, right]
        })
    }

    fn classifier_member(threshold: f64, left: [f64; 2], right: [f64; 2]) -> serde_json::Value {
        let mut tree = stump(threshold, json!(left), json!(right));
        tree["classes"] = json!(["a", "b"]);
        json!({"model_type": "BinaryTreeClassifier", "attributes": tree})
    }

    fn forest() -> RandomForestClassifier {
        serde_json::from_value(json!({
            "trees": [
                classifier_member(1.0, [0.9, 0.1], [0.2, 0.8]),
                classifier_member(2.0, [0.7, 0.3], [0.4, 0.6]),
                classifier_member(3.0, [0.6, 0.4], [0.1, 0.9]),
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_forest_votes_are_fractions() {
        let model = forest();
        model.check().unwrap();
        // x = 2.5: tree 0 votes b, tree 1 votes b, tree 2 votes a.
        let x = array![[Value::Float(2.5)], [Value::Float(0.0)]];
        let proba = model.predict_proba(x.view()).unwrap();
        assert_relative_eq!(proba[[0, 0]], 1.0 / 3.0);
        assert_relative_eq!(proba[[0, 1]], 2.0 / 3.0);
        assert_eq!(proba.row(1).to_vec(), vec![1.0, 0.0]);
        assert_eq!(
            model.predict(x.view()).unwrap().to_vec(),
            vec![Value::from("b"), Value::from("a")]
        );
    }

    #[test]
    fn test_forest_regressor_mean() {
        let model: RandomForestRegressor = serde_json::from_value(json!({
            "trees": [
                {"model_type": "BinaryTreeRegressor", "attributes": stump(1.0, json!(1.0), json!(3.0))},
                {"model_type": "BinaryTreeRegressor", "attributes": stump(1.0, json!(2.0), json!(5.0))},
            ]
        }))
        .unwrap();
        let x = array![[Value::Float(0.0)], [Value::Float(2.0)]];
        assert_eq!(
            model.predict(x.view()).unwrap().to_vec(),
            vec![Value::Float(1.5), Value::Float(4.0)]
        );
        assert_eq!(
            model.predict_sql(&batch::columns(&["x"])).unwrap().to_string(),
            "(CASE WHEN x < 1.0 THEN 1.0 ELSE 3.0 END + CASE WHEN x < 1.0 THEN 2.0 ELSE 5.0 END) / 2"
        );
    }

    #[test]
    fn test_boosted_regressor() {
        let model: XGBoostRegressor = serde_json::from_value(json!({
            "trees": [
                {"model_type": "BinaryTreeRegressor", "attributes": stump(1.0, json!(1.0), json!(3.0))},
                {"model_type": "BinaryTreeRegressor", "attributes": stump(1.0, json!(2.0), json!(5.0))},
            ],
            "learning_rate": 0.1,
            "mean": 10.0
        }))
        .unwrap();
        let x = array![[Value::Float(2.0)]];
        let prediction = model.predict(x.view()).unwrap()[0].as_f64().unwrap();
        assert_relative_eq!(prediction, 10.8);
    }

    #[test]
    fn test_boosted_classifier_normalizes() {
        let model: XGBoostClassifier = serde_json::from_value(json!({
            "trees": [classifier_member(1.0, [0.5, -0.5], [-0.5, 0.5])],
            "learning_rate": 1.0,
            "logodds": [0.0, 0.0]
        }))
        .unwrap();
        model.check().unwrap();
        let x = array![[Value::Float(0.0)]];
        let proba = model.predict_proba(x.view()).unwrap();
        let p0 = 1.0 / (1.0 + (-0.5f64).exp());
        let p1 = 1.0 / (1.0 + 0.5f64.exp());
        assert_relative_eq!(proba[[0, 0]], p0 / (p0 + p1));
        assert_relative_eq!(proba.row(0).sum(), 1.0);
        assert_eq!(model.predict(x.view()).unwrap()[0], Value::from("a"));
    }

    #[test]
    fn test_class_layout_mismatch() {
        let mut other = classifier_member(1.0, [0.5, 0.5], [0.5, 0.5]);
        other["attributes"]["classes"] = json!(["x", "y"]);
        let model: RandomForestClassifier = serde_json::from_value(json!({
            "trees": [classifier_member(1.0, [0.9, 0.1], [0.2, 0.8]), other]
        }))
        .unwrap();
        assert!(model.check().is_err());

        let boosted: XGBoostClassifier = serde_json::from_value(json!({
            "trees": [classifier_member(1.0, [0.9, 0.1], [0.2, 0.8])],
            "learning_rate": 0.1,
            "logodds": [0.0]
        }))
        .unwrap();
        assert!(boosted.check().is_err());
    }

    #[test]
    fn test_wrong_member_type() {
        let result = serde_json::from_value::<RandomForestRegressor>(json!({
            "trees": [classifier_member(1.0, [0.9, 0.1], [0.2, 0.8])]
        }));
        assert!(result.is_err());
        let empty: RandomForestRegressor = serde_json::from_value(json!({"trees": []})).unwrap();
        assert!(empty.check().is_err());
    }
}
