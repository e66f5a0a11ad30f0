//! Flat binary decision trees
//!
//! Trees arrive as parallel arrays indexed by node id (`children_left`,
//! `children_right`, `feature`, `threshold`, `value`) and are compiled into a
//! node vector once, at deserialization time. Node 0 is the root and a node
//! is a leaf when both child ids are equal (typically both absent).

use memql_sql::{Expr, Value};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Deserializer, Serialize};

use crate::batch;
use crate::error::{ModelError, Result};

/// Split threshold: numeric thresholds branch left on `x < t`, textual ones when
/// the text form of `x` equals `t`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Node<L> {
    Branch {
        left: usize,
        right: usize,
        feature: usize,
        threshold: Threshold,
    },
    Leaf(L),
}

/// Reads child/feature id arrays where `null` and negative ids mean "none".
pub(crate) fn node_ids<'de, D>(deserializer: D) -> std::result::Result<Vec<Option<usize>>, D::Error>
where
    D: Deserializer<'de>,
{
    let ids = Vec::<Option<i64>>::deserialize(deserializer)?;
    Ok(ids
        .into_iter()
        .map(|id| id.and_then(|id| usize::try_from(id).ok()))
        .collect())
}

/// Rejects node graphs where a node can be reached twice from the root.
///
/// `children` returns the child pair of an internal node and `None` for a leaf.
pub(crate) fn check_acyclic(
    node_count: usize,
    children: impl Fn(usize) -> Option<(usize, usize)>,
) -> std::result::Result<(), String> {
    let mut seen = vec![false; node_count];
    let mut stack = vec![0];
    while let Some(node) = stack.pop() {
        if std::mem::replace(&mut seen[node], true) {
            return Err(format!("node {} is reachable more than once", node));
        }
        if let Some((left, right)) = children(node) {
            stack.push(right);
            stack.push(left);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RawTree<V> {
    #[serde(deserialize_with = "node_ids")]
    children_left: Vec<Option<usize>>,
    #[serde(deserialize_with = "node_ids")]
    children_right: Vec<Option<usize>>,
    #[serde(deserialize_with = "node_ids")]
    feature: Vec<Option<usize>>,
    threshold: Vec<Option<Threshold>>,
    value: Vec<Option<V>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    classes: Option<Vec<Value>>,
}

impl<V: Clone> RawTree<V> {
    fn compile(&self) -> std::result::Result<Vec<Node<V>>, String> {
        let n = self.children_left.len();
        if n == 0 {
            return Err("a tree needs at least one node".to_string());
        }
        for (name, len) in [
            ("children_right", self.children_right.len()),
            ("feature", self.feature.len()),
            ("threshold", self.threshold.len()),
            ("value", self.value.len()),
        ] {
            if len != n {
                return Err(format!("'{}' has {} entries, expected {}", name, len, n));
            }
        }

        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let node = match (self.children_left[i], self.children_right[i]) {
                (left, right) if left == right => {
                    let value = self.value[i]
                        .clone()
                        .ok_or_else(|| format!("leaf {} has no value", i))?;
                    Node::Leaf(value)
                }
                (Some(left), Some(right)) => {
                    if left >= n || right >= n {
                        return Err(format!("node {} has a child outside 0..{}", i, n));
                    }
                    let feature = self.feature[i]
                        .ok_or_else(|| format!("node {} has children but no feature", i))?;
                    let threshold = self.threshold[i]
                        .clone()
                        .ok_or_else(|| format!("node {} has children but no threshold", i))?;
                    Node::Branch {
                        left,
                        right,
                        feature,
                        threshold,
                    }
                }
                _ => return Err(format!("node {} has exactly one child", i)),
            };
            nodes.push(node);
        }

        check_acyclic(n, |i| match &nodes[i] {
            Node::Branch { left, right, .. } => Some((*left, *right)),
            Node::Leaf(_) => None,
        })?;
        Ok(nodes)
    }
}

fn goes_left(value: &Value, threshold: &Threshold) -> Result<bool> {
    if value.is_null() {
        return Ok(false);
    }
    match threshold {
        Threshold::Text(text) => Ok(batch::same_text(value, text)),
        Threshold::Number(limit) => Ok(batch::numeric(value)? < *limit),
    }
}

fn descend<'t, L>(nodes: &'t [Node<L>], row: &ArrayView1<'_, Value>) -> Result<&'t L> {
    let mut index = 0;
    loop {
        match &nodes[index] {
            Node::Leaf(value) => return Ok(value),
            Node::Branch {
                left,
                right,
                feature,
                threshold,
            } => {
                let value = batch::feature(row, *feature)?;
                index = if goes_left(value, threshold)? {
                    *left
                } else {
                    *right
                };
            }
        }
    }
}

fn render<L>(
    nodes: &[Node<L>],
    index: usize,
    columns: &[Expr],
    leaf: &impl Fn(&L) -> Expr,
) -> Result<Expr> {
    match &nodes[index] {
        Node::Leaf(value) => Ok(leaf(value)),
        Node::Branch {
            left,
            right,
            feature,
            threshold,
        } => {
            let column = columns.get(*feature).cloned().ok_or(ModelError::Index {
                index: *feature,
                width: columns.len(),
            })?;
            let condition = match threshold {
                Threshold::Text(text) => batch::same_text_sql(column, text),
                Threshold::Number(limit) => column.less_than(Expr::lit(*limit)),
            };
            Ok(Expr::case_when(
                condition,
                render(nodes, *left, columns, leaf)?,
                render(nodes, *right, columns, leaf)?,
            ))
        }
    }
}

/// Decision tree with one number per leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTree<f64>", into = "RawTree<f64>")]
pub struct RegressionTree {
    raw: RawTree<f64>,
    nodes: Vec<Node<f64>>,
}

impl TryFrom<RawTree<f64>> for RegressionTree {
    type Error = String;

    fn try_from(raw: RawTree<f64>) -> std::result::Result<Self, String> {
        let nodes = raw.compile()?;
        Ok(Self { raw, nodes })
    }
}

impl From<RegressionTree> for RawTree<f64> {
    fn from(tree: RegressionTree) -> Self {
        tree.raw
    }
}

impl RegressionTree {
    pub fn predict_row(&self, row: &ArrayView1<'_, Value>) -> Result<f64> {
        descend(&self.nodes, row).copied()
    }

    pub fn predict(&self, x: ArrayView2<'_, Value>) -> Result<Array1<Value>> {
        batch::predict_rows(x, |row| self.predict_row(&row).map(Value::Float))
    }

    pub fn predict_sql(&self, columns: &[Expr]) -> Result<Expr> {
        render(&self.nodes, 0, columns, &|value: &f64| Expr::lit(*value))
    }
}

/// Decision tree with a class-score vector per leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTree<Vec<f64>>", into = "RawTree<Vec<f64>>")]
pub struct ClassificationTree {
    raw: RawTree<Vec<f64>>,
    nodes: Vec<Node<Vec<f64>>>,
    n_classes: usize,
}

impl TryFrom<RawTree<Vec<f64>>> for ClassificationTree {
    type Error = String;

    fn try_from(mut raw: RawTree<Vec<f64>>) -> std::result::Result<Self, String> {
        let nodes = raw.compile()?;
        let mut widths = nodes.iter().filter_map(|node| match node {
            Node::Leaf(scores) => Some(scores.len()),
            Node::Branch { .. } => None,
        });
        let n_classes = widths.next().unwrap_or(0);
        if n_classes == 0 {
            return Err("leaf values must hold at least one class score".to_string());
        }
        if widths.any(|width| width != n_classes) {
            return Err("all leaf values must have the same number of classes".to_string());
        }
        let classes = raw.classes.take().unwrap_or_default();
        if !classes.is_empty() && classes.len() != n_classes {
            return Err(format!(
                "'classes' has {} entries but leaves score {} classes",
                classes.len(),
                n_classes
            ));
        }
        raw.classes = Some(classes);
        Ok(Self {
            raw,
            nodes,
            n_classes,
        })
    }
}

impl From<ClassificationTree> for RawTree<Vec<f64>> {
    fn from(tree: ClassificationTree) -> Self {
        tree.raw
    }
}

impl ClassificationTree {
    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// Class labels; empty when classes are identified by index.
    pub fn classes(&self) -> &[Value] {
        self.raw.classes.as_deref().unwrap_or(&[])
    }

    pub fn class_label(&self, index: usize) -> Value {
        batch::class_label(self.classes(), index)
    }

    /// Raw score vector of the leaf reached by `row`.
    pub fn leaf_scores(&self, row: &ArrayView1<'_, Value>) -> Result<&[f64]> {
        descend(&self.nodes, row).map(Vec::as_slice)
    }

    pub fn predict_row(&self, row: &ArrayView1<'_, Value>) -> Result<Value> {
        let scores = self.leaf_scores(row)?;
        Ok(self.class_label(batch::argmax(scores)))
    }

    pub fn predict(&self, x: ArrayView2<'_, Value>) -> Result<Array1<Value>> {
        batch::predict_rows(x, |row| self.predict_row(&row))
    }

    pub fn predict_proba(&self, x: ArrayView2<'_, Value>) -> Result<Array2<f64>> {
        batch::matrix_rows(x, self.n_classes, |row| {
            self.leaf_scores(&row).map(<[f64]>::to_vec)
        })
    }

    pub fn predict_sql(&self, columns: &[Expr]) -> Result<Expr> {
        render(&self.nodes, 0, columns, &|scores: &Vec<f64>| {
            Expr::lit(self.class_label(batch::argmax(scores)))
        })
    }

    /// One expression per class, each walking the whole tree.
    pub fn predict_proba_sql(&self, columns: &[Expr]) -> Result<Vec<Expr>> {
        (0..self.n_classes)
            .map(|class| {
                render(&self.nodes, 0, columns, &|scores: &Vec<f64>| {
                    Expr::lit(scores[class])
                })
            })
            .collect()
    }

    /// Same tree with every leaf replaced by a one-hot vote for its arg-max class.
    pub fn one_hot_leaves(&self) -> ClassificationTree {
        let vote = |scores: &Vec<f64>| {
            let winner = batch::argmax(scores);
            (0..scores.len())
                .map(|class| if class == winner { 1.0 } else { 0.0 })
                .collect::<Vec<f64>>()
        };
        let mut raw = self.raw.clone();
        for (slot, node) in raw.value.iter_mut().zip(&self.nodes) {
            if let Node::Leaf(scores) = node {
                *slot = Some(vote(scores));
            }
        }
        let nodes = self
            .nodes
            .iter()
            .map(|node| match node {
                Node::Leaf(scores) => Node::Leaf(vote(scores)),
                Node::Branch {
                    left,
                    right,
                    feature,
                    threshold,
                } => Node::Branch {
                    left: *left,
                    right: *right,
                    feature: *feature,
                    threshold: threshold.clone(),
                },
            })
            .collect();
        ClassificationTree {
            raw,
            nodes,
            n_classes: self.n_classes,
        }
    }
}
