//! Validating model descriptor and operation dispatch

use std::fmt;

use memql_sql::{Expr, Value};
use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use crate::batch;
use crate::distance::{BisectingKMeans, Clusters};
use crate::ensemble::{RandomForestClassifier, RandomForestRegressor, XGBoostClassifier, XGBoostRegressor};
use crate::error::{ModelError, Result};
use crate::family::{ModelType, Operation};
use crate::linear::{Linear, Link};
use crate::rotation::{rotate_loadings, RotationOptions};
use crate::transform::{Normalizer, OneHotEncoder, Pca, Svd};
use crate::tree::{ClassificationTree, RegressionTree};

/// Raw parameter bag, keyed by attribute name.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Typed parameters, one variant per family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model_type", content = "attributes")]
pub enum Model {
    BinaryTreeRegressor(RegressionTree),
    BinaryTreeClassifier(ClassificationTree),
    RandomForestRegressor(RandomForestRegressor),
    RandomForestClassifier(RandomForestClassifier),
    XGBoostRegressor(XGBoostRegressor),
    XGBoostClassifier(XGBoostClassifier),
    LinearRegression(Linear),
    LinearSVR(Linear),
    LogisticRegression(Linear),
    LinearSVC(Linear),
    KMeans(Clusters),
    NearestCentroids(Clusters),
    BisectingKMeans(BisectingKMeans),
    #[serde(rename = "PCA")]
    Pca(Pca),
    #[serde(rename = "SVD")]
    Svd(Svd),
    Normalizer(Normalizer),
    OneHotEncoder(OneHotEncoder),
}

impl Model {
    pub fn model_type(&self) -> ModelType {
        match self {
            Model::BinaryTreeRegressor(_) => ModelType::BinaryTreeRegressor,
            Model::BinaryTreeClassifier(_) => ModelType::BinaryTreeClassifier,
            Model::RandomForestRegressor(_) => ModelType::RandomForestRegressor,
            Model::RandomForestClassifier(_) => ModelType::RandomForestClassifier,
            Model::XGBoostRegressor(_) => ModelType::XGBoostRegressor,
            Model::XGBoostClassifier(_) => ModelType::XGBoostClassifier,
            Model::LinearRegression(_) => ModelType::LinearRegression,
            Model::LinearSVR(_) => ModelType::LinearSVR,
            Model::LogisticRegression(_) => ModelType::LogisticRegression,
            Model::LinearSVC(_) => ModelType::LinearSVC,
            Model::KMeans(_) => ModelType::KMeans,
            Model::NearestCentroids(_) => ModelType::NearestCentroids,
            Model::BisectingKMeans(_) => ModelType::BisectingKMeans,
            Model::Pca(_) => ModelType::Pca,
            Model::Svd(_) => ModelType::Svd,
            Model::Normalizer(_) => ModelType::Normalizer,
            Model::OneHotEncoder(_) => ModelType::OneHotEncoder,
        }
    }

    /// Cross-field checks that serde cannot express.
    fn check(&self) -> std::result::Result<(), String> {
        match self {
            // Tree layouts are checked while deserializing.
            Model::BinaryTreeRegressor(_) | Model::BinaryTreeClassifier(_) => Ok(()),
            Model::RandomForestRegressor(model) => model.check(),
            Model::RandomForestClassifier(model) => model.check(),
            Model::XGBoostRegressor(model) => model.check(),
            Model::XGBoostClassifier(model) => model.check(),
            Model::LinearRegression(_)
            | Model::LinearSVR(_)
            | Model::LogisticRegression(_)
            | Model::LinearSVC(_) => Ok(()),
            Model::KMeans(model) | Model::NearestCentroids(model) => model.check(),
            Model::BisectingKMeans(model) => model.check(),
            Model::Pca(model) => model.check(),
            Model::Svd(model) => model.check(),
            Model::Normalizer(model) => model.check(),
            Model::OneHotEncoder(model) => model.check(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawDescriptor {
    model_type: String,
    #[serde(default)]
    attributes: Attributes,
}

/// A validated model: typed parameters, their normalized snapshot and a summary.
///
/// Built from a family tag and a parameter bag. The snapshot never changes in
/// place; [`ModelDescriptor::update`] merges new fields and rebuilds the whole
/// descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDescriptor", into = "RawDescriptor")]
pub struct ModelDescriptor {
    model: Model,
    attributes: Attributes,
    summary: String,
}

impl TryFrom<RawDescriptor> for ModelDescriptor {
    type Error = ModelError;

    fn try_from(raw: RawDescriptor) -> Result<Self> {
        Self::from_attributes(&raw.model_type, raw.attributes)
    }
}

impl From<ModelDescriptor> for RawDescriptor {
    fn from(descriptor: ModelDescriptor) -> Self {
        RawDescriptor {
            model_type: descriptor.model_type().as_str().to_string(),
            attributes: descriptor.attributes,
        }
    }
}

fn summarize(model_type: ModelType, attributes: &Attributes) -> String {
    let mut summary = format!("<{}>", model_type);
    for (key, value) in attributes {
        match (key.as_str(), value) {
            ("trees", serde_json::Value::Array(trees)) => {
                summary.push_str(&format!("\n\nntrees = {}", trees.len()));
            }
            _ => summary.push_str(&format!("\n\n{} = {}", key, value)),
        }
    }
    summary
}

/// Collects keys of `raw` missing from `kept`, descending into nested
/// objects and arrays of objects such as ensemble members.
fn ignored_keys(raw: &Attributes, kept: &Attributes, prefix: &str, out: &mut Vec<String>) {
    for (key, value) in raw {
        let Some(snapshot) = kept.get(key) else {
            out.push(format!("{}{}", prefix, key));
            continue;
        };
        match (value, snapshot) {
            (serde_json::Value::Object(raw), serde_json::Value::Object(kept)) => {
                ignored_keys(raw, kept, &format!("{}{}.", prefix, key), out);
            }
            (serde_json::Value::Array(raw), serde_json::Value::Array(kept)) => {
                for (i, pair) in raw.iter().zip(kept).enumerate() {
                    if let (serde_json::Value::Object(raw), serde_json::Value::Object(kept)) = pair {
                        ignored_keys(raw, kept, &format!("{}{}[{}].", prefix, key, i), out);
                    }
                }
            }
            _ => {}
        }
    }
}

impl ModelDescriptor {
    /// Builds a descriptor from a family tag and a JSON object of attributes.
    pub fn new(model_type: &str, attributes: serde_json::Value) -> Result<Self> {
        match attributes {
            serde_json::Value::Object(attributes) => Self::from_attributes(model_type, attributes),
            other => Err(ModelError::validation(
                model_type,
                format!("attributes must be an object, got {}", other),
            )),
        }
    }

    pub fn from_attributes(model_type: &str, attributes: Attributes) -> Result<Self> {
        let tag: ModelType = model_type
            .parse()
            .map_err(|message: String| ModelError::validation(model_type, message))?;
        let raw = attributes.clone();
        let model: Model = serde_json::from_value(json!({
            "model_type": tag.as_str(),
            "attributes": attributes,
        }))
        .map_err(|e| ModelError::validation(tag.as_str(), e.to_string()))?;

        let descriptor = Self::from_model(model)?;
        let mut ignored = Vec::new();
        ignored_keys(&raw, &descriptor.attributes, "", &mut ignored);
        for key in &ignored {
            warn!("Ignoring unknown attribute '{}' for {}", key, tag);
        }
        Ok(descriptor)
    }

    /// Validates typed parameters and takes their snapshot.
    pub fn from_model(model: Model) -> Result<Self> {
        let model_type = model.model_type();
        model
            .check()
            .map_err(|message| ModelError::validation(model_type.as_str(), message))?;
        let attributes = match serde_json::to_value(&model) {
            Ok(serde_json::Value::Object(mut tagged)) => match tagged.remove("attributes") {
                Some(serde_json::Value::Object(attributes)) => attributes,
                _ => Attributes::new(),
            },
            Ok(_) => Attributes::new(),
            Err(e) => return Err(ModelError::validation(model_type.as_str(), e.to_string())),
        };
        let summary = summarize(model_type, &attributes);
        debug!("Built {} descriptor with {} attributes", model_type, attributes.len());
        Ok(Self {
            model,
            attributes,
            summary,
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_type(&self) -> ModelType {
        self.model.model_type()
    }

    /// Normalized parameter snapshot, defaults filled in.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    /// Merges `partial` over the current attributes and rebuilds the descriptor.
    ///
    /// On failure the descriptor is left unchanged.
    pub fn update(&mut self, partial: serde_json::Value) -> Result<()> {
        let model_type = self.model_type();
        let serde_json::Value::Object(partial) = partial else {
            return Err(ModelError::validation(
                model_type.as_str(),
                "attributes must be an object",
            ));
        };
        let changed: Vec<&String> = partial.keys().collect();
        debug!("Updating {} attributes {:?}", model_type, changed);
        let mut merged = self.attributes.clone();
        merged.extend(partial);
        *self = Self::from_attributes(model_type.as_str(), merged)?;
        Ok(())
    }

    /// SHA-256 of the canonical `{model_type, attributes}` JSON.
    pub fn fingerprint(&self) -> String {
        let canonical = json!({
            "model_type": self.model_type().as_str(),
            "attributes": self.attributes,
        })
        .to_string();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn unsupported(&self, operation: Operation) -> ModelError {
        ModelError::UnsupportedOperation {
            model_type: self.model_type(),
            operation,
        }
    }

    /// Fails unless the family's support matrix lists `operation`.
    fn require(&self, operation: Operation) -> Result<()> {
        if self.model_type().supports(operation) {
            Ok(())
        } else {
            Err(self.unsupported(operation))
        }
    }

    pub fn predict(&self, x: ArrayView2<'_, Value>) -> Result<Array1<Value>> {
        trace!("{} predict on {} rows", self.model_type(), x.nrows());
        self.require(Operation::Predict)?;
        match &self.model {
            Model::BinaryTreeRegressor(model) => model.predict(x),
            Model::BinaryTreeClassifier(model) => model.predict(x),
            Model::RandomForestRegressor(model) => model.predict(x),
            Model::RandomForestClassifier(model) => model.predict(x),
            Model::XGBoostRegressor(model) => model.predict(x),
            Model::XGBoostClassifier(model) => model.predict(x),
            Model::LinearRegression(model) | Model::LinearSVR(model) => {
                model.predict(x, Link::Identity)
            }
            Model::LogisticRegression(model) | Model::LinearSVC(model) => {
                model.predict(x, Link::Logistic)
            }
            Model::KMeans(model) | Model::NearestCentroids(model) => model.predict(x),
            Model::BisectingKMeans(model) => model.predict(x),
            _ => Err(self.unsupported(Operation::Predict)),
        }
    }

    /// Rows x classes probabilities.
    pub fn predict_proba(&self, x: ArrayView2<'_, Value>) -> Result<Array2<f64>> {
        trace!("{} predict_proba on {} rows", self.model_type(), x.nrows());
        self.require(Operation::PredictProba)?;
        match &self.model {
            Model::BinaryTreeClassifier(model) => model.predict_proba(x),
            Model::RandomForestClassifier(model) => model.predict_proba(x),
            Model::XGBoostClassifier(model) => model.predict_proba(x),
            Model::LogisticRegression(model) | Model::LinearSVC(model) => model.predict_proba(x),
            Model::KMeans(model) | Model::NearestCentroids(model) => model.predict_proba(x),
            _ => Err(self.unsupported(Operation::PredictProba)),
        }
    }

    pub fn transform(&self, x: ArrayView2<'_, Value>) -> Result<Array2<f64>> {
        trace!("{} transform on {} rows", self.model_type(), x.nrows());
        self.require(Operation::Transform)?;
        match &self.model {
            Model::KMeans(model) | Model::NearestCentroids(model) => model.transform(x),
            Model::BisectingKMeans(model) => model.transform(x),
            Model::Pca(model) => model.transform(x),
            Model::Svd(model) => model.transform(x),
            Model::Normalizer(model) => model.transform(x),
            Model::OneHotEncoder(model) => model.transform(x),
            _ => Err(self.unsupported(Operation::Transform)),
        }
    }

    /// Single SQL expression computing `predict` over the given columns.
    pub fn predict_sql<S: AsRef<str>>(&self, columns: &[S]) -> Result<String> {
        self.require(Operation::PredictSql)?;
        let columns = batch::columns(columns);
        let expr: Expr = match &self.model {
            Model::BinaryTreeRegressor(model) => model.predict_sql(&columns)?,
            Model::BinaryTreeClassifier(model) => model.predict_sql(&columns)?,
            Model::RandomForestRegressor(model) => model.predict_sql(&columns)?,
            Model::RandomForestClassifier(model) => model.predict_sql(&columns)?,
            Model::XGBoostRegressor(model) => model.predict_sql(&columns)?,
            Model::XGBoostClassifier(model) => model.predict_sql(&columns)?,
            Model::LinearRegression(model) | Model::LinearSVR(model) => {
                model.predict_sql(&columns, Link::Identity)?
            }
            Model::LogisticRegression(model) | Model::LinearSVC(model) => {
                model.predict_sql(&columns, Link::Logistic)?
            }
            Model::KMeans(model) | Model::NearestCentroids(model) => model.predict_sql(&columns)?,
            Model::BisectingKMeans(model) => model.predict_sql(&columns)?,
            _ => return Err(self.unsupported(Operation::PredictSql)),
        };
        let sql = expr.to_string();
        trace!("{} predict_sql generated {} bytes", self.model_type(), sql.len());
        Ok(sql)
    }

    /// One SQL expression per class.
    pub fn predict_proba_sql<S: AsRef<str>>(&self, columns: &[S]) -> Result<Vec<String>> {
        self.require(Operation::PredictProbaSql)?;
        let columns = batch::columns(columns);
        let exprs = match &self.model {
            Model::BinaryTreeClassifier(model) => model.predict_proba_sql(&columns)?,
            Model::RandomForestClassifier(model) => model.predict_proba_sql(&columns)?,
            Model::XGBoostClassifier(model) => model.predict_proba_sql(&columns)?,
            Model::LogisticRegression(model) | Model::LinearSVC(model) => {
                model.predict_proba_sql(&columns)?
            }
            Model::KMeans(model) | Model::NearestCentroids(model) => {
                model.predict_proba_sql(&columns)?
            }
            _ => return Err(self.unsupported(Operation::PredictProbaSql)),
        };
        Ok(exprs.iter().map(ToString::to_string).collect())
    }

    /// One SQL expression per output column, flattened across input features.
    pub fn transform_sql<S: AsRef<str>>(&self, columns: &[S]) -> Result<Vec<String>> {
        self.require(Operation::TransformSql)?;
        let exprs = match &self.model {
            Model::OneHotEncoder(model) => return model.transform_sql(columns),
            Model::KMeans(model) | Model::NearestCentroids(model) => {
                model.transform_sql(&batch::columns(columns))?
            }
            Model::BisectingKMeans(model) => model.transform_sql(&batch::columns(columns))?,
            Model::Pca(model) => model.transform_sql(&batch::columns(columns))?,
            Model::Svd(model) => model.transform_sql(&batch::columns(columns))?,
            Model::Normalizer(model) => model.transform_sql(&batch::columns(columns))?,
            _ => return Err(self.unsupported(Operation::TransformSql)),
        };
        Ok(exprs.iter().map(ToString::to_string).collect())
    }

    /// Rotates PCA loadings in place through [`ModelDescriptor::update`].
    pub fn rotate(&mut self, options: &RotationOptions) -> Result<()> {
        self.require(Operation::Rotate)?;
        let Model::Pca(pca) = &self.model else {
            return Err(self.unsupported(Operation::Rotate));
        };
        let rotated = rotate_loadings(pca.principal_components(), options)?;
        debug!(
            "Rotated {} loadings with gamma = {}",
            self.model_type(),
            options.gamma
        );
        self.update(json!({ "principal_components": rotated }))
    }
}

impl fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary)
    }
}
