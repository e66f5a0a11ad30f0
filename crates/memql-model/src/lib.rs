//! memql model descriptors
//!
//! Trained-model parameters evaluated two ways: numerically over batches of
//! feature rows, or as a single SQL expression per output that a query engine
//! can run in place of the model.
//!
//! ```ignore
//! let model = ModelDescriptor::new("LinearRegression", json!({
//!     "coefficients": [2.0, 3.0],
//!     "intercept": 1.0,
//! }))?;
//! let sql = model.predict_sql(&["age", "income"])?;
//! ```

mod batch;
mod descriptor;
mod distance;
mod ensemble;
mod error;
mod family;
mod linear;
mod rotation;
mod transform;
mod tree;

pub use descriptor::{Attributes, Model, ModelDescriptor};
pub use distance::{BisectingKMeans, Clusters};
pub use ensemble::{
    ClassifierMember, RandomForestClassifier, RandomForestRegressor, RegressorMember,
    XGBoostClassifier, XGBoostRegressor,
};
pub use error::{ModelError, Result};
pub use family::{ModelType, Operation};
pub use linear::{Linear, Link};
pub use rotation::{rotate_loadings, RotationOptions};
pub use transform::{ColumnNaming, Normalizer, NormalizerMethod, OneHotEncoder, Pca, Svd};
pub use tree::{ClassificationTree, RegressionTree, Threshold};

pub use memql_sql::Value;
