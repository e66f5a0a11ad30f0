//! Model families and the public operations they support

use std::fmt;
use std::str::FromStr;

/// Closed set of supported model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    BinaryTreeRegressor,
    BinaryTreeClassifier,
    RandomForestRegressor,
    RandomForestClassifier,
    XGBoostRegressor,
    XGBoostClassifier,
    LinearRegression,
    LinearSVR,
    LogisticRegression,
    LinearSVC,
    KMeans,
    NearestCentroids,
    BisectingKMeans,
    Pca,
    Svd,
    Normalizer,
    OneHotEncoder,
}

impl ModelType {
    pub const ALL: [ModelType; 17] = [
        ModelType::BinaryTreeRegressor,
        ModelType::BinaryTreeClassifier,
        ModelType::RandomForestRegressor,
        ModelType::RandomForestClassifier,
        ModelType::XGBoostRegressor,
        ModelType::XGBoostClassifier,
        ModelType::LinearRegression,
        ModelType::LinearSVR,
        ModelType::LogisticRegression,
        ModelType::LinearSVC,
        ModelType::KMeans,
        ModelType::NearestCentroids,
        ModelType::BisectingKMeans,
        ModelType::Pca,
        ModelType::Svd,
        ModelType::Normalizer,
        ModelType::OneHotEncoder,
    ];

    /// Tag used in attribute files and in summaries.
    pub fn as_str(self) -> &'static str {
        match self {
            ModelType::BinaryTreeRegressor => "BinaryTreeRegressor",
            ModelType::BinaryTreeClassifier => "BinaryTreeClassifier",
            ModelType::RandomForestRegressor => "RandomForestRegressor",
            ModelType::RandomForestClassifier => "RandomForestClassifier",
            ModelType::XGBoostRegressor => "XGBoostRegressor",
            ModelType::XGBoostClassifier => "XGBoostClassifier",
            ModelType::LinearRegression => "LinearRegression",
            ModelType::LinearSVR => "LinearSVR",
            ModelType::LogisticRegression => "LogisticRegression",
            ModelType::LinearSVC => "LinearSVC",
            ModelType::KMeans => "KMeans",
            ModelType::NearestCentroids => "NearestCentroids",
            ModelType::BisectingKMeans => "BisectingKMeans",
            ModelType::Pca => "PCA",
            ModelType::Svd => "SVD",
            ModelType::Normalizer => "Normalizer",
            ModelType::OneHotEncoder => "OneHotEncoder",
        }
    }

    pub fn supports(self, operation: Operation) -> bool {
        use ModelType::*;
        match operation {
            Operation::Predict | Operation::PredictSql => !matches!(
                self,
                Pca | Svd | Normalizer | OneHotEncoder
            ),
            Operation::PredictProba | Operation::PredictProbaSql => matches!(
                self,
                BinaryTreeClassifier
                    | RandomForestClassifier
                    | XGBoostClassifier
                    | LogisticRegression
                    | LinearSVC
                    | KMeans
                    | NearestCentroids
            ),
            Operation::Transform | Operation::TransformSql => matches!(
                self,
                KMeans | NearestCentroids | BisectingKMeans | Pca | Svd | Normalizer | OneHotEncoder
            ),
            Operation::Rotate => self == Pca,
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelType::ALL
            .into_iter()
            .find(|model_type| model_type.as_str() == s)
            .ok_or_else(|| format!("unknown model type '{}'", s))
    }
}

/// Public descriptor operations, named as they appear in error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Predict,
    PredictProba,
    PredictSql,
    PredictProbaSql,
    Transform,
    TransformSql,
    Rotate,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Predict => "predict",
            Operation::PredictProba => "predict_proba",
            Operation::PredictSql => "predict_sql",
            Operation::PredictProbaSql => "predict_proba_sql",
            Operation::Transform => "transform",
            Operation::TransformSql => "transform_sql",
            Operation::Rotate => "rotate",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        for model_type in ModelType::ALL {
            assert_eq!(model_type.as_str().parse::<ModelType>(), Ok(model_type));
        }
        assert!("NaiveBayes".parse::<ModelType>().is_err());
        assert!("pca".parse::<ModelType>().is_err());
    }

    #[test]
    fn test_operation_matrix() {
        assert!(ModelType::Pca.supports(Operation::Rotate));
        assert!(!ModelType::Svd.supports(Operation::Rotate));
        assert!(ModelType::BisectingKMeans.supports(Operation::Transform));
        assert!(!ModelType::BisectingKMeans.supports(Operation::PredictProba));
        assert!(!ModelType::LinearRegression.supports(Operation::PredictProbaSql));
        assert!(ModelType::LinearSVC.supports(Operation::PredictProba));
        assert!(!ModelType::OneHotEncoder.supports(Operation::Predict));
    }
}
