use approx::assert_relative_eq;
use memql_model::{ModelDescriptor, ModelError, ModelType, Operation, RotationOptions, Value};
use ndarray::{array, Array2};
use serde_json::json;

fn stump(threshold: f64, left: [f64; 2], right: [f64; 2]) -> serde_json::Value {
    json!({
        "model_type": "BinaryTreeClassifier",
        "attributes": {
            "children_left": [1, -1, -1],
            "children_right": [2, -1, -1],
            "feature": [0, -2, -2],
            "threshold": [threshold, -2.0, -2.0],
            "value": [null, left, right],
            "classes": [0, 1]
        }
    })
}

#[test]
fn test_linear_regression() {
    let model = ModelDescriptor::new(
        "LinearRegression",
        json!({"coefficients": [2, 3], "intercept": 1}),
    )
    .unwrap();
    let x = array![[Value::Int(1), Value::Int(1)]];
    assert_eq!(model.predict(x.view()).unwrap()[0], Value::Float(6.0));
    assert_eq!(model.predict_sql(&["a", "b"]).unwrap(), "1.0 + 2.0 * a + 3.0 * b");
}

#[test]
fn test_logistic_regression() {
    let model = ModelDescriptor::new(
        "LogisticRegression",
        json!({"coefficients": [2, 3], "intercept": 1}),
    )
    .unwrap();
    let x = array![[Value::Int(1), Value::Int(1)]];
    let proba = model.predict_proba(x.view()).unwrap();
    assert_relative_eq!(proba[[0, 0]], 0.00247, epsilon = 1e-5);
    assert_relative_eq!(proba[[0, 1]], 0.99753, epsilon = 1e-5);
    assert_eq!(model.predict(x.view()).unwrap()[0], Value::Int(1));
    assert_eq!(model.predict_proba_sql(&["a", "b"]).unwrap().len(), 2);
}

#[test]
fn test_kmeans() {
    let model = ModelDescriptor::new("KMeans", json!({"clusters": [[0, 0], [10, 10]]})).unwrap();
    let x = array![[Value::Int(1), Value::Int(1)]];
    assert_eq!(model.predict(x.view()).unwrap()[0], Value::Int(0));
    let proba = model.predict_proba(x.view()).unwrap();
    assert!(proba[[0, 0]] > proba[[0, 1]]);
    assert_eq!(model.transform(x.view()).unwrap().dim(), (1, 2));
}

#[test]
fn test_one_hot_drop_first() {
    let model = ModelDescriptor::new(
        "OneHotEncoder",
        json!({"categories": [["a", "b", "c"]], "drop_first": true}),
    )
    .unwrap();
    let x = array![[Value::from("b")]];
    assert_eq!(model.transform(x.view()).unwrap(), Array2::from_shape_vec((1, 2), vec![1.0, 0.0]).unwrap());
    let sql = model.transform_sql(&["x"]).unwrap();
    assert_eq!(sql.len(), 2);
    assert!(sql[0].starts_with("CASE WHEN x::varchar = 'b' THEN 1 ELSE 0 END"));
}

#[test]
fn test_random_forest_votes() {
    let unanimous = ModelDescriptor::new(
        "RandomForestClassifier",
        json!({"trees": [stump(1.0, [0.9, 0.1], [0.3, 0.7]), stump(2.0, [0.6, 0.4], [0.2, 0.8])]}),
    )
    .unwrap();
    let x = array![[Value::Float(5.0)]];
    let proba = unanimous.predict_proba(x.view()).unwrap();
    assert_eq!(proba.row(0).to_vec(), vec![0.0, 1.0]);
    assert_eq!(unanimous.predict(x.view()).unwrap()[0], Value::Int(1));

    let split = ModelDescriptor::new(
        "RandomForestClassifier",
        json!({"trees": [
            stump(1.0, [0.9, 0.1], [0.3, 0.7]),
            stump(2.0, [0.6, 0.4], [0.2, 0.8]),
            stump(3.0, [0.6, 0.4], [0.2, 0.8]),
            stump(4.0, [0.6, 0.4], [0.2, 0.8]),
        ]}),
    )
    .unwrap();
    // x = 2.5 is right of the first two thresholds and left of the last two.
    let x = array![[Value::Float(2.5)]];
    let proba = split.predict_proba(x.view()).unwrap();
    assert_eq!(proba.row(0).to_vec(), vec![0.5, 0.5]);
    assert_eq!(split.predict(x.view()).unwrap()[0], Value::Int(0));
    assert_eq!(split.to_string(), "<RandomForestClassifier>\n\nntrees = 4");
}

#[test]
fn test_single_leaf_tree() {
    let model = ModelDescriptor::new(
        "BinaryTreeRegressor",
        json!({
            "children_left": [-1],
            "children_right": [-1],
            "feature": [-2],
            "threshold": [-2.0],
            "value": [7.5]
        }),
    )
    .unwrap();
    let x = array![[Value::Int(100)], [Value::from("anything")], [Value::Null]];
    assert!(model
        .predict(x.view())
        .unwrap()
        .iter()
        .all(|value| *value == Value::Float(7.5)));
    assert_eq!(model.predict_sql(&["x"]).unwrap(), "7.5");
}

#[test]
fn test_update_preserves_and_revalidates() {
    let mut model = ModelDescriptor::new(
        "XGBoostRegressor",
        json!({
            "trees": [{
                "model_type": "BinaryTreeRegressor",
                "attributes": {
                    "children_left": [1, null, null],
                    "children_right": [2, null, null],
                    "feature": [0, null, null],
                    "threshold": [0.0, null, null],
                    "value": [null, -1.0, 1.0]
                }
            }],
            "learning_rate": 0.5,
            "mean": 3.0
        }),
    )
    .unwrap();
    let x = array![[Value::Float(1.0)]];
    assert_eq!(model.predict(x.view()).unwrap()[0], Value::Float(3.5));

    model.update(json!({"mean": 10.0})).unwrap();
    assert_eq!(model.attributes()["learning_rate"], json!(0.5));
    assert_eq!(model.predict(x.view()).unwrap()[0], Value::Float(10.5));

    let before = model.clone();
    let err = model.update(json!({"trees": []})).unwrap_err();
    assert!(matches!(err, ModelError::Validation { .. }));
    assert_eq!(model, before);

    assert!(model.update(json!({"learning_rate": "fast"})).is_err());
    assert_eq!(model, before);
}

#[test]
fn test_rotate() {
    let mut pca = ModelDescriptor::new(
        "PCA",
        json!({
            "principal_components": [[0.8, 0.3], [0.7, 0.4], [0.2, 0.9], [0.3, 0.8]],
            "mean": [0.0, 0.0, 0.0, 0.0]
        }),
    )
    .unwrap();
    let norms = |model: &ModelDescriptor| -> Vec<f64> {
        let rows: Vec<Vec<f64>> =
            serde_json::from_value(model.attributes()["principal_components"].clone()).unwrap();
        rows.iter()
            .map(|row| row.iter().map(|v| v * v).sum::<f64>().sqrt())
            .collect()
    };
    let before = norms(&pca);
    pca.rotate(&RotationOptions::default()).unwrap();
    let after = norms(&pca);
    assert_eq!(after.len(), 4);
    for (b, a) in before.iter().zip(&after) {
        assert_relative_eq!(*b, *a, epsilon = 1e-9);
    }

    let mut svd = ModelDescriptor::new("SVD", json!({"vectors": [[1.0]], "values": [2.0]})).unwrap();
    let err = svd.rotate(&RotationOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        ModelError::UnsupportedOperation {
            model_type: ModelType::Svd,
            operation: Operation::Rotate
        }
    ));
}

#[test]
fn test_length_mismatch() {
    let model = ModelDescriptor::new(
        "PCA",
        json!({"principal_components": [[1.0], [0.0]], "mean": [0.0, 0.0]}),
    )
    .unwrap();
    let x = array![[Value::Int(1), Value::Int(2), Value::Int(3)]];
    assert!(matches!(
        model.transform(x.view()),
        Err(ModelError::LengthMismatch { expected: 2, actual: 3, .. })
    ));
    assert!(model.transform_sql(&["a"]).is_err());
}

#[test]
fn test_every_family_rejects_missing_attributes() {
    for model_type in ModelType::ALL {
        let err = ModelDescriptor::new(model_type.as_str(), json!({})).unwrap_err();
        assert!(
            matches!(err, ModelError::Validation { .. }),
            "{} accepted an empty attribute bag",
            model_type
        );
    }
}

#[test]
fn test_descriptor_file_format() {
    let text = r#"{
        "model_type": "NearestCentroids",
        "attributes": {"clusters": [[0.0], [5.0]], "p": 1, "classes": ["low", "high"]}
    }"#;
    let model: ModelDescriptor = serde_json::from_str(text).unwrap();
    assert_eq!(model.model_type(), ModelType::NearestCentroids);
    let x = array![[Value::Float(4.0)]];
    assert_eq!(model.predict(x.view()).unwrap()[0], Value::from("high"));
}
