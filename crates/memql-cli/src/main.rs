//! memql command line
//!
//! Loads a model descriptor from JSON or YAML and either scores a file of
//! feature rows or prints the SQL that scores them inside a database.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use memql_model::{ModelDescriptor, RotationOptions, Value};
use ndarray::Array2;
use serde::Serialize;
use tracing::{debug, info};

mod config;
mod logging;

use config::{Config, OutputFormat};

#[derive(Debug, Parser)]
#[command(name = "memql", version, about = "Score in-memory model descriptors or emit their SQL")]
struct Cli {
    /// Configuration file (defaults to ./config.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured output format (json, yaml, text)
    #[arg(long, global = true)]
    format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the summary and fingerprint of a model
    Describe { model: PathBuf },

    /// Score rows (a JSON array of arrays)
    Predict {
        model: PathBuf,
        rows: PathBuf,
        /// Class probabilities instead of labels
        #[arg(long)]
        proba: bool,
    },

    /// Transform rows (a JSON array of arrays)
    Transform { model: PathBuf, rows: PathBuf },

    /// Print the SQL expressions for the given input columns
    Sql {
        model: PathBuf,
        /// Input column names, comma separated, in feature order
        #[arg(long, value_delimiter = ',', required = true)]
        columns: Vec<String>,
        /// One expression per class probability
        #[arg(long, conflicts_with = "transform")]
        proba: bool,
        /// One expression per transformed output
        #[arg(long)]
        transform: bool,
    },

    /// Rotate PCA loadings and write the updated descriptor
    Rotate {
        model: PathBuf,
        #[arg(long, default_value_t = 1.0)]
        gamma: f64,
        #[arg(long, default_value_t = 20)]
        max_iterations: usize,
        #[arg(long, default_value_t = 1e-6)]
        tolerance: f64,
        /// Where to write the rotated model (stdout when omitted)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = Config::discover(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(format) = &cli.format {
        config.output.format = format.clone();
    }
    logging::init(&config.logging)?;
    let format = config.output.format()?;

    match cli.command {
        Command::Describe { model } => {
            let model = load_model(&model)?;
            let description = serde_json::json!({
                "model_type": model.model_type().as_str(),
                "fingerprint": model.fingerprint(),
                "summary": model.summary(),
            });
            match format {
                OutputFormat::Text => println!("{}\n\nfingerprint = {}", model, model.fingerprint()),
                _ => emit(&description, format)?,
            }
        }
        Command::Predict { model, rows, proba } => {
            let model = load_model(&model)?;
            let x = load_rows(&rows)?;
            if proba {
                let scores = model.predict_proba(x.view())?;
                emit(&matrix_rows(&scores), format)?;
            } else {
                let labels = model.predict(x.view())?;
                emit(&labels.to_vec(), format)?;
            }
        }
        Command::Transform { model, rows } => {
            let model = load_model(&model)?;
            let x = load_rows(&rows)?;
            let outputs = model.transform(x.view())?;
            emit(&matrix_rows(&outputs), format)?;
        }
        Command::Sql {
            model,
            columns,
            proba,
            transform,
        } => {
            let model = load_model(&model)?;
            let statements = if proba {
                model.predict_proba_sql(&columns)?
            } else if transform {
                model.transform_sql(&columns)?
            } else {
                vec![model.predict_sql(&columns)?]
            };
            emit(&statements, format)?;
        }
        Command::Rotate {
            model: path,
            gamma,
            max_iterations,
            tolerance,
            output,
        } => {
            let mut model = load_model(&path)?;
            let options = RotationOptions {
                gamma,
                max_iterations,
                tolerance,
            };
            model.rotate(&options)?;
            info!("Rotated {} (fingerprint {})", path.display(), model.fingerprint());
            match output {
                Some(target) => {
                    let text = render_model(&model, &target)?;
                    std::fs::write(&target, text)
                        .with_context(|| format!("Failed to write {}", target.display()))?;
                }
                None => emit(&model, format)?,
            }
        }
    }

    Ok(())
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn load_model(path: &Path) -> Result<ModelDescriptor> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read model file {}", path.display()))?;
    let model: ModelDescriptor = if is_yaml(path) {
        serde_yaml::from_str(&text)?
    } else {
        serde_json::from_str(&text)?
    };
    debug!("Loaded {} from {}", model.model_type(), path.display());
    Ok(model)
}

fn render_model(model: &ModelDescriptor, path: &Path) -> Result<String> {
    Ok(if is_yaml(path) {
        serde_yaml::to_string(model)?
    } else {
        serde_json::to_string_pretty(model)?
    })
}

fn load_rows(path: &Path) -> Result<Array2<Value>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rows file {}", path.display()))?;
    let rows: Vec<Vec<Value>> = serde_json::from_str(&text)
        .with_context(|| format!("{} must hold a JSON array of rows", path.display()))?;
    let width = rows.first().map(Vec::len).unwrap_or(0);
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != width) {
        bail!("Row {} has {} values, expected {}", i, row.len(), width);
    }
    let n_rows = rows.len();
    let x = Array2::from_shape_vec((n_rows, width), rows.into_iter().flatten().collect())?;
    debug!("Loaded {} rows of width {}", n_rows, width);
    Ok(x)
}

fn matrix_rows(matrix: &Array2<f64>) -> Vec<Vec<f64>> {
    matrix.rows().into_iter().map(|row| row.to_vec()).collect()
}

fn emit<T: Serialize>(value: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
        OutputFormat::Text => match serde_json::to_value(value)? {
            serde_json::Value::Array(items) => {
                for item in items {
                    println!("{}", text_line(&item));
                }
            }
            other => println!("{}", text_line(&other)),
        },
    }
    Ok(())
}

fn text_line(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(text_line)
            .collect::<Vec<_>>()
            .join("\t"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_sql_columns_are_split() {
        let cli = Cli::try_parse_from(["memql", "sql", "model.json", "--columns", "age,income"]).unwrap();
        let Command::Sql { columns, proba, .. } = cli.command else {
            panic!("expected the sql subcommand");
        };
        assert_eq!(columns, vec!["age", "income"]);
        assert!(!proba);
    }

    #[test]
    fn test_proba_conflicts_with_transform() {
        assert!(Cli::try_parse_from([
            "memql", "sql", "m.json", "--columns", "a", "--proba", "--transform"
        ])
        .is_err());
    }

    #[test]
    fn test_load_rows_rejects_ragged_input() {
        let path = std::env::temp_dir().join("memql_ragged_rows.json");
        std::fs::write(&path, "[[1, 2], [3]]").unwrap();
        assert!(load_rows(&path).is_err());
        std::fs::write(&path, "[[1, \"a\"], [null, 2.5]]").unwrap();
        let x = load_rows(&path).unwrap();
        assert_eq!(x.dim(), (2, 2));
        assert_eq!(x[[1, 0]], Value::Null);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_text_lines() {
        assert_eq!(text_line(&serde_json::json!("CASE WHEN x < 1 THEN 0 ELSE 1 END")), "CASE WHEN x < 1 THEN 0 ELSE 1 END");
        assert_eq!(text_line(&serde_json::json!([0.25, 0.75])), "0.25\t0.75");
    }
}
