//! Orthogonal rotation of component loadings (Oblimin family)

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::{ModelError, Result};

/// Rotation settings. `gamma = 1` is Varimax, `gamma = 0` is Quartimax.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationOptions {
    pub gamma: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for RotationOptions {
    fn default() -> Self {
        Self {
            gamma: 1.0,
            max_iterations: 20,
            tolerance: 1e-6,
        }
    }
}

impl RotationOptions {
    fn check(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(ModelError::Rotation(format!(
                "gamma must be in [0, 1], got {}",
                self.gamma
            )));
        }
        if self.max_iterations == 0 {
            return Err(ModelError::Rotation(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.tolerance > 0.0) {
            return Err(ModelError::Rotation(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

/// Rotates a `features x components` loading matrix.
///
/// Iterates `R = U V'` from the SVD of `Phi' (L^3 - gamma/p L diag(L'L))` with
/// `L = Phi R`, until the singular-value sum stops growing by more than
/// `1 + tolerance`. The result is `Phi R`, same shape, same row norms.
pub fn rotate_loadings(loadings: &[Vec<f64>], options: &RotationOptions) -> Result<Vec<Vec<f64>>> {
    options.check()?;
    let p = loadings.len();
    let k = loadings.first().map(Vec::len).unwrap_or(0);
    if p == 0 || k == 0 || loadings.iter().any(|row| row.len() != k) {
        return Err(ModelError::Rotation(
            "loadings must be a non-empty rectangular matrix".to_string(),
        ));
    }

    let phi = DMatrix::from_fn(p, k, |i, j| loadings[i][j]);
    let mut rotation = DMatrix::<f64>::identity(k, k);
    let mut criterion = 0.0;
    for iteration in 0..options.max_iterations {
        let previous = criterion;
        let lambda = &phi * &rotation;
        let column_norms =
            DVector::from_iterator(k, lambda.column_iter().map(|column| column.norm_squared()));
        let shrink = &lambda * DMatrix::from_diagonal(&column_norms) * (options.gamma / p as f64);
        let target = lambda.map(|value| value.powi(3)) - shrink;

        let svd = (phi.transpose() * target)
            .try_svd(true, true, f64::EPSILON, 0)
            .ok_or_else(|| ModelError::Rotation("SVD did not converge".to_string()))?;
        criterion = svd.singular_values.sum();
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            return Err(ModelError::Rotation(
                "SVD did not produce singular vectors".to_string(),
            ));
        };
        rotation = u * v_t;
        debug!(iteration, criterion, "Rotation step");

        if previous != 0.0 && criterion / previous < 1.0 + options.tolerance {
            break;
        }
    }

    let rotated = phi * rotation;
    Ok((0..p)
        .map(|i| (0..k).map(|j| rotated[(i, j)]).collect())
        .collect())
}
