//! Weighted ridge regression for local surrogate fits

use crate::error::{ExplainError, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Solve symmetric positive-definite system Ax = b using Cholesky decomposition.
/// Retries once with a small diagonal jitter if the matrix is near-singular.
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return None;
    }

    if let Some(x) = cholesky_solve_inner(a, b) {
        return Some(x);
    }

    // Not positive definite, add regularization and retry
    let mut a_reg = a.clone();
    let ridge = (1e-8 * a.diag().iter().map(|v| v.abs()).sum::<f64>() / n as f64).max(1e-12);
    for k in 0..n {
        a_reg[[k, k]] += ridge;
    }
    cholesky_solve_inner(&a_reg, b)
}

fn cholesky_solve_inner(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l[[i, k]] * l[[j, k]];
            }
            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= 0.0 || !diag.is_finite() {
                    return None;
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }

    // Forward substitution: L * y = b
    let mut y = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = 0.0;
        for j in 0..i {
            sum += l[[i, j]] * y[j];
        }
        y[i] = (b[i] - sum) / l[[i, i]];
    }

    // Backward substitution: L^T * x = y
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = 0.0;
        for j in (i + 1)..n {
            sum += l[[j, i]] * x[j];
        }
        x[i] = (y[i] - sum) / l[[i, i]];
    }

    Some(x)
}

/// Matrix inversion for small matrices using Gauss-Jordan elimination (fallback)
fn matrix_inverse(m: &Array2<f64>) -> Option<Array2<f64>> {
    let n = m.nrows();
    if n != m.ncols() {
        return None;
    }

    // Augmented matrix [M | I]
    let mut aug = Array2::<f64>::zeros((n, 2 * n));
    for i in 0..n {
        for j in 0..n {
            aug[[i, j]] = m[[i, j]];
        }
        aug[[i, n + i]] = 1.0;
    }

    for col in 0..n {
        let mut max_row = col;
        for row in col + 1..n {
            if aug[[row, col]].abs() > aug[[max_row, col]].abs() {
                max_row = row;
            }
        }

        if max_row != col {
            for j in 0..2 * n {
                aug.swap([col, j], [max_row, j]);
            }
        }

        if aug[[col, col]].abs() < 1e-10 {
            return None;
        }

        let pivot = aug[[col, col]];
        for j in 0..2 * n {
            aug[[col, j]] /= pivot;
        }

        for row in 0..n {
            if row != col {
                let factor = aug[[row, col]];
                for j in 0..2 * n {
                    aug[[row, j]] -= factor * aug[[col, j]];
                }
            }
        }
    }

    let mut inv = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            inv[[i, j]] = aug[[i, n + j]];
        }
    }

    Some(inv)
}

/// Solve (A) x = b, Cholesky first, Gauss-Jordan as fallback
fn solve_spd(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    cholesky_solve(a, b).or_else(|| matrix_inverse(a).map(|inv| inv.dot(b)))
}

/// Ridge regression with per-sample weights.
///
/// Minimises `Σ wᵢ (yᵢ − b − xᵢ·β)² + α‖β‖²`; the intercept is not penalised.
/// Weights are rescaled to mean 1, so uniform weights give the plain ridge fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedRidge {
    pub coefficients: Option<Vec<f64>>,
    pub intercept: Option<f64>,
    /// L2 regularization strength
    pub alpha: f64,
    /// Set when the supplied weights were unusable and uniform weights were used
    pub used_uniform_weights: bool,
    pub is_fitted: bool,
}

impl Default for WeightedRidge {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl WeightedRidge {
    pub fn new(alpha: f64) -> Self {
        Self {
            coefficients: None,
            intercept: None,
            alpha,
            used_uniform_weights: false,
            is_fitted: false,
        }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Normalised weights, or uniform ones when the input is degenerate
    fn normalise_weights(weights: &Array1<f64>) -> (Array1<f64>, bool) {
        let n = weights.len();
        let usable = weights.iter().all(|w| w.is_finite() && *w >= 0.0);
        let sum: f64 = if usable { weights.sum() } else { 0.0 };
        if !usable || sum <= f64::EPSILON * n as f64 {
            return (Array1::ones(n), true);
        }
        (weights * (n as f64 / sum), false)
    }

    pub fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, weights: &Array1<f64>) -> Result<&mut Self> {
        let n_samples = x.nrows();
        let n_features = x.ncols();
        if n_samples != y.len() || n_samples != weights.len() {
            return Err(ExplainError::ShapeError {
                expected: format!("y and weights length = {}", n_samples),
                actual: format!("y length = {}, weights length = {}", y.len(), weights.len()),
            });
        }
        if n_samples == 0 {
            return Err(ExplainError::InsufficientData(
                "cannot fit a regression on zero samples".to_string(),
            ));
        }
        if !(self.alpha >= 0.0 && self.alpha.is_finite()) {
            return Err(ExplainError::invalid_parameter(
                "alpha",
                self.alpha,
                "must be a finite non-negative number",
            ));
        }

        let (w, uniform) = Self::normalise_weights(weights);
        if uniform {
            warn!(n_samples, "degenerate regression weights, falling back to uniform weighting");
        }
        let w_sum = w.sum();

        // Weighted centring removes the intercept from the normal equations
        let x_mean = x.t().dot(&w) / w_sum;
        let y_mean = w.dot(y) / w_sum;
        let x_c = x - &x_mean.clone().insert_axis(Axis(0));
        let y_c = y - y_mean;

        let sqrt_w = w.mapv(f64::sqrt);
        let x_w = &x_c * &sqrt_w.clone().insert_axis(Axis(1));
        let y_w = &y_c * &sqrt_w;

        let mut xtx = x_w.t().dot(&x_w);
        for i in 0..n_features {
            xtx[[i, i]] += self.alpha;
        }
        let xty = x_w.t().dot(&y_w);

        let coefficients = solve_spd(&xtx, &xty)
            .ok_or_else(|| ExplainError::ComputationError("Singular matrix".to_string()))?;
        if coefficients.iter().any(|c| !c.is_finite()) {
            return Err(ExplainError::ComputationError(
                "regression produced non-finite coefficients".to_string(),
            ));
        }

        self.intercept = Some(y_mean - coefficients.dot(&x_mean));
        self.coefficients = Some(coefficients.to_vec());
        self.used_uniform_weights = uniform;
        self.is_fitted = true;
        Ok(self)
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        match (&self.coefficients, self.intercept) {
            (Some(coef), Some(intercept)) if self.is_fitted => {
                Ok(x.dot(&Array1::from_vec(coef.clone())) + intercept)
            }
            _ => Err(ExplainError::ModelNotFitted),
        }
    }

    /// Weighted coefficient of determination
    pub fn score(&self, x: &Array2<f64>, y: &Array1<f64>, weights: &Array1<f64>) -> Result<f64> {
        let p = self.predict(x)?;
        let (w, _) = Self::normalise_weights(weights);
        let ym = w.dot(y) / w.sum();
        let ss_res: f64 = w.iter().zip(p.iter().zip(y.iter())).map(|(wi, (pi, yi))| wi * (pi - yi).powi(2)).sum();
        let ss_tot: f64 = w.iter().zip(y.iter()).map(|(wi, yi)| wi * (yi - ym).powi(2)).sum();
        Ok(if ss_tot <= f64::EPSILON { 1.0 } else { 1.0 - ss_res / ss_tot })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_recovers_linear_relation() {
        let x = array![[1.0, 0.0], [2.0, 1.0], [3.0, 0.0], [4.0, 1.0], [5.0, 3.0]];
        let y = x.column(0).mapv(|v| 2.0 * v) + x.column(1).mapv(|v| -1.0 * v) + 0.5;
        let w = Array1::ones(5);

        let mut model = WeightedRidge::new(0.0);
        model.fit(&x, &y, &w).unwrap();

        let coef = model.coefficients.as_ref().unwrap();
        assert!((coef[0] - 2.0).abs() < 1e-6);
        assert!((coef[1] + 1.0).abs() < 1e-6);
        assert!((model.intercept.unwrap() - 0.5).abs() < 1e-6);
        assert!((model.score(&x, &y, &w).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_weights_fall_back_to_uniform() {
        let x = array![[1.0], [2.0], [3.0]];
        let y = array![2.0, 4.0, 6.0];

        let mut zero = WeightedRidge::new(0.0);
        zero.fit(&x, &y, &Array1::zeros(3)).unwrap();
        assert!(zero.used_uniform_weights);

        let mut uniform = WeightedRidge::new(0.0);
        uniform.fit(&x, &y, &Array1::ones(3)).unwrap();
        assert_eq!(zero.coefficients, uniform.coefficients);
        assert!(zero.coefficients.unwrap().iter().all(|c| c.is_finite()));
    }

    #[test]
    fn test_identical_weights_equal_unweighted_fit() {
        let x = array![[1.0], [2.0], [4.0]];
        let y = array![1.0, 3.0, 2.0];

        let mut a = WeightedRidge::new(1.0);
        a.fit(&x, &y, &Array1::from_elem(3, 1e-3)).unwrap();
        let mut b = WeightedRidge::new(1.0);
        b.fit(&x, &y, &Array1::ones(3)).unwrap();

        let (ca, cb) = (a.coefficients.unwrap(), b.coefficients.unwrap());
        assert!((ca[0] - cb[0]).abs() < 1e-9);
    }

    #[test]
    fn test_weights_pull_fit_towards_heavy_samples() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![0.0, 1.0, 0.0, 10.0];
        let heavy_left = array![10.0, 10.0, 10.0, 0.01];

        let mut model = WeightedRidge::new(0.0);
        model.fit(&x, &y, &heavy_left).unwrap();
        let unweighted_slope = {
            let mut m = WeightedRidge::new(0.0);
            m.fit(&x, &y, &Array1::ones(4)).unwrap();
            m.coefficients.unwrap()[0]
        };
        assert!(model.coefficients.unwrap()[0] < unweighted_slope);
    }

    #[test]
    fn test_constant_feature_does_not_produce_nan() {
        let x = array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0]];
        let y = array![1.0, 2.0, 3.0];
        let mut model = WeightedRidge::new(0.0);
        model.fit(&x, &y, &Array1::ones(3)).unwrap();
        assert!(model.coefficients.unwrap().iter().all(|c| c.is_finite()));
    }

    #[test]
    fn test_negative_alpha_rejected() {
        let mut model = WeightedRidge::new(-1.0);
        let result = model.fit(&array![[1.0]], &array![1.0], &array![1.0]);
        assert!(matches!(result, Err(ExplainError::InvalidParameter { .. })));
    }
}
