//! Least squares fitting used by the calibration and flash statistics.
//!
//! Both fits are linear least squares problems solved through the normal equations. The
//! line fit reports parameter variances from `s^2 (X^T X)^-1`, where `s^2` is the residual
//! variance; the Gaussian fit is the weighted log-parabola fit to histogram contents.
use nalgebra as na;
use serde::{Deserialize, Serialize};

use super::error::FitError;

// Relative size of det(X^T X) below which the normal matrix is treated as singular
const SINGULAR_TOLERANCE: f64 = 1.0e-12;

/// Response model of a calibration curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitModel {
    /// y = m x
    Slope,
    /// y = m x + b
    #[default]
    Linear,
}

impl FitModel {
    pub fn n_params(&self) -> usize {
        match self {
            Self::Slope => 1,
            Self::Linear => 2,
        }
    }
}

/// Result of a straight line fit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineFit {
    pub slope: f64,
    pub slope_var: f64,
    /// None for the slope only model
    pub intercept: Option<f64>,
    pub intercept_var: Option<f64>,
    pub n_points: usize,
    /// Residual sum of squares
    pub rss: f64,
}

impl LineFit {
    pub fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept.unwrap_or(0.0)
    }
}

fn solve_normal(
    design: &na::DMatrix<f64>,
    obs: &na::DVector<f64>,
) -> Result<(na::DVector<f64>, na::DMatrix<f64>), FitError> {
    let normal = design.transpose() * design;
    let scale: f64 = normal.diagonal().iter().product();
    if normal.determinant().abs() <= SINGULAR_TOLERANCE * scale.abs() {
        return Err(FitError::Singular);
    }
    let normal_inv = normal.try_inverse().ok_or(FitError::Singular)?;
    let params = &normal_inv * design.transpose() * obs;
    Ok((params, normal_inv))
}

/// Ordinary least squares fit of y against x
pub fn fit_line(x: &[f64], y: &[f64], model: FitModel) -> Result<LineFit, FitError> {
    if x.len() != y.len() {
        return Err(FitError::MismatchedLengths(x.len(), y.len()));
    }
    let n = x.len();
    let p = model.n_params();
    if n < p {
        return Err(FitError::TooFewPoints(p, n));
    }

    let design = na::DMatrix::from_fn(n, p, |row, col| match (model, col) {
        (FitModel::Linear, 0) => 1.0,
        _ => x[row],
    });
    let obs = na::DVector::from_column_slice(y);
    let (params, normal_inv) = solve_normal(&design, &obs)?;

    let residuals = &obs - &design * &params;
    let rss = residuals.norm_squared();
    // With as many points as parameters the curve passes through every point
    let s2 = if n > p { rss / (n - p) as f64 } else { 0.0 };
    let cov = normal_inv * s2;

    Ok(match model {
        FitModel::Slope => LineFit {
            slope: params[0],
            slope_var: cov[(0, 0)],
            intercept: None,
            intercept_var: None,
            n_points: n,
            rss,
        },
        FitModel::Linear => LineFit {
            slope: params[1],
            slope_var: cov[(1, 1)],
            intercept: Some(params[0]),
            intercept_var: Some(cov[(0, 0)]),
            n_points: n,
            rss,
        },
    })
}

/// Normal distribution `constant * exp(-(x - mean)^2 / (2 sigma^2))`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gaussian {
    pub constant: f64,
    pub mean: f64,
    pub sigma: f64,
}

impl Gaussian {
    pub fn eval(&self, x: f64) -> f64 {
        let z = (x - self.mean) / self.sigma;
        self.constant * (-0.5 * z * z).exp()
    }
}

/// Fit a Gaussian to binned data.
///
/// Takes the log of every populated bin and fits a parabola weighted by the squared bin
/// content, which suppresses the noisy tails.
pub fn fit_gaussian(centers: &[f64], counts: &[f64]) -> Result<Gaussian, FitError> {
    if centers.len() != counts.len() {
        return Err(FitError::MismatchedLengths(centers.len(), counts.len()));
    }
    let points: Vec<(f64, f64)> = centers
        .iter()
        .zip(counts.iter())
        .filter(|(_, c)| **c > 0.0)
        .map(|(x, c)| (*x, *c))
        .collect();
    if points.len() < 3 {
        return Err(FitError::TooFewPoints(3, points.len()));
    }

    // Centre x on the weighted mean to keep the normal matrix well conditioned
    let total: f64 = points.iter().map(|(_, c)| c).sum();
    let x0 = points.iter().map(|(x, c)| x * c).sum::<f64>() / total;

    let n = points.len();
    let design = na::DMatrix::from_fn(n, 3, |row, col| {
        let u = points[row].0 - x0;
        points[row].1 * u.powi(col as i32)
    });
    let obs = na::DVector::from_fn(n, |row, _| points[row].1 * points[row].1.ln());
    let (params, _) = solve_normal(&design, &obs)?;

    let (a, b, c) = (params[0], params[1], params[2]);
    if c >= 0.0 {
        return Err(FitError::NoPeak);
    }
    Ok(Gaussian {
        constant: (a - b * b / (4.0 * c)).exp(),
        mean: x0 - b / (2.0 * c),
        sigma: (-1.0 / (2.0 * c)).sqrt(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() <= tol
    }

    #[test]
    fn test_exact_line() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [3.0, 5.0, 7.0, 9.0];
        let fit = fit_line(&x, &y, FitModel::Linear).unwrap();
        assert!(close(fit.slope, 2.0, 1e-10));
        assert!(close(fit.intercept.unwrap(), 1.0, 1e-10));
        assert!(close(fit.slope_var, 0.0, 1e-12));
        assert_eq!(fit.n_points, 4);
        assert!(close(fit.eval(10.0), 21.0, 1e-9));
    }

    #[test]
    fn test_slope_only() {
        let x = [1.0, 2.0, 4.0];
        let y = [1.1, 1.9, 4.1];
        let fit = fit_line(&x, &y, FitModel::Slope).unwrap();
        // m = sum(xy) / sum(x^2) = 21.3 / 21
        assert!(close(fit.slope, 21.3 / 21.0, 1e-12));
        assert!(fit.intercept.is_none());
        // s^2 = rss / 2, var = s^2 / sum(x^2)
        let rss: f64 = x
            .iter()
            .zip(y.iter())
            .map(|(x, y)| (y - fit.slope * x).powi(2))
            .sum();
        assert!(close(fit.slope_var, rss / 2.0 / 21.0, 1e-12));
    }

    #[test]
    fn test_linear_variances() {
        let x = [0.0, 1.0, 2.0];
        let y = [0.0, 2.0, 1.0];
        let fit = fit_line(&x, &y, FitModel::Linear).unwrap();
        // slope 0.5, intercept 0.5, residuals (-0.5, 1.0, -0.5), rss 1.5, s^2 1.5
        assert!(close(fit.slope, 0.5, 1e-12));
        assert!(close(fit.intercept.unwrap(), 0.5, 1e-12));
        assert!(close(fit.rss, 1.5, 1e-12));
        // (X^T X)^-1 = [[5/6, -1/2], [-1/2, 1/2]]
        assert!(close(fit.slope_var, 0.75, 1e-12));
        assert!(close(fit.intercept_var.unwrap(), 1.25, 1e-12));
    }

    #[test]
    fn test_degenerate_fits() {
        assert!(matches!(
            fit_line(&[1.0], &[2.0], FitModel::Linear),
            Err(FitError::TooFewPoints(2, 1))
        ));
        assert!(matches!(
            fit_line(&[5.0, 5.0, 5.0], &[1.0, 2.0, 3.0], FitModel::Linear),
            Err(FitError::Singular)
        ));
        assert!(matches!(
            fit_line(&[1.0, 2.0], &[1.0], FitModel::Slope),
            Err(FitError::MismatchedLengths(2, 1))
        ));
        // two points, two parameters: exact with zero variance
        let fit = fit_line(&[1.0, 3.0], &[2.0, 6.0], FitModel::Linear).unwrap();
        assert!(close(fit.slope, 2.0, 1e-12));
        assert_eq!(fit.slope_var, 0.0);
    }

    #[test]
    fn test_gaussian_recovered() {
        let truth = Gaussian {
            constant: 120.0,
            mean: 910.0,
            sigma: 14.0,
        };
        let centers: Vec<f64> = (0..40).map(|i| 870.0 + 2.0 * i as f64).collect();
        let counts: Vec<f64> = centers.iter().map(|x| truth.eval(*x)).collect();
        let fit = fit_gaussian(&centers, &counts).unwrap();
        assert!(close(fit.mean, truth.mean, 1e-6));
        assert!(close(fit.sigma, truth.sigma, 1e-6));
        assert!(close(fit.constant, truth.constant, 1e-4));
    }

    #[test]
    fn test_gaussian_needs_peak() {
        assert!(matches!(
            fit_gaussian(&[1.0, 2.0], &[4.0, 5.0]),
            Err(FitError::TooFewPoints(3, 2))
        ));
        // log contents on an upward parabola
        let centers = [1.0, 2.0, 3.0, 4.0];
        let counts: Vec<f64> = centers.iter().map(|x: &f64| (0.5 * x * x).exp()).collect();
        assert!(matches!(
            fit_gaussian(&centers, &counts),
            Err(FitError::NoPeak)
        ));
    }
}
