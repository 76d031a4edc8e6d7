use nalgebra::{DMatrix, DVector};

use crate::tools::median;

// S window kept for the beta/gamma regression
const BETA_GAMMA_S_RANGE: (f64, f64) = (0.3, 0.7);
const LEASTSQ_EPS: f64 = 1e-12;

/// Which per-trace factor a marked frame window is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionFactorKind {
    Alpha,
    Delta,
}

/// Donor leakage from a donor-only window of background-subtracted intensities.
/// None when the window is empty or every ratio is undefined.
pub fn alpha_factor(i_dd: &[f64], i_da: &[f64]) -> Option<f64> {
    let ratios: Vec<f64> = i_dd.iter()
        .zip(i_da)
        .map(|(dd, da)| {
            let e_app = da / (dd + da);
            e_app / (1.0 - e_app)
        })
        .collect();

    median(&ratios)
}

/// Direct acceptor excitation from an acceptor-only window
pub fn delta_factor(i_dd: &[f64], i_da: &[f64], i_aa: &[f64]) -> Option<f64> {
    let ratios: Vec<f64> = i_dd.iter()
        .zip(i_da)
        .zip(i_aa)
        .map(|((dd, da), aa)| {
            let s_app = (dd + da) / (dd + da + aa);
            s_app / (1.0 - s_app)
        })
        .collect();

    median(&ratios)
}

/// Ordinary least squares of y = m·x + c. Returns (slope, intercept).
pub fn leastsq_line(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }

    let n = x.len();
    let design = DMatrix::from_fn(n, 2, |i, j| if j == 0 { x[i] } else { 1.0 });
    let target = DVector::from_column_slice(y);

    let solution = design.svd(true, true).solve(&target, LEASTSQ_EPS).ok()?;

    Some((solution[0], solution[1]))
}

/// Global beta and gamma from pooled apparent E and S. Falls back to (1, 1)
/// whenever the regression is empty or gives non-finite numbers.
pub fn beta_gamma_factor(e_app: &[f64], s_app: &[f64]) -> (f64, f64) {
    let (lo, hi) = BETA_GAMMA_S_RANGE;

    let (x, y): (Vec<f64>, Vec<f64>) = e_app.iter()
        .zip(s_app)
        .filter(|(_, s)| **s > lo && **s < hi)
        .map(|(e, s)| (*e, 1.0 / *s))
        .unzip();

    let Some((slope, intercept)) = leastsq_line(&x, &y) else {
        return (1.0, 1.0);
    };

    let beta = intercept + slope - 1.0;
    let gamma = (intercept - 1.0) / (intercept + slope - 1.0);

    if [beta, gamma, slope, intercept].iter().all(|v| v.is_finite()) {
        (beta, gamma)
    } else {
        (1.0, 1.0)
    }
}
