use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use thiserror::Error;

use std::f64::consts::PI;

// Jitter added to the diagonal when a covariance is not positive definite
const COVARIANCE_JITTER: f64 = 1e-6;
const MAX_JITTER_TRIALS: usize = 5;

/// Hidden state with a full covariance Gaussian emission over the feature space
#[derive(Debug, Clone)]
pub struct State {
    pub id: usize,
    mean: DVector<f64>,
    covariance: DMatrix<f64>,

    cholesky: Cholesky<f64, Dyn>,
    log_norm: f64, // -0.5 * (d ln 2π + ln |Σ|)
}

impl State {
    pub fn new(id: usize, mean: DVector<f64>, covariance: DMatrix<f64>) -> Result<Self, StateError> {
        let dim = mean.len();
        if dim == 0 {
            return Err(StateError::EmptyMean);
        }
        if covariance.nrows() != dim || covariance.ncols() != dim {
            return Err(StateError::IncompatibleCovariance { dim_mean: dim, dim_covariance: [covariance.nrows(), covariance.ncols()] });
        }
        if mean.iter().chain(covariance.iter()).any(|v| !v.is_finite()) {
            return Err(StateError::NonFiniteParameters);
        }

        let (covariance, cholesky) = Self::decompose(covariance)?;

        let log_det: f64 = 2.0 * cholesky.l_dirty().diagonal().iter().map(|v| v.ln()).sum::<f64>();
        let log_norm = -0.5 * (dim as f64 * (2.0 * PI).ln() + log_det);

        Ok(Self { id, mean, covariance, cholesky, log_norm })
    }

    pub fn new_1d(id: usize, value: f64, noise_std: f64) -> Result<Self, StateError> {
        if noise_std <= 0.0 {
            return Err(StateError::InvalidNoiseInput { input: noise_std });
        }
        Self::new(id, DVector::from_element(1, value), DMatrix::from_element(1, 1, noise_std * noise_std))
    }

    // Cholesky with increasing jitter on the diagonal
    fn decompose(mut covariance: DMatrix<f64>) -> Result<(DMatrix<f64>, Cholesky<f64, Dyn>), StateError> {
        let dim = covariance.nrows();
        let mut jitter = COVARIANCE_JITTER;

        for _ in 0..=MAX_JITTER_TRIALS {
            if let Some(cholesky) = Cholesky::new(covariance.clone()) {
                return Ok((covariance, cholesky));
            }
            for i in 0..dim {
                covariance[(i, i)] += jitter;
            }
            jitter *= 10.0;
        }

        Err(StateError::InvalidCovariance)
    }

    pub fn get_mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn get_covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    pub fn log_emission_probability(&self, observation: &DVector<f64>) -> f64 {
        let diff = observation - &self.mean;
        let whitened = match self.cholesky.l_dirty().solve_lower_triangular(&diff) {
            Some(whitened) => whitened,
            None => return f64::NEG_INFINITY,
        };
        self.log_norm - 0.5 * whitened.norm_squared()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        let z: DVector<f64> = DVector::from_fn(self.dim(), |_, _| StandardNormal.sample(&mut *rng));
        &self.mean + self.cholesky.l() * z
    }
}

pub trait IDTarget {
    fn get_id(&self) -> usize;
}

impl IDTarget for usize {
    fn get_id(&self) -> usize {
        *self
    }
}

impl IDTarget for State {
    fn get_id(&self) -> usize {
        self.id
    }
}

impl IDTarget for &State {
    fn get_id(&self) -> usize {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    #[error("state mean is empty")]
    EmptyMean,
    #[error("mean of dimension {dim_mean} does not match covariance of shape {dim_covariance:?}")]
    IncompatibleCovariance { dim_mean: usize, dim_covariance: [usize; 2] },
    #[error("state parameters contain non-finite values")]
    NonFiniteParameters,
    #[error("covariance is not positive definite")]
    InvalidCovariance,
    #[error("invalid noise standard deviation {input}")]
    InvalidNoiseInput { input: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    // Test the 1D log density against the closed form
    #[test]
    fn test_log_emission_1d() {
        let state = State::new_1d(0, 0.5, 0.1).unwrap();
        let x = DVector::from_element(1, 0.7);

        let expected = -0.5 * ((2.0 * PI).ln() + (0.01_f64).ln()) - 0.5 * (0.2_f64 / 0.1).powi(2);
        assert!((state.log_emission_probability(&x) - expected).abs() < 1e-10);
    }

    // Test that a 2D diagonal covariance factorizes into two 1D densities
    #[test]
    fn test_log_emission_2d_diagonal() {
        let state = State::new(
            1,
            DVector::from_vec(vec![0.0, 1.0]),
            DMatrix::from_row_slice(2, 2, &[0.25, 0.0, 0.0, 4.0]),
        ).unwrap();

        let a = State::new_1d(0, 0.0, 0.5).unwrap();
        let b = State::new_1d(0, 1.0, 2.0).unwrap();

        let x = DVector::from_vec(vec![0.3, -0.5]);
        let joint = state.log_emission_probability(&x);
        let separate = a.log_emission_probability(&DVector::from_element(1, 0.3))
            + b.log_emission_probability(&DVector::from_element(1, -0.5));

        assert!((joint - separate).abs() < 1e-10);
    }

    // Test that a singular covariance is rescued by jitter
    #[test]
    fn test_singular_covariance_gets_jitter() {
        let state = State::new(0, DVector::zeros(2), DMatrix::from_element(2, 2, 1.0));
        assert!(state.is_ok());

        let bad = State::new(0, DVector::zeros(2), DMatrix::zeros(3, 3));
        assert!(matches!(bad, Err(StateError::IncompatibleCovariance { .. })));

        assert!(matches!(State::new_1d(0, 1.0, 0.0), Err(StateError::InvalidNoiseInput { .. })));
    }

    // Test that samples follow the state mean
    #[test]
    fn test_sample_mean() {
        let state = State::new(0, DVector::from_vec(vec![2.0, -1.0]), DMatrix::identity(2, 2) * 0.01).unwrap();
        let mut rng = StdRng::seed_from_u64(7);

        let n = 2000;
        let mut sum = DVector::zeros(2);
        for _ in 0..n {
            sum += state.sample(&mut rng);
        }
        let mean = sum / n as f64;

        assert!((mean[0] - 2.0).abs() < 0.01);
        assert!((mean[1] + 1.0).abs() < 0.01);
    }
}
