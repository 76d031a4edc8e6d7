use std::f64::consts::PI;
use std::ops::RangeInclusive;
use std::str::FromStr;

use thiserror::Error;

use crate::config::{ConfigError, GAUSSIAN_MAX_STATES_DEFAULT};
use crate::signal_analysis::hmm::kmeans::{k_means_1d, KMeansError};

const REG_COVAR: f64 = 1e-6;
const EM_TOLERANCE: f64 = 1e-3;
const EM_MAX_ITERATIONS: usize = 100;
const KMEANS_MAX_ITERATIONS: usize = 100;
const KMEANS_TOLERANCE: f64 = 1e-8;
// Keeps empty components from dividing by zero
const MIN_RESPONSIBILITY: f64 = 10.0 * f64::EPSILON;

/// Number of components of a fit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MixtureOrder {
    Fixed(usize),
    Auto(RangeInclusive<usize>), // Best by BIC
}

impl MixtureOrder {
    pub fn auto(max_components: usize) -> Self {
        Self::Auto(1..=max_components)
    }
}

impl FromStr for MixtureOrder {
    type Err = ConfigError;

    /// "auto", "auto:N", or a fixed component count
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unknown = || ConfigError::UnknownMode { kind: "mixture order", mode: s.to_string() };
        let s = s.trim();

        if s == "auto" {
            return Ok(Self::auto(GAUSSIAN_MAX_STATES_DEFAULT));
        }
        if let Some(max) = s.strip_prefix("auto:") {
            let max: usize = max.parse().map_err(|_| unknown())?;
            return if max == 0 { Err(unknown()) } else { Ok(Self::auto(max)) };
        }

        match s.parse::<usize>() {
            Ok(k) if k > 0 => Ok(Self::Fixed(k)),
            _ => Err(unknown()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMixtureFit {
    pub params: Vec<(f64, f64, f64)>, // (mean, std, weight), sorted by mean
    pub bics: Vec<f64>,               // Empty for a fixed order
    pub best_k: Option<usize>,        // None for a fixed order
    pub log_likelihood: f64,
}

impl GaussianMixtureFit {
    /// Weighted mixture density at `x`
    pub fn pdf(&self, x: f64) -> f64 {
        self.params.iter()
            .map(|(mean, std, weight)| weight * normal_pdf(x, *mean, *std))
            .sum()
    }
}

fn normal_pdf(x: f64, mean: f64, std: f64) -> f64 {
    (-0.5 * ((x - mean) / std).powi(2)).exp() / (std * (2.0 * PI).sqrt())
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

// One component set mid-EM
struct Mixture {
    means: Vec<f64>,
    variances: Vec<f64>,
    weights: Vec<f64>,
}

impl Mixture {
    // Hard k-means labels turned into the first parameter guess
    fn initialize(values: &[f64], k: usize) -> Result<Self, MixtureError> {
        let (_, labels) = k_means_1d(values, k, KMEANS_MAX_ITERATIONS, KMEANS_TOLERANCE)
            .map_err(|err| MixtureError::KMeansError { err })?;

        let responsibilities: Vec<Vec<f64>> = labels.iter()
            .map(|label| (0..k).map(|c| if c == *label { 1.0 } else { 0.0 }).collect())
            .collect();

        Ok(Self::maximize(values, &responsibilities, k))
    }

    fn maximize(values: &[f64], responsibilities: &[Vec<f64>], k: usize) -> Self {
        let n = values.len() as f64;
        let mut means = vec![0.0; k];
        let mut variances = vec![0.0; k];
        let mut weights = vec![0.0; k];

        for c in 0..k {
            let n_c: f64 = responsibilities.iter().map(|r| r[c]).sum::<f64>() + MIN_RESPONSIBILITY;
            let mean = responsibilities.iter().zip(values).map(|(r, x)| r[c] * x).sum::<f64>() / n_c;
            let variance = responsibilities.iter()
                .zip(values)
                .map(|(r, x)| r[c] * (x - mean).powi(2))
                .sum::<f64>() / n_c;

            means[c] = mean;
            variances[c] = variance + REG_COVAR;
            weights[c] = n_c / n;
        }

        Self { means, variances, weights }
    }

    // Responsibilities and the total log-likelihood
    fn expectation(&self, values: &[f64]) -> (Vec<Vec<f64>>, f64) {
        let mut log_likelihood = 0.0;
        let mut log_prob = vec![0.0; self.means.len()];

        let responsibilities = values.iter()
            .map(|x| {
                for (c, lp) in log_prob.iter_mut().enumerate() {
                    let var = self.variances[c];
                    *lp = self.weights[c].ln() - 0.5 * ((2.0 * PI * var).ln() + (x - self.means[c]).powi(2) / var);
                }
                let norm = log_sum_exp(&log_prob);
                log_likelihood += norm;
                log_prob.iter().map(|lp| (lp - norm).exp()).collect()
            })
            .collect();

        (responsibilities, log_likelihood)
    }
}

// EM until the per-sample log-likelihood gain drops below tolerance
fn fit_components(values: &[f64], k: usize) -> Result<(Vec<(f64, f64, f64)>, f64), MixtureError> {
    let mut mixture = Mixture::initialize(values, k)?;
    let n = values.len() as f64;

    let mut previous = f64::NEG_INFINITY;
    let mut log_likelihood = f64::NEG_INFINITY;

    for iteration in 0..EM_MAX_ITERATIONS {
        let (responsibilities, new_log_likelihood) = mixture.expectation(values);
        if !new_log_likelihood.is_finite() {
            return Err(MixtureError::NonFiniteLikelihood { k });
        }
        log_likelihood = new_log_likelihood;

        if (log_likelihood / n - previous / n).abs() < EM_TOLERANCE {
            log::debug!("Mixture of {} converged after {} iterations", k, iteration);
            break;
        }
        previous = log_likelihood;

        mixture = Mixture::maximize(values, &responsibilities, k);
    }

    let mut params: Vec<(f64, f64, f64)> = (0..k)
        .map(|c| (mixture.means[c], mixture.variances[c].sqrt(), mixture.weights[c]))
        .collect();
    params.sort_by(|a, b| a.0.total_cmp(&b.0));

    Ok((params, log_likelihood))
}

/// BIC of a 1D mixture with k components, 3k - 1 free parameters
pub fn mixture_bic(log_likelihood: f64, k: usize, num_samples: usize) -> f64 {
    let num_parameters = 3 * k - 1;
    -2.0 * log_likelihood + num_parameters as f64 * (num_samples as f64).ln()
}

/// Fits a 1D Gaussian mixture to `values`. Fewer than two samples give `Ok(None)`.
/// In auto mode every order is scored and the lowest BIC wins; orders with
/// more components than samples score infinity.
pub fn fit_gaussian_mixture(values: &[f64], order: MixtureOrder) -> Result<Option<GaussianMixtureFit>, MixtureError> {
    if values.len() < 2 {
        return Ok(None);
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(MixtureError::NonFiniteValues);
    }

    match order {
        MixtureOrder::Fixed(k) => {
            if k == 0 {
                return Err(MixtureError::ZeroComponents);
            }
            if k > values.len() {
                return Err(MixtureError::TooFewSamples { k, num_samples: values.len() });
            }

            let (params, log_likelihood) = fit_components(values, k)?;
            Ok(Some(GaussianMixtureFit { params, bics: Vec::new(), best_k: None, log_likelihood }))
        }
        MixtureOrder::Auto(range) => {
            if range.is_empty() || *range.start() == 0 {
                return Err(MixtureError::InvalidRange { start: *range.start(), end: *range.end() });
            }

            let mut bics = Vec::with_capacity(range.clone().count());
            let mut best: Option<(usize, Vec<(f64, f64, f64)>, f64)> = None;
            let mut best_bic = f64::INFINITY;

            for k in range {
                if k > values.len() {
                    bics.push(f64::INFINITY);
                    continue;
                }

                let (params, log_likelihood) = fit_components(values, k)?;
                let bic = mixture_bic(log_likelihood, k, values.len());
                bics.push(bic);

                if bic < best_bic || best.is_none() {
                    best_bic = bic;
                    best = Some((k, params, log_likelihood));
                }
            }

            let (best_k, params, log_likelihood) = best.ok_or(MixtureError::NoValidOrder)?;
            Ok(Some(GaussianMixtureFit { params, bics, best_k: Some(best_k), log_likelihood }))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MixtureError {
    #[error("a mixture needs at least one component")]
    ZeroComponents,
    #[error("cannot fit {k} components to {num_samples} samples")]
    TooFewSamples { k: usize, num_samples: usize },
    #[error("invalid order range {start}..={end}")]
    InvalidRange { start: usize, end: usize },
    #[error("values must be finite")]
    NonFiniteValues,
    #[error("mixture of {k} components has a non-finite likelihood")]
    NonFiniteLikelihood { k: usize },
    #[error("no order in range could be fitted")]
    NoValidOrder,
    #[error("{err}")]
    KMeansError { err: KMeansError },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn two_clusters() -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(7);
        let low = Normal::new(0.2, 0.03).unwrap();
        let high = Normal::new(0.7, 0.05).unwrap();

        let mut values: Vec<f64> = (0..300).map(|_| low.sample(&mut rng)).collect();
        values.extend((0..300).map(|_| high.sample(&mut rng)));
        values
    }

    // Test that BIC picks two components for two separated clusters
    #[test]
    fn test_auto_order_two_clusters() {
        let fit = fit_gaussian_mixture(&two_clusters(), MixtureOrder::auto(4)).unwrap().unwrap();

        assert_eq!(fit.best_k, Some(2));
        assert_eq!(fit.bics.len(), 4);
        assert_eq!(fit.params.len(), 2);

        let (m0, s0, w0) = fit.params[0];
        let (m1, s1, w1) = fit.params[1];
        assert!((m0 - 0.2).abs() < 0.02);
        assert!((m1 - 0.7).abs() < 0.02);
        assert!((s0 - 0.03).abs() < 0.01);
        assert!((s1 - 0.05).abs() < 0.01);
        assert!((w0 + w1 - 1.0).abs() < 1e-9);
        assert!((w0 - 0.5).abs() < 0.05);
    }

    // Test that refitting a fixed order on the same sample repeats the result
    #[test]
    fn test_fixed_order_is_repeatable() {
        let values = two_clusters();
        let first = fit_gaussian_mixture(&values, MixtureOrder::Fixed(2)).unwrap().unwrap();
        let second = fit_gaussian_mixture(&values, MixtureOrder::Fixed(2)).unwrap().unwrap();

        assert_eq!(first.best_k, None);
        assert_eq!(second.best_k, None);
        assert!(first.bics.is_empty() && second.bics.is_empty());
        assert_eq!(first.params, second.params);
        assert_eq!(first.log_likelihood, second.log_likelihood);
    }

    // Test that one component reproduces the sample moments
    #[test]
    fn test_fixed_single_component() {
        let values = vec![1.0, 2.0, 3.0, 4.0];
        let fit = fit_gaussian_mixture(&values, MixtureOrder::Fixed(1)).unwrap().unwrap();

        assert!(fit.bics.is_empty());
        assert_eq!(fit.best_k, None);

        let (mean, std, weight) = fit.params[0];
        assert!((mean - 2.5).abs() < 1e-9);
        assert!((std - (1.25_f64 + REG_COVAR).sqrt()).abs() < 1e-6);
        assert!((weight - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_too_few_samples() {
        assert_eq!(fit_gaussian_mixture(&[0.5], MixtureOrder::Fixed(1)), Ok(None));
        assert_eq!(fit_gaussian_mixture(&[], MixtureOrder::auto(3)), Ok(None));

        // More components than samples score infinity in auto mode
        let fit = fit_gaussian_mixture(&[0.1, 0.9], MixtureOrder::auto(3)).unwrap().unwrap();
        assert_eq!(fit.bics[2], f64::INFINITY);

        assert!(fit_gaussian_mixture(&[0.1, 0.9], MixtureOrder::Fixed(3)).is_err());
    }

    #[test]
    fn test_mixture_order_from_str() {
        assert_eq!("auto".parse::<MixtureOrder>().unwrap(), MixtureOrder::Auto(1..=GAUSSIAN_MAX_STATES_DEFAULT));
        assert_eq!("auto:3".parse::<MixtureOrder>().unwrap(), MixtureOrder::Auto(1..=3));
        assert_eq!("2".parse::<MixtureOrder>().unwrap(), MixtureOrder::Fixed(2));
        assert!("0".parse::<MixtureOrder>().is_err());
        assert!("many".parse::<MixtureOrder>().is_err());
    }

    #[test]
    fn test_mixture_pdf_integrates_to_one() {
        let fit = fit_gaussian_mixture(&two_clusters(), MixtureOrder::Fixed(2)).unwrap().unwrap();
        let dx = 0.001;
        let area: f64 = (0..2000).map(|i| fit.pdf(-0.5 + i as f64 * dx) * dx).sum();
        assert!((area - 1.0).abs() < 1e-3);
    }
}
