use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use crate::config::AnalysisConfig;

use super::baum_welch::{BaumWelch, BaumWelchError, COVARIANCE_FLOOR};
use super::hmm_matrices::{StartMatrix, TransitionMatrix};
use super::kmeans::{k_means, KMeansError, KMEANS_SEED};
use super::occams_razor::*;
use super::optimization_tracker::TerminationCriterium;
use super::state::{State, StateError};

const KMEANS_MAX_ITERS: usize = 100;
const KMEANS_TOLERANCE: f64 = 1e-6;

/// Trained parameters for one model order
#[derive(Debug, Clone)]
pub struct FittedModel {
    pub states: Vec<State>,
    pub start_matrix: StartMatrix,
    pub transition_matrix: TransitionMatrix,
    pub log_likelihood: f64,
}

#[derive(Debug, Clone)]
pub struct HMMNumStatesFinder {
    max_k: usize,
    bic_tolerance: f64,
    max_iterations: usize,
    tolerance: f64,
}

impl HMMNumStatesFinder {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            max_k: config.max_hmm_states,
            bic_tolerance: config.bic_tolerance,
            max_iterations: config.hmm_max_iterations,
            tolerance: config.hmm_tolerance,
        }
    }

    // Seeded k-means centers, shared covariance of the whole sequence
    pub fn initial_states(features: &DMatrix<f64>, k: usize) -> Result<Vec<State>, HMMNumStatesFinderError> {
        let (centers, _) = k_means(features, k, KMEANS_MAX_ITERS, KMEANS_TOLERANCE, KMEANS_SEED)
            .map_err(|err| HMMNumStatesFinderError::KMeansError { err })?;

        let n = features.nrows() as f64;
        let dim = features.ncols();
        let mean: DVector<f64> = features.row_mean().transpose();

        let mut covariance = DMatrix::zeros(dim, dim);
        for row in features.row_iter() {
            let diff = row.transpose() - &mean;
            covariance += &diff * diff.transpose();
        }
        covariance /= n;
        for i in 0..dim {
            covariance[(i, i)] += COVARIANCE_FLOOR;
        }

        centers.into_iter()
            .enumerate()
            .map(|(id, center)| State::new(id, center, covariance.clone()))
            .collect::<Result<Vec<State>, StateError>>()
            .map_err(|err| HMMNumStatesFinderError::StateError { err })
    }

    pub fn fit_order(&self, features: &DMatrix<f64>, k: usize) -> Result<FittedModel, HMMNumStatesFinderError> {
        let states = Self::initial_states(features, k)?;

        let mut baum_welch = BaumWelch::new(k);
        baum_welch.set_initial_states(states).map_err(|err| HMMNumStatesFinderError::BaumWelchError { err })?;
        baum_welch.set_initial_start_matrix(StartMatrix::new_balanced(k)).map_err(|err| HMMNumStatesFinderError::BaumWelchError { err })?;
        baum_welch.set_initial_transition_matrix(TransitionMatrix::new_balanced(k)).map_err(|err| HMMNumStatesFinderError::BaumWelchError { err })?;

        let criterium = TerminationCriterium::OneStepConvergenceAbsolute {
            epsilon: self.tolerance,
            max_iterations: self.max_iterations,
        };
        baum_welch.run_optimization(features, criterium).map_err(|err| HMMNumStatesFinderError::BaumWelchError { err })?;

        Ok(FittedModel {
            states: baum_welch.take_states().ok_or(HMMNumStatesFinderError::MissingModel)?,
            start_matrix: baum_welch.take_start_matrix().ok_or(HMMNumStatesFinderError::MissingModel)?,
            transition_matrix: baum_welch.take_transition_matrix().ok_or(HMMNumStatesFinderError::MissingModel)?,
            log_likelihood: baum_welch.take_log_likelihood().ok_or(HMMNumStatesFinderError::MissingModel)?,
        })
    }

    /// Fits k = 1..=max_k and returns the chosen model, its order and every BIC score.
    /// A failed order scores `BIC_SENTINEL` and the loop carries on.
    pub fn get_number_of_states(&self, features: &DMatrix<f64>) -> Result<(usize, FittedModel, Vec<f64>), HMMNumStatesFinderError> {
        if features.nrows() == 0 {
            return Err(HMMNumStatesFinderError::EmptySequence);
        }
        if self.max_k == 0 {
            return Err(HMMNumStatesFinderError::InvalidInput);
        }

        let n_samples = features.nrows();
        let mut models: Vec<Option<FittedModel>> = Vec::with_capacity(self.max_k);
        let mut bics = Vec::with_capacity(self.max_k);

        for k in 1..=self.max_k {
            match self.fit_order(features, k) {
                Ok(model) if model.log_likelihood.is_finite() => {
                    bics.push(compute_bic(model.log_likelihood, k, n_samples));
                    models.push(Some(model));
                }
                Ok(_) => {
                    log::debug!("{k} state model has a non-finite likelihood");
                    bics.push(BIC_SENTINEL);
                    models.push(None);
                }
                Err(err) => {
                    log::debug!("{k} state model could not be fitted: {err}");
                    bics.push(BIC_SENTINEL);
                    models.push(None);
                }
            }
        }

        let best = heuristic_bic(&bics, self.bic_tolerance).ok_or(HMMNumStatesFinderError::NoValidModel)?;
        let model = models.get_mut(best).and_then(Option::take).ok_or(HMMNumStatesFinderError::NoValidModel)?;

        Ok((best + 1, model, bics))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HMMNumStatesFinderError {
    #[error("sequence is empty")]
    EmptySequence,
    #[error("maximum number of states must be at least 1")]
    InvalidInput,
    #[error("{err}")]
    KMeansError { err: KMeansError },
    #[error("{err}")]
    StateError { err: StateError },
    #[error("{err}")]
    BaumWelchError { err: BaumWelchError },
    #[error("optimizer returned no model")]
    MissingModel,
    #[error("no model order could be fitted")]
    NoValidModel,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn two_level_features(n: usize) -> DMatrix<f64> {
        let mut rng = StdRng::seed_from_u64(11);
        let noise = Normal::new(0.0, 0.2).unwrap();

        let values: Vec<f64> = (0..n)
            .map(|t| if (t / 50) % 2 == 0 { 0.0 } else { 2.0 })
            .map(|level| level + noise.sample(&mut rng))
            .collect();

        DMatrix::from_column_slice(n, 1, &values)
    }

    // Test that two well separated levels select two states
    #[test]
    fn test_selects_two_states() {
        let features = two_level_features(400);
        let finder = HMMNumStatesFinder::new(&AnalysisConfig::default());

        let (k, model, bics) = finder.get_number_of_states(&features).unwrap();
        assert_eq!(k, 2);
        assert_eq!(bics.len(), 3);
        assert_eq!(model.states.len(), 2);

        let mut means: Vec<f64> = model.states.iter().map(|s| s.get_mean()[0]).collect();
        means.sort_by(|a, b| a.total_cmp(b));
        assert!((means[0] - 0.0).abs() < 0.1);
        assert!((means[1] - 2.0).abs() < 0.1);
    }

    // Test that orders with more states than frames fall back to the sentinel
    #[test]
    fn test_short_sequence_uses_sentinel() {
        let features = DMatrix::from_column_slice(2, 1, &[0.0, 1.0]);
        let finder = HMMNumStatesFinder::new(&AnalysisConfig::default());

        let (k, _, bics) = finder.get_number_of_states(&features).unwrap();
        assert_eq!(bics[2], BIC_SENTINEL);
        assert!(k <= 2);
    }

    #[test]
    fn test_empty_sequence() {
        let finder = HMMNumStatesFinder::new(&AnalysisConfig::default());
        let features = DMatrix::<f64>::zeros(0, 2);
        assert!(matches!(finder.get_number_of_states(&features), Err(HMMNumStatesFinderError::EmptySequence)));
    }
}
