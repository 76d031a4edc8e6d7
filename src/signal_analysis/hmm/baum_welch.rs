use nalgebra::{DMatrix, DVector};
use thiserror::Error;

use super::hmm_instance::*;
use super::hmm_matrices::*;
use super::optimization_tracker::*;
use super::state::*;

// Added to every covariance diagonal after the M-step
pub const COVARIANCE_FLOOR: f64 = 1e-3;
// States with less posterior mass than this keep their previous parameters
const MIN_STATE_WEIGHT: f64 = 1e-10;

pub struct BaumWelch {
    num_states: usize,

    initial_states: Option<Vec<State>>,
    initial_start_matrix: Option<StartMatrix>,
    initial_transition_matrix: Option<TransitionMatrix>,

    final_states: Option<Vec<State>>,
    final_start_matrix: Option<StartMatrix>,
    final_transition_matrix: Option<TransitionMatrix>,
    final_log_likelihood: Option<f64>,
    iterations: usize,
}

impl BaumWelch {
    pub fn new(num_states: usize) -> Self {
        Self {
            num_states,

            initial_states: None,
            initial_start_matrix: None,
            initial_transition_matrix: None,

            final_states: None,
            final_start_matrix: None,
            final_transition_matrix: None,
            final_log_likelihood: None,
            iterations: 0,
        }
    }

    pub fn set_initial_states(&mut self, states: Vec<State>) -> Result<(), BaumWelchError> {
        let given = states.len();
        if given != self.num_states {
            return Err(BaumWelchError::IncorrectNumberOfInitialStates { expected: self.num_states, given });
        }

        HMMInstance::check_states_validity(&states)
            .map_err(|error| BaumWelchError::InvalidInitialStateSet { error })?;

        self.initial_states = Some(states);

        Ok(())
    }

    pub fn set_initial_start_matrix(&mut self, start_matrix: StartMatrix) -> Result<(), BaumWelchError> {
        HMMInstance::check_start_matrix_validity(&start_matrix, self.num_states)
            .map_err(|error| BaumWelchError::InvalidInitialStartMatrix { error })?;

        self.initial_start_matrix = Some(start_matrix);

        Ok(())
    }

    pub fn set_initial_transition_matrix(&mut self, transition_matrix: TransitionMatrix) -> Result<(), BaumWelchError> {
        HMMInstance::check_transition_matrix_validity(&transition_matrix, self.num_states)
            .map_err(|error| BaumWelchError::InvalidInitialTransitionMatrix { error })?;

        self.initial_transition_matrix = Some(transition_matrix);

        Ok(())
    }

    pub fn update_start_matrix(gammas: &[Vec<f64>]) -> StartMatrix {
        let first: Vec<f64> = gammas.iter().map(|gamma| gamma[0]).collect();
        let total: f64 = first.iter().sum();

        StartMatrix::new(first.iter().map(|g| g / total).collect())
    }

    pub fn update_transition_matrix(xi_sums: &[Vec<f64>], previous: &TransitionMatrix) -> TransitionMatrix {
        let matrix = xi_sums.iter()
            .zip(&previous.matrix)
            .map(|(row, previous_row)| {
                let total: f64 = row.iter().sum();
                // A state that is never left keeps its old row
                if total > MIN_STATE_WEIGHT {
                    row.iter().map(|xi| xi / total).collect()
                } else {
                    previous_row.clone()
                }
            })
            .collect();

        TransitionMatrix::new(matrix)
    }

    /// Posterior weighted means and covariances
    pub fn update_states(states: &[State], gammas: &[Vec<f64>], observations: &DMatrix<f64>) -> Vec<State> {
        let dim = observations.ncols();

        states.iter()
            .map(|state| {
                let weights = &gammas[state.id];
                let total: f64 = weights.iter().sum();
                if total < MIN_STATE_WEIGHT {
                    return state.clone();
                }

                let mut mean = DVector::zeros(dim);
                for (t, w) in weights.iter().enumerate() {
                    mean += observations.row(t).transpose() * *w;
                }
                mean /= total;

                let mut covariance = DMatrix::zeros(dim, dim);
                for (t, w) in weights.iter().enumerate() {
                    let diff = observations.row(t).transpose() - &mean;
                    covariance += (&diff * diff.transpose()) * *w;
                }
                covariance /= total;
                for i in 0..dim {
                    covariance[(i, i)] += COVARIANCE_FLOOR;
                }

                State::new(state.id, mean, covariance).unwrap_or_else(|_| state.clone())
            })
            .collect()
    }

    pub fn run_optimization(&mut self, observations: &DMatrix<f64>, termination_criterium: TerminationCriterium) -> Result<(), BaumWelchError> {
        let mut states = self.initial_states.clone().ok_or(BaumWelchError::UndefinedInitialStates)?;
        let mut start_matrix = self.initial_start_matrix.clone().unwrap_or_else(|| StartMatrix::new_balanced(self.num_states));
        let mut transition_matrix = self.initial_transition_matrix.clone().unwrap_or_else(|| TransitionMatrix::new_balanced(self.num_states));

        let mut tracker = OptimizationTracker::new(termination_criterium);

        loop {
            let mut instance = HMMInstance::new(&states, &start_matrix, &transition_matrix);
            instance.run_forward_backward(observations)
                .map_err(|error| BaumWelchError::HMMInstanceError { error })?;

            let log_likelihood = instance.get_log_likelihood().ok_or(BaumWelchError::LogLikelihoodNotFound)?;
            let gammas = instance.take_gammas().ok_or(BaumWelchError::HMMGammasNotFound)?;
            let xi_sums = instance.take_xi_sums().ok_or(BaumWelchError::HMMXisNotFound)?;

            if tracker.step(log_likelihood) {
                self.final_log_likelihood = Some(log_likelihood);
                break;
            }

            let new_states = Self::update_states(&states, &gammas, observations);
            let new_start_matrix = Self::update_start_matrix(&gammas);
            let new_transition_matrix = Self::update_transition_matrix(&xi_sums, &transition_matrix);

            states = new_states;
            start_matrix = new_start_matrix;
            transition_matrix = new_transition_matrix;
        }

        self.iterations = tracker.get_iterations();
        log::debug!("Baum-Welch with {} states stopped after {} iterations", self.num_states, self.iterations);

        self.final_states = Some(states);
        self.final_start_matrix = Some(start_matrix);
        self.final_transition_matrix = Some(transition_matrix);

        Ok(())
    }

    pub fn take_states(&mut self) -> Option<Vec<State>> {
        self.final_states.take()
    }

    pub fn take_start_matrix(&mut self) -> Option<StartMatrix> {
        self.final_start_matrix.take()
    }

    pub fn take_transition_matrix(&mut self) -> Option<TransitionMatrix> {
        self.final_transition_matrix.take()
    }

    pub fn take_log_likelihood(&mut self) -> Option<f64> {
        self.final_log_likelihood.take()
    }

    pub fn get_iterations(&self) -> usize {
        self.iterations
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BaumWelchError {
    #[error("expected {expected} initial states, got {given}")]
    IncorrectNumberOfInitialStates { expected: usize, given: usize },
    #[error("invalid initial states: {error}")]
    InvalidInitialStateSet { error: HMMInstanceError },
    #[error("invalid initial start matrix: {error}")]
    InvalidInitialStartMatrix { error: HMMInstanceError },
    #[error("invalid initial transition matrix: {error}")]
    InvalidInitialTransitionMatrix { error: HMMInstanceError },
    #[error("initial states are not defined")]
    UndefinedInitialStates,
    #[error("{error}")]
    HMMInstanceError { error: HMMInstanceError },
    #[error("log-likelihood missing after forward-backward")]
    LogLikelihoodNotFound,
    #[error("posteriors missing after forward-backward")]
    HMMGammasNotFound,
    #[error("transition posteriors missing after forward-backward")]
    HMMXisNotFound,
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::HMM;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    // Test that EM recovers the means of a simulated two state sequence
    #[test]
    fn test_baum_welch_recovers_levels() {
        let real_states = vec![State::new_1d(0, 0.0, 0.3).unwrap(), State::new_1d(1, 3.0, 0.3).unwrap()];
        let real_start = StartMatrix::new_balanced(2);
        let real_transition = TransitionMatrix::new(vec![vec![0.95, 0.05], vec![0.05, 0.95]]);

        let mut rng = StdRng::seed_from_u64(7);
        let (_, values) = HMM::gen_sequence(&real_states, &real_start, &real_transition, 500, &mut rng);
        let observations = DMatrix::from_row_slice(values.len(), 1, &values.iter().map(|v| v[0]).collect::<Vec<f64>>());

        let mut baum_welch = BaumWelch::new(2);
        baum_welch.set_initial_states(vec![State::new_1d(0, -0.5, 1.0).unwrap(), State::new_1d(1, 2.0, 1.0).unwrap()]).unwrap();
        baum_welch.run_optimization(&observations, TerminationCriterium::OneStepConvergenceAbsolute { epsilon: 1e-4, max_iterations: 200 }).unwrap();

        let states = baum_welch.take_states().unwrap();
        assert!((states[0].get_mean()[0] - 0.0).abs() < 0.1);
        assert!((states[1].get_mean()[0] - 3.0).abs() < 0.1);

        let transition_matrix = baum_welch.take_transition_matrix().unwrap();
        assert!(transition_matrix.validate().is_ok());
        assert!(transition_matrix[(0_usize, 0_usize)] > 0.8);
        assert!(baum_welch.take_log_likelihood().unwrap().is_finite());
    }

    // Test that a state with no posterior mass keeps its parameters
    #[test]
    fn test_collapsed_state_is_kept() {
        let states = vec![State::new_1d(0, 0.0, 1.0).unwrap(), State::new_1d(1, 100.0, 1.0).unwrap()];
        let gammas = vec![vec![1.0; 4], vec![0.0; 4]];
        let observations = DMatrix::from_column_slice(4, 1, &[0.1, -0.1, 0.2, 0.0]);

        let updated = BaumWelch::update_states(&states, &gammas, &observations);
        assert_eq!(updated[1].get_mean()[0], 100.0);
        assert!((updated[0].get_mean()[0] - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_wrong_number_of_states() {
        let mut baum_welch = BaumWelch::new(3);
        let result = baum_welch.set_initial_states(vec![State::new_1d(0, 0.0, 1.0).unwrap()]);
        assert_eq!(result, Err(BaumWelchError::IncorrectNumberOfInitialStates { expected: 3, given: 1 }));
    }
}
