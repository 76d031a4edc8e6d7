use nalgebra::DMatrix;
use thiserror::Error;

use crate::tools::all_equal;

use super::hmm_matrices::*;
use super::probability_matrices::*;
use super::state::*;

/// A fully specified model together with the posteriors of one forward-backward pass
pub struct HMMInstance<'a> {
    states: Option<&'a [State]>,
    start_matrix: Option<&'a StartMatrix>,
    transition_matrix: Option<&'a TransitionMatrix>,

    gammas: Option<Vec<Vec<f64>>>,
    xi_sums: Option<Vec<Vec<f64>>>,
    log_likelihood: Option<f64>,
}

impl<'a> HMMInstance<'a> {
    pub fn new(states: &'a [State], start_matrix: &'a StartMatrix, transition_matrix: &'a TransitionMatrix) -> Self {
        Self {
            states: Some(states),
            start_matrix: Some(start_matrix),
            transition_matrix: Some(transition_matrix),

            gammas: None,
            xi_sums: None,
            log_likelihood: None,
        }
    }

    pub fn check_states_validity(states: &[State]) -> Result<(), HMMInstanceError> {
        if states.is_empty() {
            return Err(HMMInstanceError::UndefinedStates);
        }

        let mut ids: Vec<usize> = states.iter().map(|state| state.id).collect();
        ids.sort_unstable();

        for window in ids.windows(2) {
            if window[0] == window[1] {
                return Err(HMMInstanceError::DuplicateStateId { id: window[0] });
            }
        }

        // Ids must form 0..N so they can index the matrices
        for (expected, found) in ids.iter().enumerate() {
            if expected != *found {
                return Err(HMMInstanceError::InvalidStateIdSequence { expected, found: *found });
            }
        }

        if !all_equal(states.iter().map(|state| state.dim())) {
            return Err(HMMInstanceError::InconsistentStateDimensions);
        }

        Ok(())
    }

    pub fn check_start_matrix_validity(start_matrix: &StartMatrix, num_states: usize) -> Result<(), HMMInstanceError> {
        if start_matrix.len() != num_states {
            return Err(HMMInstanceError::IncompatibleDimensions {
                dim_states: Some(num_states),
                dim_start_matrix: Some(start_matrix.len()),
                dim_transition_matrix: None,
            });
        }

        start_matrix.validate().map_err(|error| HMMInstanceError::InvalidMatrix { error })
    }

    pub fn check_transition_matrix_validity(transition_matrix: &TransitionMatrix, num_states: usize) -> Result<(), HMMInstanceError> {
        if transition_matrix.len() != num_states {
            return Err(HMMInstanceError::IncompatibleDimensions {
                dim_states: Some(num_states),
                dim_start_matrix: None,
                dim_transition_matrix: Some([transition_matrix.len(), transition_matrix.matrix.first().map_or(0, |row| row.len())]),
            });
        }

        transition_matrix.validate().map_err(|error| HMMInstanceError::InvalidMatrix { error })
    }

    pub fn check_validity(
        states: &[State],
        start_matrix: &StartMatrix,
        transition_matrix: &TransitionMatrix,
    ) -> Result<(), HMMInstanceError> {
        Self::check_states_validity(states)?;
        Self::check_start_matrix_validity(start_matrix, states.len())?;
        Self::check_transition_matrix_validity(transition_matrix, states.len())
    }

    fn pre_run_validity(&self) -> Result<(&'a [State], &'a StartMatrix, &'a TransitionMatrix), HMMInstanceError> {
        let states = self.states.ok_or(HMMInstanceError::UndefinedStates)?;
        let start_matrix = self.start_matrix.ok_or(HMMInstanceError::UndefinedStartMatrix)?;
        let transition_matrix = self.transition_matrix.ok_or(HMMInstanceError::UndefinedTransitionMatrix)?;

        Self::check_validity(states, start_matrix, transition_matrix)?;

        Ok((states, start_matrix, transition_matrix))
    }

    /// Scaled forward-backward over the rows of `observations`
    pub fn run_forward_backward(&mut self, observations: &DMatrix<f64>) -> Result<(), HMMInstanceError> {
        let (states, start_matrix, transition_matrix) = self.pre_run_validity()?;

        if observations.nrows() == 0 {
            return Err(HMMInstanceError::EmptyObservations);
        }
        if observations.ncols() != states[0].dim() {
            return Err(HMMInstanceError::IncompatibleObservations { dim_states: states[0].dim(), dim_observations: observations.ncols() });
        }

        let emissions = EmissionMatrix::compute(states, observations);

        let (alphas, scaling_factors) = compute_scaled_alphas(&emissions, start_matrix, transition_matrix)
            .ok_or(HMMInstanceError::ZeroLikelihood)?;
        let betas = compute_scaled_betas(&emissions, transition_matrix, &scaling_factors);

        let log_likelihood = log_likelihood_from_scaling(&emissions, &scaling_factors);
        if !log_likelihood.is_finite() {
            return Err(HMMInstanceError::ZeroLikelihood);
        }

        self.xi_sums = Some(compute_xi_sums_with_scaled(&emissions, transition_matrix, &alphas, &betas, &scaling_factors));
        self.gammas = Some(compute_gammas_with_scaled(&alphas, &betas));
        self.log_likelihood = Some(log_likelihood);

        Ok(())
    }

    pub fn get_gammas(&self) -> Option<&Vec<Vec<f64>>> {
        self.gammas.as_ref()
    }

    pub fn take_gammas(&mut self) -> Option<Vec<Vec<f64>>> {
        self.gammas.take()
    }

    pub fn take_xi_sums(&mut self) -> Option<Vec<Vec<f64>>> {
        self.xi_sums.take()
    }

    pub fn get_log_likelihood(&self) -> Option<f64> {
        self.log_likelihood
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HMMInstanceError {
    #[error("states are not defined")]
    UndefinedStates,
    #[error("start matrix is not defined")]
    UndefinedStartMatrix,
    #[error("transition matrix is not defined")]
    UndefinedTransitionMatrix,
    #[error("incompatible dimensions: states {dim_states:?}, start matrix {dim_start_matrix:?}, transition matrix {dim_transition_matrix:?}")]
    IncompatibleDimensions { dim_states: Option<usize>, dim_start_matrix: Option<usize>, dim_transition_matrix: Option<[usize; 2]> },
    #[error("invalid probability matrix: {error}")]
    InvalidMatrix { error: MatrixValidationError },
    #[error("duplicate state id {id}")]
    DuplicateStateId { id: usize },
    #[error("state ids must form 0..N, expected {expected} but found {found}")]
    InvalidStateIdSequence { expected: usize, found: usize },
    #[error("states have emissions of different dimension")]
    InconsistentStateDimensions,
    #[error("states of dimension {dim_states} cannot emit observations of dimension {dim_observations}")]
    IncompatibleObservations { dim_states: usize, dim_observations: usize },
    #[error("no observations")]
    EmptyObservations,
    #[error("sequence has zero likelihood under the model")]
    ZeroLikelihood,
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test state id validation
    #[test]
    fn test_check_states_validity() {
        let good = vec![State::new_1d(1, 1.0, 0.1).unwrap(), State::new_1d(0, 0.0, 0.1).unwrap()];
        assert!(HMMInstance::check_states_validity(&good).is_ok());

        let duplicate = vec![State::new_1d(0, 1.0, 0.1).unwrap(), State::new_1d(0, 0.0, 0.1).unwrap()];
        assert_eq!(HMMInstance::check_states_validity(&duplicate), Err(HMMInstanceError::DuplicateStateId { id: 0 }));

        let gap = vec![State::new_1d(0, 1.0, 0.1).unwrap(), State::new_1d(2, 0.0, 0.1).unwrap()];
        assert_eq!(
            HMMInstance::check_states_validity(&gap),
            Err(HMMInstanceError::InvalidStateIdSequence { expected: 1, found: 2 })
        );
    }

    #[test]
    fn test_incompatible_start_matrix() {
        let start_matrix = StartMatrix::new_balanced(3);
        assert!(matches!(
            HMMInstance::check_start_matrix_validity(&start_matrix, 2),
            Err(HMMInstanceError::IncompatibleDimensions { .. })
        ));
    }

    // Test that a forward-backward run fills posteriors and likelihood
    #[test]
    fn test_forward_backward() {
        let states = vec![State::new_1d(0, 0.0, 0.5).unwrap(), State::new_1d(1, 4.0, 0.5).unwrap()];
        let start_matrix = StartMatrix::new_balanced(2);
        let transition_matrix = TransitionMatrix::new(vec![vec![0.9, 0.1], vec![0.1, 0.9]]);
        let obs = [0.0, 0.1, 4.1, 3.9];
        let observations = DMatrix::from_column_slice(4, 1, &obs);

        let mut instance = HMMInstance::new(&states, &start_matrix, &transition_matrix);
        instance.run_forward_backward(&observations).unwrap();

        let gammas = instance.take_gammas().unwrap();
        assert!(gammas[0][0] > 0.99);
        assert!(gammas[1][3] > 0.99);
        assert!(instance.get_log_likelihood().unwrap().is_finite());
    }

    #[test]
    fn test_dimension_mismatch() {
        let states = vec![State::new_1d(0, 0.0, 0.5).unwrap()];
        let start_matrix = StartMatrix::new_balanced(1);
        let transition_matrix = TransitionMatrix::new_balanced(1);
        let observations = DMatrix::from_element(3, 2, 0.0);

        let mut instance = HMMInstance::new(&states, &start_matrix, &transition_matrix);
        assert_eq!(
            instance.run_forward_backward(&observations),
            Err(HMMInstanceError::IncompatibleObservations { dim_states: 1, dim_observations: 2 })
        );
    }
}
