use nalgebra::DMatrix;
use thiserror::Error;

use super::hmm_matrices::{MatrixValidationError, ProbabilityMatrix, StartMatrix, TransitionMatrix};
use super::probability_matrices::EmissionMatrix;
use super::state::*;

pub struct Viterbi<'a> {
    states: Option<&'a [State]>,
    start_matrix: Option<&'a StartMatrix>,
    transition_matrix: Option<&'a TransitionMatrix>,

    ml_path: Option<Vec<usize>>,
    ml_log_prob: Option<f64>,
}

impl<'a> Viterbi<'a> {
    pub fn new(states: &'a [State], start_matrix: &'a StartMatrix, transition_matrix: &'a TransitionMatrix) -> Self {
        Self {
            states: Some(states),
            start_matrix: Some(start_matrix),
            transition_matrix: Some(transition_matrix),

            ml_path: None,
            ml_log_prob: None,
        }
    }

    pub fn new_empty() -> Self {
        Self {
            states: None,
            start_matrix: None,
            transition_matrix: None,

            ml_path: None,
            ml_log_prob: None,
        }
    }

    pub fn set_states(&mut self, states: &'a [State]) {
        self.states = Some(states);
    }

    pub fn set_start_matrix(&mut self, start_matrix: &'a StartMatrix) {
        self.start_matrix = Some(start_matrix);
    }

    pub fn set_transition_matrix(&mut self, transition_matrix: &'a TransitionMatrix) {
        self.transition_matrix = Some(transition_matrix);
    }

    pub fn pre_run_validity(&self) -> Result<(&'a [State], &'a StartMatrix, &'a TransitionMatrix), ViterbiError> {
        let states = self.states.ok_or(ViterbiError::UndefinedStates)?;
        let start_matrix = self.start_matrix.ok_or(ViterbiError::UndefinedStartMatrix)?;
        let transition_matrix = self.transition_matrix.ok_or(ViterbiError::UndefinedTransitionMatrix)?;

        let dim_states = states.len();
        if start_matrix.len() != dim_states || transition_matrix.len() != dim_states {
            return Err(ViterbiError::IncompatibleDimensions {
                dim_states,
                dim_start_matrix: start_matrix.len(),
                dim_transition_matrix: transition_matrix.len(),
            });
        }

        start_matrix.validate().map_err(|error| ViterbiError::InvalidMatrix { error })?;
        transition_matrix.validate().map_err(|error| ViterbiError::InvalidMatrix { error })?;

        Ok((states, start_matrix, transition_matrix))
    }

    /// Most likely state path in log space. Observations are the rows of the matrix.
    pub fn run(&mut self, observations: &DMatrix<f64>) -> Result<(), ViterbiError> {
        let (states, start_matrix, transition_matrix) = self.pre_run_validity()?;

        let num_observations = observations.nrows();
        if num_observations == 0 {
            return Err(ViterbiError::EmptyObservations);
        }

        let num_states = states.len();
        let emissions = EmissionMatrix::compute(states, observations);
        let log_emission = |state: usize, t: usize| emissions.scaled[state][t].ln() + emissions.log_shifts[t];

        let log_transition: Vec<Vec<f64>> = transition_matrix.matrix.iter()
            .map(|row| row.iter().map(|p| p.ln()).collect())
            .collect();

        let mut viterbi_probs = vec![vec![f64::NEG_INFINITY; num_observations]; num_states];
        let mut backtrace = vec![vec![0_usize; num_observations]; num_states];

        for state in states {
            viterbi_probs[state.id][0] = start_matrix[state].ln() + log_emission(state.id, 0);
        }

        for t in 1..num_observations {
            for next_state in states {
                let mut max_prob = f64::NEG_INFINITY;
                let mut best_prev_state = 0;

                for previous_state in states {
                    let total_prob = viterbi_probs[previous_state.id][t - 1] + log_transition[previous_state.id][next_state.id];
                    if total_prob > max_prob {
                        max_prob = total_prob;
                        best_prev_state = previous_state.id;
                    }
                }

                viterbi_probs[next_state.id][t] = max_prob + log_emission(next_state.id, t);
                backtrace[next_state.id][t] = best_prev_state;
            }
        }

        // Best final state, then follow the backtrace
        let (mut last_state, mut max_final_prob) = (0, f64::NEG_INFINITY);
        for state in states {
            let final_prob = viterbi_probs[state.id][num_observations - 1];
            if final_prob > max_final_prob {
                max_final_prob = final_prob;
                last_state = state.id;
            }
        }

        if !max_final_prob.is_finite() {
            return Err(ViterbiError::NoFeasiblePath);
        }

        let mut ml_path = vec![0; num_observations];
        ml_path[num_observations - 1] = last_state;
        for t in (1..num_observations).rev() {
            ml_path[t - 1] = backtrace[ml_path[t]][t];
        }

        self.ml_path = Some(ml_path);
        self.ml_log_prob = Some(max_final_prob);

        Ok(())
    }

    pub fn get_prediction(&self) -> Option<&Vec<usize>> {
        self.ml_path.as_ref()
    }

    pub fn take_prediction(&mut self) -> Option<Vec<usize>> {
        self.ml_path.take()
    }

    pub fn get_log_probability(&self) -> Option<f64> {
        self.ml_log_prob
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ViterbiError {
    #[error("states are not defined")]
    UndefinedStates,
    #[error("start matrix is not defined")]
    UndefinedStartMatrix,
    #[error("transition matrix is not defined")]
    UndefinedTransitionMatrix,
    #[error("{dim_states} states but start matrix of size {dim_start_matrix} and transition matrix of size {dim_transition_matrix}")]
    IncompatibleDimensions { dim_states: usize, dim_start_matrix: usize, dim_transition_matrix: usize },
    #[error("invalid probability matrix: {error}")]
    InvalidMatrix { error: MatrixValidationError },
    #[error("no observations to decode")]
    EmptyObservations,
    #[error("every state path has zero probability")]
    NoFeasiblePath,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Vec<State>, StartMatrix, TransitionMatrix) {
        let states = vec![
            State::new_1d(0, 0.0, 0.5).unwrap(),
            State::new_1d(1, 5.0, 0.5).unwrap(),
        ];
        let start_matrix = StartMatrix::new(vec![0.5, 0.5]);
        let transition_matrix = TransitionMatrix::new(vec![vec![0.9, 0.1], vec![0.1, 0.9]]);
        (states, start_matrix, transition_matrix)
    }

    // Test decoding of a clean two level sequence
    #[test]
    fn test_viterbi_two_levels() {
        let (states, start_matrix, transition_matrix) = setup();
        let obs = vec![0.1, -0.2, 0.3, 4.8, 5.1, 5.3, 0.0, 0.2];
        let observations = DMatrix::from_column_slice(obs.len(), 1, &obs);

        let mut viterbi = Viterbi::new(&states, &start_matrix, &transition_matrix);
        viterbi.run(&observations).unwrap();

        assert_eq!(viterbi.get_prediction().unwrap(), &vec![0, 0, 0, 1, 1, 1, 0, 0]);
        assert!(viterbi.get_log_probability().unwrap().is_finite());
    }

    // Test that a forbidden transition is never used
    #[test]
    fn test_viterbi_respects_zero_transitions() {
        let (states, start_matrix, _) = setup();
        let sticky = TransitionMatrix::new(vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        let obs = vec![0.0, 0.1, 5.0, 5.0];
        let observations = DMatrix::from_column_slice(obs.len(), 1, &obs);

        let mut viterbi = Viterbi::new(&states, &start_matrix, &sticky);
        viterbi.run(&observations).unwrap();

        let path = viterbi.take_prediction().unwrap();
        assert!(path.iter().all(|s| *s == path[0]));
    }

    #[test]
    fn test_viterbi_missing_inputs() {
        let mut viterbi = Viterbi::new_empty();
        let observations = DMatrix::from_element(3, 1, 0.0);
        assert_eq!(viterbi.run(&observations), Err(ViterbiError::UndefinedStates));
    }
}
