use nalgebra::DMatrix;
use thiserror::Error;

use crate::tools::{count_adjacent_values, median};

use super::hmm_instance::{HMMInstance, HMMInstanceError};
use super::hmm_matrices::{StartMatrix, TransitionMatrix};
use super::state::State;
use super::viterbi::{Viterbi, ViterbiError};

/// One observed change of idealized level, `lifetime` in frames
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub y_before: f64,
    pub y_after: f64,
    pub lifetime: usize,
}

#[derive(Debug, Default)]
pub struct HMMAnalyzer {
    features: Option<DMatrix<f64>>,
    fret: Option<Vec<f64>>,

    states: Option<Vec<State>>,
    start_matrix: Option<StartMatrix>,
    transition_matrix: Option<TransitionMatrix>,

    sequence_states: Option<Vec<usize>>,
    state_occupancy: Option<Vec<f64>>,
    idealized: Option<Vec<f64>>,
    frame_idx: Option<Vec<usize>>,
    transitions: Option<Vec<Transition>>,
}

impl HMMAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `features` rows and `fret` frames must match
    pub fn set_sequence(&mut self, features: DMatrix<f64>, fret: &[f64]) -> Result<(), HMMAnalyzerError> {
        if features.nrows() != fret.len() {
            return Err(HMMAnalyzerError::SequenceLengthMismatch { features: features.nrows(), fret: fret.len() });
        }
        self.features = Some(features);
        self.fret = Some(fret.to_vec());

        Ok(())
    }

    pub fn setup(
        &mut self,
        states: Vec<State>,
        start_matrix: StartMatrix,
        transition_matrix: TransitionMatrix,
    ) -> Result<(), HMMAnalyzerError> {
        HMMInstance::check_validity(&states, &start_matrix, &transition_matrix)
            .map_err(|err| HMMAnalyzerError::HMMInstanceError { err })?;

        self.states = Some(states);
        self.start_matrix = Some(start_matrix);
        self.transition_matrix = Some(transition_matrix);

        Ok(())
    }

    pub fn run(&mut self) -> Result<(), HMMAnalyzerError> {
        let features = self.features.as_ref().ok_or(HMMAnalyzerError::SequenceValuesNotDefined)?;
        let fret = self.fret.as_ref().ok_or(HMMAnalyzerError::SequenceValuesNotDefined)?;
        let states = self.states.as_ref().ok_or(HMMAnalyzerError::StatesNotDefined)?;
        let start_matrix = self.start_matrix.as_ref().ok_or(HMMAnalyzerError::StartMatrixNotDefined)?;
        let transition_matrix = self.transition_matrix.as_ref().ok_or(HMMAnalyzerError::TransitionMatrixNotDefined)?;

        let mut viterbi = Viterbi::new(states, start_matrix, transition_matrix);
        viterbi.run(features).map_err(|err| HMMAnalyzerError::ViterbiError { err })?;
        let path = viterbi.take_prediction().ok_or(HMMAnalyzerError::CouldNotGetViterbiPred)?;

        let (idealized, frame_idx) = Self::idealize(fret, &path);
        let transitions = Self::compute_transitions(&idealized, &frame_idx);

        self.state_occupancy = Some(Self::compute_state_occupancy(&path, states.len()));
        self.sequence_states = Some(path);
        self.idealized = Some(idealized);
        self.frame_idx = Some(frame_idx);
        self.transitions = Some(transitions);

        Ok(())
    }

    /// Replaces every frame by the median FRET of its state. Frame indices are 1-based.
    pub fn idealize(fret: &[f64], path: &[usize]) -> (Vec<f64>, Vec<usize>) {
        let num_states = path.iter().max().map_or(0, |max| max + 1);

        let levels: Vec<f64> = (0..num_states)
            .map(|state| {
                let members: Vec<f64> = path.iter()
                    .zip(fret)
                    .filter(|(s, _)| **s == state)
                    .map(|(_, e)| *e)
                    .collect();
                median(&members).unwrap_or(f64::NAN)
            })
            .collect();

        let idealized = path.iter().map(|s| levels[*s]).collect();
        let frame_idx = (1..=path.len()).collect();

        (idealized, frame_idx)
    }

    /// Runs of constant idealized value. Each row is (level, next level, run length);
    /// the last run has no observed successor and is left out.
    pub fn compute_transitions(idealized: &[f64], frame_idx: &[usize]) -> Vec<Transition> {
        let (starts, lengths) = count_adjacent_values(idealized);
        let run_ends: Vec<usize> = starts.iter().zip(&lengths).map(|(start, len)| start + len - 1).collect();

        let mut transitions = Vec::with_capacity(run_ends.len().saturating_sub(1));
        let mut previous_time = 0;

        for window in run_ends.windows(2) {
            let (end, next_end) = (window[0], window[1]);
            let time = frame_idx[end];

            transitions.push(Transition {
                y_before: idealized[end],
                y_after: idealized[next_end],
                lifetime: time - previous_time,
            });
            previous_time = time;
        }

        transitions
    }

    pub fn compute_state_occupancy(state_sequence: &[usize], num_states: usize) -> Vec<f64> {
        if state_sequence.is_empty() {
            return vec![0.0; num_states];
        }

        let mut state_dwell_count = vec![0_usize; num_states];
        state_sequence.iter()
            .filter(|id| **id < num_states)
            .for_each(|state_id| state_dwell_count[*state_id] += 1);

        state_dwell_count.iter()
            .map(|count| *count as f64 / state_sequence.len() as f64)
            .collect()
    }

    pub fn get_states_sequence(&self) -> Option<&Vec<usize>> {
        self.sequence_states.as_ref()
    }

    pub fn get_state_occupancy(&self) -> Option<&Vec<f64>> {
        self.state_occupancy.as_ref()
    }

    pub fn take_idealized(&mut self) -> Option<(Vec<f64>, Vec<usize>)> {
        Some((self.idealized.take()?, self.frame_idx.take()?))
    }

    pub fn take_transitions(&mut self) -> Option<Vec<Transition>> {
        self.transitions.take()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HMMAnalyzerError {
    #[error("{err}")]
    HMMInstanceError { err: HMMInstanceError },
    #[error("{err}")]
    ViterbiError { err: ViterbiError },
    #[error("{features} feature rows but {fret} FRET frames")]
    SequenceLengthMismatch { features: usize, fret: usize },

    #[error("states are not defined")]
    StatesNotDefined,
    #[error("start matrix is not defined")]
    StartMatrixNotDefined,
    #[error("transition matrix is not defined")]
    TransitionMatrixNotDefined,
    #[error("sequence is not defined")]
    SequenceValuesNotDefined,

    #[error("Viterbi prediction missing")]
    CouldNotGetViterbiPred,
}
