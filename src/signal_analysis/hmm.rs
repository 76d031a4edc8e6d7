/********** Hidden Markov Model (HMM) Module for FRET Analysis **********
* This module is designed based on the methodology and algorithm described in the paper:
*
* "Analysis of Single-Molecule FRET Trajectories Using Hidden Markov Modeling"**
*
* Authors: Sean A. McKinney, Chirlmin Joo, and Taekjip Ha
* Department of Physics and Howard Hughes Medical Institute, University of Illinois at Urbana-Champaign
* Published in: *Biophysical Journal*, Volume 91, September 2006, Pages 1941–1951
* DOI: [10.1529/biophysj.106.082487](https://doi.org/10.1529/biophysj.106.082487)
**********/

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use thiserror::Error;

use crate::config::AnalysisConfig;
use crate::tools::z_score_columns;

pub mod state;
pub mod hmm_matrices;
pub mod probability_matrices;
pub mod hmm_instance;
pub mod viterbi;
pub mod baum_welch;
pub mod optimization_tracker;
pub mod kmeans;
pub mod occams_razor;
pub mod number_states_finder;
pub mod hmm_analyzer;

use hmm_analyzer::*;
use hmm_matrices::*;
use number_states_finder::*;
use state::*;

pub use hmm_analyzer::Transition;

/// Segmentation of one trace by the selected model
#[derive(Debug, Clone)]
pub struct HmmFit {
    pub num_states: usize,
    pub bics: Vec<f64>,

    pub states: Vec<State>,
    pub start_matrix: StartMatrix,
    pub transition_matrix: TransitionMatrix,
    pub log_likelihood: f64,

    pub state_sequence: Vec<usize>,
    pub state_occupancy: Vec<f64>,
    pub idealized: Vec<f64>,
    pub frame_idx: Vec<usize>, // 1-based
    pub transitions: Vec<Transition>,
}

pub struct HMM {}

impl HMM {
    /// Z-scored (I_DD, F_DA) columns, one row per frame
    pub fn feature_matrix(i_dd: &[f64], f_da: &[f64]) -> Result<DMatrix<f64>, HmmError> {
        if i_dd.len() != f_da.len() {
            return Err(HmmError::FeatureLengthMismatch { i_dd: i_dd.len(), f_da: f_da.len() });
        }
        let n = i_dd.len();
        let raw = DMatrix::from_fn(n, 2, |t, c| if c == 0 { i_dd[t] } else { f_da[t] });

        Ok(z_score_columns(&raw))
    }

    /// Fits k = 1..=max states, keeps the heuristic BIC winner and
    /// idealizes `fret` with its Viterbi path
    pub fn fit(features: &DMatrix<f64>, fret: &[f64], config: &AnalysisConfig) -> Result<HmmFit, HmmError> {
        if features.nrows() == 0 {
            return Err(HmmError::EmptyFeatures);
        }
        if features.iter().any(|v| !v.is_finite()) {
            return Err(HmmError::NonFiniteFeatures);
        }

        let finder = HMMNumStatesFinder::new(config);
        let (num_states, model, bics) = finder.get_number_of_states(features)
            .map_err(|err| HmmError::NumStatesFinderError { err })?;
        log::debug!("Selected {num_states} states from BIC scores {bics:?}");

        let mut analyzer = HMMAnalyzer::new();
        analyzer.set_sequence(features.clone(), fret).map_err(|err| HmmError::AnalyzerError { err })?;
        analyzer.setup(model.states.clone(), model.start_matrix.clone(), model.transition_matrix.clone())
            .map_err(|err| HmmError::AnalyzerError { err })?;
        analyzer.run().map_err(|err| HmmError::AnalyzerError { err })?;

        let state_sequence = analyzer.get_states_sequence().cloned().ok_or(HmmError::MissingOutput)?;
        let state_occupancy = analyzer.get_state_occupancy().cloned().ok_or(HmmError::MissingOutput)?;
        let (idealized, frame_idx) = analyzer.take_idealized().ok_or(HmmError::MissingOutput)?;
        let transitions = analyzer.take_transitions().ok_or(HmmError::MissingOutput)?;

        Ok(HmmFit {
            num_states,
            bics,
            states: model.states,
            start_matrix: model.start_matrix,
            transition_matrix: model.transition_matrix,
            log_likelihood: model.log_likelihood,
            state_sequence,
            state_occupancy,
            idealized,
            frame_idx,
            transitions,
        })
    }

    fn sample_index<R: Rng + ?Sized>(probabilities: &[f64], rng: &mut R) -> usize {
        let random_value = rng.gen_range(0.0..1.0);
        let mut cumulative_prob = 0.0;

        for (index, p) in probabilities.iter().enumerate() {
            cumulative_prob += p;
            if random_value < cumulative_prob {
                return index;
            }
        }

        probabilities.len().saturating_sub(1)
    }

    pub fn gen_state_sequence<R: Rng + ?Sized>(
        start_matrix: &StartMatrix,
        transition_matrix: &TransitionMatrix,
        time_steps: usize,
        rng: &mut R,
    ) -> Vec<usize> {
        let mut sequence = Vec::with_capacity(time_steps);
        if time_steps == 0 {
            return sequence;
        }

        let mut current_state = Self::sample_index(&start_matrix.matrix, rng);
        sequence.push(current_state);

        for _ in 1..time_steps {
            current_state = Self::sample_index(&transition_matrix.matrix[current_state], rng);
            sequence.push(current_state);
        }

        sequence
    }

    /// Simulated state path and emissions
    pub fn gen_sequence<R: Rng + ?Sized>(
        states: &[State],
        start_matrix: &StartMatrix,
        transition_matrix: &TransitionMatrix,
        time_steps: usize,
        rng: &mut R,
    ) -> (Vec<usize>, Vec<DVector<f64>>) {
        let sequence = Self::gen_state_sequence(start_matrix, transition_matrix, time_steps, &mut *rng);
        let values = sequence.iter().map(|s| states[*s].sample(&mut *rng)).collect();

        (sequence, values)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HmmError {
    #[error("no frames to segment")]
    EmptyFeatures,
    #[error("feature matrix contains non-finite values")]
    NonFiniteFeatures,
    #[error("{i_dd} donor frames but {f_da} acceptor frames")]
    FeatureLengthMismatch { i_dd: usize, f_da: usize },
    #[error("{err}")]
    NumStatesFinderError { err: HMMNumStatesFinderError },
    #[error("{err}")]
    AnalyzerError { err: HMMAnalyzerError },
    #[error("segmentation produced no output")]
    MissingOutput,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    // Test that the generated path follows the transition structure
    #[test]
    fn test_gen_sequence_respects_sticky_transitions() {
        let states = vec![State::new_1d(0, 0.0, 0.1).unwrap(), State::new_1d(1, 1.0, 0.1).unwrap()];
        let start_matrix = StartMatrix::new(vec![1.0, 0.0]);
        let transition_matrix = TransitionMatrix::new(vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        let mut rng = StdRng::seed_from_u64(3);

        let (sequence, values) = HMM::gen_sequence(&states, &start_matrix, &transition_matrix, 50, &mut rng);
        assert!(sequence.iter().all(|s| *s == 0));
        assert_eq!(values.len(), 50);
        assert!(values.iter().all(|v| v[0].abs() < 1.0));
    }

    #[test]
    fn test_feature_matrix_is_standardized() {
        let i_dd = vec![100.0, 200.0, 300.0, 400.0];
        let f_da = vec![10.0, 10.0, 10.0, 10.0];
        let features = HMM::feature_matrix(&i_dd, &f_da).unwrap();

        assert_eq!(features.shape(), (4, 2));
        assert!(features.column(0).sum().abs() < 1e-12);
        assert!(features.column(1).iter().all(|v| *v == 0.0));
        assert!(HMM::feature_matrix(&i_dd, &f_da[..2]).is_err());
    }

    // Test segmentation of a simulated anticorrelated two level trace
    #[test]
    fn test_fit_two_level_trace() {
        let n = 300;
        let mut rng = StdRng::seed_from_u64(21);
        let noise = rand_distr::Normal::new(0.0, 15.0).unwrap();

        let mut i_dd = Vec::with_capacity(n);
        let mut f_da = Vec::with_capacity(n);
        let mut fret = Vec::with_capacity(n);
        for t in 0..n {
            let e = if (t / 75) % 2 == 0 { 0.25 } else { 0.75 };
            let dd = 1000.0 * (1.0 - e) + rand_distr::Distribution::sample(&noise, &mut rng);
            let da = 1000.0 * e + rand_distr::Distribution::sample(&noise, &mut rng);
            i_dd.push(dd);
            f_da.push(da);
            fret.push(da / (dd + da));
        }

        let features = HMM::feature_matrix(&i_dd, &f_da).unwrap();
        let fit = HMM::fit(&features, &fret, &AnalysisConfig::default()).unwrap();

        assert_eq!(fit.num_states, 2);
        assert_eq!(fit.idealized.len(), n);
        assert_eq!(fit.transitions.len(), 3);
        assert!(fit.transitions.iter().all(|t| t.lifetime == 75));
        assert!(fit.state_occupancy.iter().all(|occupancy| (occupancy - 0.5).abs() < 1e-12));
        assert!((fit.transitions[0].y_before - 0.25).abs() < 0.02);
        assert!((fit.transitions[0].y_after - 0.75).abs() < 0.02);
    }

    #[test]
    fn test_fit_empty_features() {
        let features = DMatrix::<f64>::zeros(0, 2);
        assert_eq!(HMM::fit(&features, &[], &AnalysisConfig::default()).unwrap_err(), HmmError::EmptyFeatures);
    }
}
