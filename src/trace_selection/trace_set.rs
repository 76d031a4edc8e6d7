use std::collections::btree_map::{self, BTreeMap};

use nalgebra::DMatrix;
use thiserror::Error;

use crate::config::AnalysisConfig;
use crate::correction::{beta_gamma_factor, correct_intensities, CorrectionFactors};
use crate::population::{fit_gaussian_mixture, GaussianMixtureFit, MixtureError, MixtureOrder};
use crate::progress::Progress;
use crate::signal_analysis::classification::{predict_batch, ClassifierError, TraceClassifier, PREDICTION_BATCH_SIZE};
use crate::signal_analysis::hmm::Transition;
use crate::tools::median;

use super::bleaching::{drop_bleached_frames, trim_es};
use super::filter::SelectionCondition;
use super::trace::{Trace, TraceError};

/// Per-trace leakage factors for export
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectionFactorRow {
    pub alpha: Option<f64>,
    pub delta: Option<f64>,
    pub name: String,
}

/// E and S pooled over the checked traces, before and after beta/gamma correction
#[derive(Debug, Clone, PartialEq)]
pub struct PooledEs {
    pub e_un: Vec<f64>,
    pub s_un: Vec<f64>,
    pub beta: f64,
    pub gamma: f64,
    pub e: Vec<f64>,
    pub s: Vec<f64>,
    pub n_samples: usize, // Checked traces
    pub median_len: Option<f64>,
}

/// Every loaded trace, keyed and ordered by name
#[derive(Debug, Clone, Default)]
pub struct TraceSet {
    traces: BTreeMap<String, Trace>,
}

impl TraceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later traces replace earlier ones of the same name
    pub fn from_traces(traces: Vec<Trace>) -> Self {
        let mut set = Self::new();
        for trace in traces {
            if let Some(old) = set.insert(trace) {
                log::warn!("Replaced duplicate trace {}", old.name);
            }
        }
        set
    }

    pub fn insert(&mut self, trace: Trace) -> Option<Trace> {
        self.traces.insert(trace.name.clone(), trace)
    }

    pub fn remove(&mut self, name: &str) -> Option<Trace> {
        self.traces.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Trace> {
        self.traces.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Trace> {
        self.traces.get_mut(name)
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, Trace> {
        self.traces.values()
    }

    pub fn checked(&self) -> impl Iterator<Item = &Trace> {
        self.traces.values().filter(|trace| trace.is_checked)
    }

    pub fn num_checked(&self) -> usize {
        self.checked().count()
    }

    pub fn set_all_checked(&mut self, is_checked: bool) {
        self.traces.values_mut().for_each(|trace| trace.is_checked = is_checked);
    }

    /// Fits every checked trace. A trace that fails is logged and skipped,
    /// a cancel stops the loop. Returns how many traces were fitted.
    pub fn fit_checked_traces_hmm<P>(&mut self, config: &AnalysisConfig, progress: &mut P) -> usize
    where
        P: Progress + ?Sized,
    {
        progress.start(self.num_checked());
        let mut num_fitted = 0;

        for trace in self.traces.values_mut().filter(|trace| trace.is_checked) {
            if progress.was_canceled() {
                log::info!("HMM fitting canceled after {} traces", num_fitted);
                break;
            }

            match trace.fit_hmm(config) {
                Ok(fit) => {
                    log::debug!("{}: {} states, {} transitions", trace.name, fit.num_states, fit.transitions.len());
                    num_fitted += 1;
                }
                Err(err) => log::warn!("Skipping HMM fit of {}: {}", trace.name, err),
            }
            progress.increment();
        }

        num_fitted
    }

    pub fn pooled_correction_factors(&self) -> Vec<CorrectionFactorRow> {
        self.traces.values()
            .filter(|trace| trace.get_alpha().is_some() || trace.get_delta().is_some())
            .map(|trace| CorrectionFactorRow {
                alpha: trace.get_alpha(),
                delta: trace.get_delta(),
                name: trace.name.clone(),
            })
            .collect()
    }

    /// Apparent E/S of the checked traces give beta and gamma, which then
    /// correct the same frames. `n_first_frames` caps the frames per trace.
    pub fn pooled_es(&self, config: &AnalysisConfig, n_first_frames: Option<usize>) -> PooledEs {
        let apparent = CorrectionFactors::new(config.alpha, config.delta, 1.0, 1.0);

        let (fret, stoi): (Vec<Vec<f64>>, Vec<Vec<f64>>) = self.checked()
            .map(|trace| drop_bleached_frames(&trace.intensities(), &trace.bleaches(), n_first_frames, &apparent))
            .unzip();
        let (e_un, s_un) = trim_es(&fret, &stoi);

        let (beta, gamma) = beta_gamma_factor(&e_un, &s_un);
        let corrected = apparent.with_beta_gamma(beta, gamma);

        let (fret, stoi): (Vec<Vec<f64>>, Vec<Vec<f64>>) = self.checked()
            .map(|trace| drop_bleached_frames(&trace.intensities(), &trace.bleaches(), n_first_frames, &corrected))
            .unzip();
        let (e, s) = trim_es(&fret, &stoi);

        let lengths: Vec<f64> = self.checked()
            .map(|trace| trace.first_bleach().unwrap_or(trace.len()) as f64)
            .collect();

        log::debug!("Pooled {} frames from {} traces, beta {:.4}, gamma {:.4}", e.len(), lengths.len(), beta, gamma);

        PooledEs {
            e_un,
            s_un,
            beta,
            gamma,
            e,
            s,
            n_samples: lengths.len(),
            median_len: median(&lengths),
        }
    }

    /// Transitions of every checked trace that has been fitted
    pub fn pooled_lifetimes(&self) -> Vec<Transition> {
        self.checked()
            .filter_map(|trace| trace.get_transitions())
            .flatten()
            .copied()
            .collect()
    }

    /// Mixture over the pooled E, corrected or apparent
    pub fn fit_pooled_gaussians(pooled: &PooledEs, corrected: bool, order: MixtureOrder) -> Result<Option<GaussianMixtureFit>, MixtureError> {
        let values = if corrected { &pooled.e } else { &pooled.e_un };
        fit_gaussian_mixture(values, order)
    }

    /// Checks the traces that pass `condition` and unchecks the rest. Returns the number checked.
    pub fn select_by_condition(&mut self, condition: &SelectionCondition) -> usize {
        let mut num_checked = 0;
        for trace in self.traces.values_mut() {
            trace.is_checked = condition.check_valid(trace);
            num_checked += trace.is_checked as usize;
        }
        num_checked
    }

    /// Classifies every trace from its corrected intensities and stores the
    /// predictions. A cancel leaves the remaining traces untouched.
    pub fn predict<C, P>(&mut self, classifier: &C, config: &AnalysisConfig, progress: &mut P) -> Result<usize, TraceSetError>
    where
        C: TraceClassifier + ?Sized,
        P: Progress + ?Sized,
    {
        let inputs: Vec<DMatrix<f64>> = self.traces.values()
            .map(|trace| {
                let corrected = correct_intensities(&trace.intensities(), config.alpha, config.delta);
                DMatrix::from_fn(trace.len(), 3, |t, c| match c {
                    0 => corrected.i_dd[t],
                    1 => corrected.i_da[t],
                    _ => corrected.i_aa[t],
                })
            })
            .collect();

        let predictions = predict_batch(&inputs, classifier, PREDICTION_BATCH_SIZE, progress)
            .map_err(|err| TraceSetError::ClassifierError { err })?;
        let num_predicted = predictions.len();

        for (trace, y_pred) in self.traces.values_mut().zip(predictions) {
            trace.set_predictions(y_pred, config).map_err(|err| TraceSetError::TraceError { err })?;
        }

        Ok(num_predicted)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TraceSetError {
    #[error("{err}")]
    ClassifierError { err: ClassifierError },
    #[error("{err}")]
    TraceError { err: TraceError },
}
