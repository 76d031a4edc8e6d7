use nalgebra::DMatrix;
use thiserror::Error;

use crate::config::AnalysisConfig;
use crate::correction::*;
use crate::signal_analysis::classification::{seq_probabilities, BLEACHED_CLASS, NUM_CLASSES, SKIP_THRESHOLD_DEFAULT};
use crate::signal_analysis::hmm::{HmmError, HmmFit, Transition, HMM};

use super::bleaching::{find_bleach, min_real};
use super::channel::{Channel, TraceChannel};

/// One molecule: three channels, derived E and S, and everything fitted on top
#[derive(Debug, Clone)]
pub struct Trace {
    pub name: String,
    pub movie: Option<String>,
    pub pair: Option<usize>,
    pub is_checked: bool,

    grn: TraceChannel,
    acc: TraceChannel,
    red: TraceChannel,

    fret: Vec<f64>,
    stoi: Vec<f64>,
    first_bleach: Option<usize>,

    y_pred: Option<DMatrix<f64>>,
    y_class: Option<Vec<f64>>,
    confidence: Option<f64>,

    hmm: Option<Vec<f64>>,
    hmm_idx: Option<Vec<usize>>,
    transitions: Option<Vec<Transition>>,

    alpha: Option<f64>,
    delta: Option<f64>,
    xdata: Vec<usize>,
}

impl Trace {
    /// Channels must share one length, set bleaches must lie inside the trace.
    /// E and S start out apparent.
    pub fn new(name: &str, grn: TraceChannel, acc: TraceChannel, red: TraceChannel) -> Result<Self, TraceError> {
        let len = grn.len();
        let lengths = [
            ("grn_bg", grn.bg.len()),
            ("acc_int", acc.int.len()),
            ("acc_bg", acc.bg.len()),
            ("red_int", red.int.len()),
            ("red_bg", red.bg.len()),
        ];
        for (channel, found) in lengths {
            if found != len {
                return Err(TraceError::CorrectionError {
                    err: CorrectionError::ChannelLengthMismatch { channel, expected: len, found },
                });
            }
        }

        for bleach in [grn.bleach, acc.bleach, red.bleach].iter().flatten() {
            if *bleach >= len {
                return Err(TraceError::BleachOutOfRange { frame: *bleach, len });
            }
        }

        let mut trace = Self {
            name: name.to_string(),
            movie: None,
            pair: None,
            is_checked: false,

            grn,
            acc,
            red,

            fret: Vec::new(),
            stoi: Vec::new(),
            first_bleach: None,

            y_pred: None,
            y_class: None,
            confidence: None,

            hmm: None,
            hmm_idx: None,
            transitions: None,

            alpha: None,
            delta: None,
            xdata: Vec::new(),
        };

        let (fret, stoi) = apparent_es(&trace.intensities());
        trace.fret = fret;
        trace.stoi = stoi;
        trace.first_bleach = min_real(&trace.bleaches());

        Ok(trace)
    }

    pub fn intensities(&self) -> Intensities<'_> {
        Intensities {
            grn_int: &self.grn.int,
            grn_bg: &self.grn.bg,
            acc_int: &self.acc.int,
            acc_bg: &self.acc.bg,
            red_int: &self.red.int,
            red_bg: &self.red.bg,
        }
    }

    /// Recomputes E with the leakage factors and S with every factor of `config`
    pub fn calculate_es(&mut self, config: &AnalysisConfig) {
        let intensities = self.intensities();
        let fret = calc_fret(&intensities, config.alpha, config.delta, config.clip_range);
        let stoi = calc_stoi(&intensities, config.alpha, config.delta, config.beta, config.gamma, config.clip_range);

        self.fret = fret;
        self.stoi = stoi;
    }

    pub fn len(&self) -> usize {
        self.grn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grn.is_empty()
    }

    pub fn channel(&self, channel: Channel) -> &TraceChannel {
        match channel {
            Channel::Green => &self.grn,
            Channel::Acceptor => &self.acc,
            Channel::Red => &self.red,
        }
    }

    pub fn bleaches(&self) -> [Option<usize>; 3] {
        [self.grn.bleach, self.acc.bleach, self.red.bleach]
    }

    pub fn get_fret(&self) -> &[f64] {
        &self.fret
    }

    pub fn get_stoi(&self) -> &[f64] {
        &self.stoi
    }

    pub fn first_bleach(&self) -> Option<usize> {
        self.first_bleach
    }

    /// Bleach marked on a channel. Red marks the acceptor as well since both
    /// carry acceptor emission. Any idealized signal is discarded.
    pub fn set_bleach(&mut self, channel: Channel, frame: Option<usize>) -> Result<(), TraceError> {
        if let Some(frame) = frame {
            if frame >= self.len() {
                return Err(TraceError::BleachOutOfRange { frame, len: self.len() });
            }
        }

        match channel {
            Channel::Green => self.grn.bleach = frame,
            Channel::Acceptor => self.acc.bleach = frame,
            Channel::Red => {
                self.red.bleach = frame;
                self.acc.bleach = frame;
            }
        }

        self.first_bleach = min_real(&self.bleaches());
        self.clear_hmm();

        Ok(())
    }

    /// Adds one end of a correction window. A third mark starts over.
    pub fn mark_correction_range(&mut self, frame: usize) {
        self.xdata.push(frame);
        if self.xdata.len() == 3 {
            self.xdata.clear();
        }
    }

    pub fn correction_range(&self) -> &[usize] {
        &self.xdata
    }

    /// Estimates alpha or delta over the marked window `[min, max)` of raw intensities
    pub fn correction_factor(&mut self, kind: CorrectionFactorKind) -> Result<f64, TraceError> {
        let [start, end] = match self.xdata.as_slice() {
            [a, b] => [*a.min(b), *a.max(b)],
            _ => return Err(TraceError::IncompleteCorrectionRange { marks: self.xdata.len() }),
        };
        if start >= end || end > self.len() {
            return Err(TraceError::CorrectionError { err: CorrectionError::InvalidWindow { start, end } });
        }

        let i_dd = &self.grn.int[start..end];
        let i_da = &self.acc.int[start..end];
        let i_aa = &self.red.int[start..end];

        let factor = match kind {
            CorrectionFactorKind::Alpha => alpha_factor(i_dd, i_da),
            CorrectionFactorKind::Delta => delta_factor(i_dd, i_da, i_aa),
        }
        .ok_or(TraceError::CorrectionError { err: CorrectionError::InvalidWindow { start, end } })?;

        match kind {
            CorrectionFactorKind::Alpha => self.alpha = Some(factor),
            CorrectionFactorKind::Delta => self.delta = Some(factor),
        }

        Ok(factor)
    }

    pub fn get_alpha(&self) -> Option<f64> {
        self.alpha
    }

    pub fn get_delta(&self) -> Option<f64> {
        self.delta
    }

    pub fn set_correction_factors(&mut self, alpha: Option<f64>, delta: Option<f64>) {
        self.alpha = alpha;
        self.delta = delta;
    }

    pub fn clear_correction_factors(&mut self) {
        self.alpha = None;
        self.delta = None;
        self.xdata.clear();
    }

    /// Stores classifier output and moves every channel bleach to the
    /// frame where the bleached class takes over
    pub fn set_predictions(&mut self, y_pred: DMatrix<f64>, config: &AnalysisConfig) -> Result<(), TraceError> {
        if y_pred.nrows() != self.len() || y_pred.ncols() != NUM_CLASSES {
            return Err(TraceError::InvalidPredictionShape {
                expected: [self.len(), NUM_CLASSES],
                found: [y_pred.nrows(), y_pred.ncols()],
            });
        }

        let (y_class, confidence) = seq_probabilities(&y_pred, SKIP_THRESHOLD_DEFAULT, BLEACHED_CLASS);
        let p_bleach: Vec<f64> = y_pred.column(BLEACHED_CLASS).iter().copied().collect();
        let first_bleach = find_bleach(&p_bleach, config.bleach_threshold, config.bleach_window);

        self.y_pred = Some(y_pred);
        self.y_class = Some(y_class);
        self.confidence = Some(confidence);

        self.first_bleach = first_bleach;
        self.grn.bleach = first_bleach;
        self.acc.bleach = first_bleach;
        self.red.bleach = first_bleach;

        Ok(())
    }

    // Predictions read back from a file keep the stored bleaches
    // E and S as stored in an exported file, so corrected values survive a reload
    pub(crate) fn restore_es(&mut self, fret: Vec<f64>, stoi: Vec<f64>) -> Result<(), TraceError> {
        let len = self.len();
        for (channel, found) in [("E", fret.len()), ("S", stoi.len())] {
            if found != len {
                return Err(TraceError::CorrectionError {
                    err: CorrectionError::ChannelLengthMismatch { channel, expected: len, found },
                });
            }
        }
        self.fret = fret;
        self.stoi = stoi;

        Ok(())
    }

    pub(crate) fn restore_predictions(&mut self, y_pred: DMatrix<f64>, y_class: Vec<f64>, confidence: f64) {
        self.y_pred = Some(y_pred);
        self.y_class = Some(y_class);
        self.confidence = Some(confidence);
    }

    pub fn clear_predictions(&mut self) {
        self.y_pred = None;
        self.y_class = None;
        self.confidence = None;
    }

    pub fn get_y_pred(&self) -> Option<&DMatrix<f64>> {
        self.y_pred.as_ref()
    }

    pub fn get_y_class(&self) -> Option<&[f64]> {
        self.y_class.as_deref()
    }

    pub fn get_confidence(&self) -> Option<f64> {
        self.confidence
    }

    /// Segments the frames before the first bleach. Features are standardized
    /// over the whole trace before being cut.
    pub fn fit_hmm(&mut self, config: &AnalysisConfig) -> Result<HmmFit, TraceError> {
        let intensities = self.intensities();
        let corrected = correct_intensities(&intensities, config.alpha, config.delta);
        let fret = calc_fret(&intensities, config.alpha, config.delta, config.clip_range);

        let features = HMM::feature_matrix(&corrected.i_dd, &corrected.f_da)
            .map_err(|err| TraceError::HmmError { err })?;

        let end = self.first_bleach.unwrap_or(self.len());
        let features = features.rows(0, end).into_owned();

        let fit = HMM::fit(&features, &fret[..end], config).map_err(|err| TraceError::HmmError { err })?;

        self.hmm = Some(fit.idealized.clone());
        self.hmm_idx = Some(fit.frame_idx.clone());
        self.transitions = Some(fit.transitions.clone());

        Ok(fit)
    }

    pub fn clear_hmm(&mut self) {
        self.hmm = None;
        self.hmm_idx = None;
        self.transitions = None;
    }

    pub fn get_hmm(&self) -> Option<(&[f64], &[usize])> {
        Some((self.hmm.as_deref()?, self.hmm_idx.as_deref()?))
    }

    pub fn get_transitions(&self) -> Option<&[Transition]> {
        self.transitions.as_deref()
    }

    /// File name used on export
    pub fn pretty_name(&self) -> String {
        let pair = self.pair.map_or_else(|| self.name.clone(), |n| n.to_string());
        let name = match &self.movie {
            None => format!("Trace_pair{}.txt", pair),
            Some(movie) => format!("Trace_{}_pair{}.txt", movie.replace('.', "_"), pair),
        };

        name.lines().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TraceError {
    #[error("{err}")]
    CorrectionError { err: CorrectionError },
    #[error("bleach at frame {frame} outside a trace of {len} frames")]
    BleachOutOfRange { frame: usize, len: usize },
    #[error("correction window needs two marks, has {marks}")]
    IncompleteCorrectionRange { marks: usize },
    #[error("prediction of shape {found:?}, expected {expected:?}")]
    InvalidPredictionShape { expected: [usize; 2], found: [usize; 2] },
    #[error("{err}")]
    HmmError { err: HmmError },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_trace(len: usize) -> Trace {
        Trace::new(
            "trace",
            TraceChannel::new(vec![600.0; len], vec![100.0; len]),
            TraceChannel::new(vec![600.0; len], vec![100.0; len]),
            TraceChannel::new(vec![1100.0; len], vec![100.0; len]),
        )
        .unwrap()
    }

    // Test that construction derives apparent E and S
    #[test]
    fn test_new_trace_apparent_es() {
        let trace = flat_trace(20);
        assert_eq!(trace.get_fret().len(), 20);
        assert!(trace.get_fret().iter().all(|e| (e - 0.5).abs() < 1e-12));
        assert!(trace.get_stoi().iter().all(|s| (s - 0.5).abs() < 1e-12));
        assert_eq!(trace.first_bleach(), None);
    }

    #[test]
    fn test_new_trace_rejects_mismatch() {
        let result = Trace::new(
            "bad",
            TraceChannel::from_intensity(vec![1.0; 5]),
            TraceChannel::from_intensity(vec![1.0; 4]),
            TraceChannel::from_intensity(vec![1.0; 5]),
        );
        assert!(matches!(result, Err(TraceError::CorrectionError { .. })));
    }

    // Test that red bleach sets the acceptor and updates the first bleach
    #[test]
    fn test_set_bleach() {
        let mut trace = flat_trace(50);
        trace.set_bleach(Channel::Red, Some(30)).unwrap();
        assert_eq!(trace.bleaches(), [None, Some(30), Some(30)]);
        assert_eq!(trace.first_bleach(), Some(30));

        trace.set_bleach(Channel::Green, Some(12)).unwrap();
        assert_eq!(trace.first_bleach(), Some(12));

        assert_eq!(trace.set_bleach(Channel::Green, Some(50)), Err(TraceError::BleachOutOfRange { frame: 50, len: 50 }));
    }

    // Test that the third mark resets the window
    #[test]
    fn test_mark_correction_range() {
        let mut trace = flat_trace(10);
        trace.mark_correction_range(8);
        trace.mark_correction_range(2);
        assert_eq!(trace.correction_range(), &[8, 2]);
        trace.mark_correction_range(5);
        assert!(trace.correction_range().is_empty());
    }

    // Test alpha from a donor-only window of raw intensities
    #[test]
    fn test_correction_factor_alpha() {
        let mut grn = vec![500.0; 20];
        let mut acc = vec![500.0; 20];
        for t in 10..20 {
            grn[t] = 900.0;
            acc[t] = 100.0;
        }
        let mut trace = Trace::new(
            "donor_only",
            TraceChannel::from_intensity(grn),
            TraceChannel::from_intensity(acc),
            TraceChannel::from_intensity(vec![300.0; 20]),
        )
        .unwrap();

        assert!(trace.correction_factor(CorrectionFactorKind::Alpha).is_err());

        trace.mark_correction_range(20);
        trace.mark_correction_range(10);
        let alpha = trace.correction_factor(CorrectionFactorKind::Alpha).unwrap();

        // E_app = 0.1, alpha = 0.1 / 0.9
        assert!((alpha - 1.0 / 9.0).abs() < 1e-12);
        assert_eq!(trace.get_alpha(), Some(alpha));

        trace.clear_correction_factors();
        assert_eq!(trace.get_alpha(), None);
    }

    // Test that predictions move every bleach to the detected frame
    #[test]
    fn test_set_predictions() {
        let len = 40;
        let mut trace = flat_trace(len);
        let y_pred = DMatrix::from_fn(len, NUM_CLASSES, |t, c| match (t >= 25, c) {
            (true, 0) => 1.0,
            (false, 3) => 1.0,
            _ => 0.0,
        });

        trace.set_predictions(y_pred, &AnalysisConfig::default()).unwrap();
        assert_eq!(trace.first_bleach(), Some(25));
        assert_eq!(trace.bleaches(), [Some(25); 3]);
        assert_eq!(trace.get_confidence(), Some(1.0));

        let wrong = DMatrix::zeros(len, 4);
        assert!(trace.set_predictions(wrong, &AnalysisConfig::default()).is_err());
    }

    #[test]
    fn test_pretty_name() {
        let mut trace = flat_trace(5);
        trace.pair = Some(3);
        assert_eq!(trace.pretty_name(), "Trace_pair3.txt");

        trace.movie = Some("movie.01.tif".to_string());
        assert_eq!(trace.pretty_name(), "Trace_movie_01_tif_pair3.txt");
    }
}
