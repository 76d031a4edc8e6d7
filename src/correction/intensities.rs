use crate::config::CLIP_RANGE_DEFAULT;

use super::{CorrectionError, CorrectionFactors};

/// Borrowed raw intensities and backgrounds of the three channels of a trace.
#[derive(Debug, Clone, Copy)]
pub struct Intensities<'a> {
    pub grn_int: &'a [f64],
    pub grn_bg: &'a [f64],
    pub acc_int: &'a [f64],
    pub acc_bg: &'a [f64],
    pub red_int: &'a [f64],
    pub red_bg: &'a [f64],
}

impl<'a> Intensities<'a> {
    pub fn new(
        grn_int: &'a [f64],
        grn_bg: &'a [f64],
        acc_int: &'a [f64],
        acc_bg: &'a [f64],
        red_int: &'a [f64],
        red_bg: &'a [f64],
    ) -> Result<Self, CorrectionError> {
        let expected = grn_int.len();

        let channels = [
            ("grn_bg", grn_bg.len()),
            ("acc_int", acc_int.len()),
            ("acc_bg", acc_bg.len()),
            ("red_int", red_int.len()),
            ("red_bg", red_bg.len()),
        ];

        for (channel, found) in channels {
            if found != expected {
                return Err(CorrectionError::ChannelLengthMismatch { channel, expected, found });
            }
        }

        Ok(Self { grn_int, grn_bg, acc_int, acc_bg, red_int, red_bg })
    }

    pub fn len(&self) -> usize {
        self.grn_int.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grn_int.is_empty()
    }
}

/// Background-subtracted channels plus the leakage and direct excitation
/// corrected acceptor signal
#[derive(Debug, Clone, PartialEq)]
pub struct CorrectedIntensities {
    pub f_da: Vec<f64>,
    pub i_dd: Vec<f64>,
    pub i_da: Vec<f64>,
    pub i_aa: Vec<f64>,
}

impl CorrectedIntensities {
    pub fn len(&self) -> usize {
        self.i_dd.len()
    }

    pub fn is_empty(&self) -> bool {
        self.i_dd.is_empty()
    }
}

pub fn correct_intensities(intensities: &Intensities, alpha: f64, delta: f64) -> CorrectedIntensities {
    let len = intensities.len();

    let mut f_da = Vec::with_capacity(len);
    let mut i_dd = Vec::with_capacity(len);
    let mut i_da = Vec::with_capacity(len);
    let mut i_aa = Vec::with_capacity(len);

    for t in 0..len {
        let dd = intensities.grn_int[t] - intensities.grn_bg[t];
        let da = intensities.acc_int[t] - intensities.acc_bg[t];
        let aa = intensities.red_int[t] - intensities.red_bg[t];

        f_da.push(da - alpha * dd - delta * aa);
        i_dd.push(dd);
        i_da.push(da);
        i_aa.push(aa);
    }

    CorrectedIntensities { f_da, i_dd, i_da, i_aa }
}

// Saturate into the clip range, whichever order its bounds come in.
// NaN (0/0) goes to the lower bound.
pub fn clip(value: f64, clip_range: (f64, f64)) -> f64 {
    let (lo, hi) = (clip_range.0.min(clip_range.1), clip_range.0.max(clip_range.1));
    if value.is_nan() {
        return lo;
    }
    value.max(lo).min(hi)
}

pub fn calc_fret(intensities: &Intensities, alpha: f64, delta: f64, clip_range: (f64, f64)) -> Vec<f64> {
    let corrected = correct_intensities(intensities, alpha, delta);

    corrected.f_da.iter()
        .zip(&corrected.i_dd)
        .map(|(f_da, i_dd)| clip(f_da / (i_dd + f_da), clip_range))
        .collect()
}

pub fn calc_stoi(
    intensities: &Intensities,
    alpha: f64,
    delta: f64,
    beta: f64,
    gamma: f64,
    clip_range: (f64, f64),
) -> Vec<f64> {
    let corrected = correct_intensities(intensities, alpha, delta);
    let inv_beta = 1.0 / beta;

    (0..corrected.len())
        .map(|t| {
            let numerator = gamma * corrected.i_dd[t] + corrected.f_da[t];
            clip(numerator / (numerator + inv_beta * corrected.i_aa[t]), clip_range)
        })
        .collect()
}

/// Fully corrected E and S, used for pooled analysis once beta and gamma are known
pub fn corrected_es(intensities: &Intensities, factors: &CorrectionFactors, clip_range: (f64, f64)) -> (Vec<f64>, Vec<f64>) {
    let corrected = correct_intensities(intensities, factors.alpha, factors.delta);

    let mut fret = Vec::with_capacity(corrected.len());
    let mut stoi = Vec::with_capacity(corrected.len());

    for t in 0..corrected.len() {
        let f_dd = factors.gamma * corrected.i_dd[t];
        let f_aa = corrected.i_aa[t] / factors.beta;
        let f_da = corrected.f_da[t];

        fret.push(clip(f_da / (f_da + f_dd), clip_range));
        stoi.push(clip((f_da + f_dd) / (f_dd + f_da + f_aa), clip_range));
    }

    (fret, stoi)
}

// Apparent E and S with the default clip range, as shown for single traces
pub fn apparent_es(intensities: &Intensities) -> (Vec<f64>, Vec<f64>) {
    (
        calc_fret(intensities, 0.0, 0.0, CLIP_RANGE_DEFAULT),
        calc_stoi(intensities, 0.0, 0.0, 1.0, 1.0, CLIP_RANGE_DEFAULT),
    )
}
