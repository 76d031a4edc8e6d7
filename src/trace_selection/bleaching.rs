use crate::correction::{calc_fret, calc_stoi, corrected_es, CorrectionFactors, Intensities};
use crate::config::CLIP_RANGE_DEFAULT;
use crate::tools::median_filter;

// S window applied when pooling E/S across traces
const TRIM_S_RANGE: (f64, f64) = (-0.3, 1.3);

/// First bleached frame from per-frame bleach probabilities.
/// A bleach detected at frame 0 is treated as noise and gives None.
pub fn find_bleach(p_bleach: &[f64], threshold: f64, window: usize) -> Option<usize> {
    let is_bleached: Vec<f64> = p_bleach.iter()
        .map(|p| if *p > threshold { 1.0 } else { 0.0 })
        .collect();

    let filtered = median_filter(&is_bleached, window);

    match filtered.iter().position(|v| *v > 0.5) {
        Some(0) | None => None,
        Some(frame) => Some(frame),
    }
}

/// Minimum over the set values, None if nothing is set
pub fn min_real(values: &[Option<usize>]) -> Option<usize> {
    values.iter().flatten().min().copied()
}

/// E and S of a trace cut to the frames before the first bleach and to at most `max_frames`.
/// Identity beta/gamma use the apparent expressions, anything else the fully corrected ones.
pub fn drop_bleached_frames(
    intensities: &Intensities,
    bleaches: &[Option<usize>],
    max_frames: Option<usize>,
    factors: &CorrectionFactors,
) -> (Vec<f64>, Vec<f64>) {
    let (mut fret, mut stoi) = if factors.is_apparent() {
        (
            calc_fret(intensities, factors.alpha, factors.delta, CLIP_RANGE_DEFAULT),
            calc_stoi(intensities, factors.alpha, factors.delta, 1.0, 1.0, CLIP_RANGE_DEFAULT),
        )
    } else {
        corrected_es(intensities, factors, CLIP_RANGE_DEFAULT)
    };

    let mut end = fret.len();
    if let Some(bleach) = min_real(bleaches) {
        end = end.min(bleach);
    }
    if let Some(max_frames) = max_frames {
        end = end.min(max_frames);
    }

    fret.truncate(end);
    stoi.truncate(end);

    (fret, stoi)
}

/// Pools per-trace E and S and keeps pairs whose S is strictly inside (-0.3, 1.3)
pub fn trim_es(fret: &[Vec<f64>], stoi: &[Vec<f64>]) -> (Vec<f64>, Vec<f64>) {
    let (lo, hi) = TRIM_S_RANGE;

    fret.iter()
        .flatten()
        .zip(stoi.iter().flatten())
        .filter(|(_, s)| **s > lo && **s < hi)
        .map(|(e, s)| (*e, *s))
        .unzip()
}
