use crate::signal_analysis::hmm::Transition;

/// Shifted exponential `pdf(t) = exp(-(t - loc) / scale) / scale` for `t >= loc`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialFit {
    pub loc: f64,
    pub scale: f64,
}

impl ExponentialFit {
    pub fn pdf(&self, t: f64) -> f64 {
        if t < self.loc || self.scale <= 0.0 {
            return 0.0;
        }
        (-(t - self.loc) / self.scale).exp() / self.scale
    }

    // Mean dwell time
    pub fn mean_lifetime(&self) -> f64 {
        self.loc + self.scale
    }
}

/// Maximum likelihood fit with a free location: loc = min, scale = mean - min.
/// Empty or non-finite input gives None.
pub fn fit_exponential_lifetime(lifetimes: &[f64]) -> Option<ExponentialFit> {
    if lifetimes.is_empty() || lifetimes.iter().any(|t| !t.is_finite()) {
        return None;
    }

    let loc = lifetimes.iter().copied().fold(f64::INFINITY, f64::min);
    let mean = lifetimes.iter().sum::<f64>() / lifetimes.len() as f64;

    Some(ExponentialFit { loc, scale: mean - loc })
}

/// Lifetimes of transitions from a level inside `from` to a level inside `to`, both inclusive
pub fn select_lifetimes(transitions: &[Transition], from: (f64, f64), to: (f64, f64)) -> Vec<f64> {
    transitions.iter()
        .filter(|t| t.y_before >= from.0 && t.y_before <= from.1)
        .filter(|t| t.y_after >= to.0 && t.y_after <= to.1)
        .map(|t| t.lifetime as f64)
        .collect()
}
