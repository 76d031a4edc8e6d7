pub mod intensities;
pub mod factors;

pub use intensities::*;
pub use factors::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scalar correction factors of one analysis context.
/// `alpha` is donor leakage, `delta` direct acceptor excitation,
/// `beta` and `gamma` the detection-efficiency and quantum-yield ratios.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrectionFactors {
    pub alpha: f64,
    pub delta: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for CorrectionFactors {
    fn default() -> Self {
        Self { alpha: 0.0, delta: 0.0, beta: 1.0, gamma: 1.0 }
    }
}

impl CorrectionFactors {
    pub fn new(alpha: f64, delta: f64, beta: f64, gamma: f64) -> Self {
        Self { alpha, delta, beta, gamma }
    }

    // beta = gamma = 1 is the apparent regime
    pub fn is_apparent(&self) -> bool {
        self.beta == 1.0 && self.gamma == 1.0
    }

    pub fn with_beta_gamma(mut self, beta: f64, gamma: f64) -> Self {
        self.beta = beta;
        self.gamma = gamma;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CorrectionError {
    #[error("channel `{channel}` has {found} frames, expected {expected}")]
    ChannelLengthMismatch { channel: &'static str, expected: usize, found: usize },
    #[error("correction window [{start}, {end}) is empty or outside the trace")]
    InvalidWindow { start: usize, end: usize },
}
