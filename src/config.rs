use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::correction::CorrectionFactors;
use crate::population::density::DensitySettings;

pub const CLIP_RANGE_DEFAULT: (f64, f64) = (-0.3, 1.3);
pub const BIC_TOLERANCE_DEFAULT: f64 = 20.0;
pub const MAX_HMM_STATES_DEFAULT: usize = 3;
pub const HMM_MAX_ITERATIONS_DEFAULT: usize = 1000;
pub const HMM_TOLERANCE_DEFAULT: f64 = 1e-2;
pub const BLEACH_THRESHOLD_DEFAULT: f64 = 0.5;
pub const BLEACH_WINDOW_DEFAULT: usize = 7;
pub const GAUSSIAN_MAX_STATES_DEFAULT: usize = 5;

/// Settings shared by every analysis call. Built once, then passed by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub alpha: f64,
    pub delta: f64,
    pub beta: f64,
    pub gamma: f64,
    pub clip_range: (f64, f64),

    pub bic_tolerance: f64,
    pub max_hmm_states: usize,
    pub hmm_max_iterations: usize,
    pub hmm_tolerance: f64,

    pub bleach_threshold: f64,
    pub bleach_window: usize,

    pub gaussian_max_states: usize,
    pub density: DensitySettings,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            alpha: 0.0,
            delta: 0.0,
            beta: 1.0,
            gamma: 1.0,
            clip_range: CLIP_RANGE_DEFAULT,

            bic_tolerance: BIC_TOLERANCE_DEFAULT,
            max_hmm_states: MAX_HMM_STATES_DEFAULT,
            hmm_max_iterations: HMM_MAX_ITERATIONS_DEFAULT,
            hmm_tolerance: HMM_TOLERANCE_DEFAULT,

            bleach_threshold: BLEACH_THRESHOLD_DEFAULT,
            bleach_window: BLEACH_WINDOW_DEFAULT,

            gaussian_max_states: GAUSSIAN_MAX_STATES_DEFAULT,
            density: DensitySettings::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn with_leakage_factors(mut self, alpha: f64, delta: f64) -> Self {
        self.alpha = alpha;
        self.delta = delta;
        self
    }

    pub fn with_detection_factors(mut self, beta: f64, gamma: f64) -> Self {
        self.beta = beta;
        self.gamma = gamma;
        self
    }

    pub fn with_max_hmm_states(mut self, max_hmm_states: usize) -> Self {
        self.max_hmm_states = max_hmm_states;
        self
    }

    pub fn with_bic_tolerance(mut self, bic_tolerance: f64) -> Self {
        self.bic_tolerance = bic_tolerance;
        self
    }

    pub fn correction_factors(&self) -> CorrectionFactors {
        CorrectionFactors {
            alpha: self.alpha,
            delta: self.delta,
            beta: self.beta,
            gamma: self.gamma,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (lo, hi) = self.clip_range;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(ConfigError::InvalidValue {
                field: "clip_range",
                reason: format!("expected finite lower < upper, got ({}, {})", lo, hi),
            });
        }

        for (field, value) in [("alpha", self.alpha), ("delta", self.delta), ("gamma", self.gamma)] {
            if !value.is_finite() {
                return Err(ConfigError::InvalidValue { field, reason: format!("{} is not finite", value) });
            }
        }

        if !(self.beta.is_finite() && self.beta != 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "beta",
                reason: format!("beta must be finite and non-zero, got {}", self.beta),
            });
        }

        if self.max_hmm_states == 0 {
            return Err(ConfigError::InvalidValue { field: "max_hmm_states", reason: "must be at least 1".to_string() });
        }

        if self.hmm_max_iterations == 0 {
            return Err(ConfigError::InvalidValue { field: "hmm_max_iterations", reason: "must be at least 1".to_string() });
        }

        if !(0.0..=1.0).contains(&self.bleach_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "bleach_threshold",
                reason: format!("probability threshold outside [0, 1]: {}", self.bleach_threshold),
            });
        }

        if self.bleach_window == 0 || self.bleach_window % 2 == 0 {
            return Err(ConfigError::InvalidValue {
                field: "bleach_window",
                reason: format!("median filter window must be odd, got {}", self.bleach_window),
            });
        }

        if self.gaussian_max_states == 0 {
            return Err(ConfigError::InvalidValue { field: "gaussian_max_states", reason: "must be at least 1".to_string() });
        }

        self.density.validate()
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read or write config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("unrecognized {kind} `{mode}`")]
    UnknownMode { kind: &'static str, mode: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_hmm_states, 3);
        assert_eq!(config.bleach_window, 7);
        assert_eq!(config.clip_range, (-0.3, 1.3));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = AnalysisConfig::from_json_str(r#"{"alpha": 0.05, "bic_tolerance": 10.0}"#).unwrap();
        assert_eq!(config.alpha, 0.05);
        assert_eq!(config.bic_tolerance, 10.0);
        assert_eq!(config.delta, 0.0);
        assert_eq!(config.max_hmm_states, MAX_HMM_STATES_DEFAULT);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = AnalysisConfig { bleach_window: 6, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { field: "bleach_window", .. })));

        let config = AnalysisConfig { clip_range: (1.0, 0.0), ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { field: "clip_range", .. })));

        let config = AnalysisConfig { beta: 0.0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = AnalysisConfig::default()
            .with_leakage_factors(0.1, 0.05)
            .with_detection_factors(0.9, 1.1);
        config.to_json_file(&path).unwrap();

        let loaded = AnalysisConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
