use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::signal_analysis::classification::DYNAMIC_CLASS;
use crate::tools::median;

use super::channel::Channel;
use super::trace::Trace;

// Minimum bleach frame for the channel conditions
const MIN_BLEACH_FRAME: usize = 10;
// Leading frames inspected by the stoichiometry condition
const STOICHIOMETRY_FRAMES: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum Comparison<T> {
    Larger { value: T },
    LargerEq { value: T },
    Smaller { value: T },
    SmallerEq { value: T },
    Equal { value: T },
    Between { low: T, high: T }, // Exclusive on both ends
}

impl<T> Comparison<T>
where
    T: PartialOrd + PartialEq,
{
    pub fn compare(&self, other_value: T) -> bool {
        match self {
            Self::Larger { value } => other_value > *value,
            Self::LargerEq { value } => other_value >= *value,
            Self::Smaller { value } => other_value < *value,
            Self::SmallerEq { value } => other_value <= *value,
            Self::Equal { value } => other_value == *value,
            Self::Between { low, high } => other_value > *low && other_value < *high,
        }
    }
}

// Missing values never pass
fn run_test<T>(comparison: &Comparison<T>, value: Option<T>) -> bool
where
    T: PartialEq + PartialOrd,
{
    value.map_or(false, |value| comparison.compare(value))
}

/// User tunable thresholds of the advanced selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedSelection {
    pub s_median: (f64, f64),
    pub e_median: (f64, f64),
    pub min_frames: usize,
    pub confidence: f64, // 0 disables the classifier conditions
    pub dynamics: f64, // 0 disables the dynamic class condition
    pub bleached_only: bool,
}

impl Default for AdvancedSelection {
    fn default() -> Self {
        Self {
            s_median: (0.2, 0.9),
            e_median: (0.01, 0.99),
            min_frames: 15,
            confidence: 0.0,
            dynamics: 0.0,
            bleached_only: false,
        }
    }
}

impl AdvancedSelection {
    pub fn check_valid(&self, trace: &Trace) -> bool {
        let end = trace.first_bleach().unwrap_or(trace.len());
        let stoi = &trace.get_stoi()[..end];
        let fret = &trace.get_fret()[..end];

        let s_test = Comparison::Between { low: self.s_median.0, high: self.s_median.1 };
        let e_test = Comparison::Between { low: self.e_median.0, high: self.e_median.1 };

        let mut passed = run_test(&s_test, median(stoi)) && run_test(&e_test, median(fret));

        if let Some(first_bleach) = trace.first_bleach() {
            passed &= Comparison::LargerEq { value: self.min_frames }.compare(first_bleach);
        } else if self.bleached_only {
            passed = false;
        }

        if trace.get_y_pred().is_some() && self.confidence > 0.0 {
            passed &= run_test(&Comparison::Larger { value: self.confidence }, trace.get_confidence());

            if self.dynamics > 0.0 {
                let p_dynamic = trace.get_y_class().and_then(|p| p.get(DYNAMIC_CLASS).copied());
                passed &= run_test(&Comparison::LargerEq { value: self.dynamics }, p_dynamic);
            }
        }

        passed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionCondition {
    Green, // Donor bleaches late enough
    Red, // Acceptor bleaches late enough
    Stoichiometry, // Leading frames are doubly labeled
    Advanced(AdvancedSelection),
}

impl SelectionCondition {
    pub fn check_valid(&self, trace: &Trace) -> bool {
        match self {
            Self::Green | Self::Red => {
                let channel = if *self == Self::Green { Channel::Green } else { Channel::Red };
                run_test(&Comparison::LargerEq { value: MIN_BLEACH_FRAME }, trace.channel(channel).bleach)
            }
            Self::Stoichiometry => {
                let stoi = &trace.get_stoi()[..trace.len().min(STOICHIOMETRY_FRAMES)];
                let median_test = Comparison::Between { low: 0.4, high: 0.6 };
                let frame_test = Comparison::Between { low: 0.3, high: 0.7 };

                run_test(&median_test, median(stoi)) && stoi.iter().all(|s| frame_test.compare(*s))
            }
            Self::Advanced(selection) => selection.check_valid(trace),
        }
    }
}

impl FromStr for SelectionCondition {
    type Err = ConfigError;

    /// "advanced" gives the default thresholds
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "green" => Ok(Self::Green),
            "red" => Ok(Self::Red),
            "S" | "stoichiometry" => Ok(Self::Stoichiometry),
            "advanced" => Ok(Self::Advanced(AdvancedSelection::default())),
            _ => Err(ConfigError::UnknownMode { kind: "selection condition", mode: s.to_string() }),
        }
    }
}
