pub mod config;
pub mod correction;
pub mod population;
pub mod progress;
pub mod signal_analysis;
pub mod tools;
pub mod trace_selection;
