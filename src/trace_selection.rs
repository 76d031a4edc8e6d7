pub mod bleaching;
pub mod channel;
pub mod filter;
pub mod trace;
pub mod trace_loader;
pub mod trace_set;
pub mod trace_writer;

pub use channel::{Channel, TraceChannel};
pub use filter::{AdvancedSelection, Comparison, SelectionCondition};
pub use trace::{Trace, TraceError};
pub use trace_loader::{load_trace, load_traces_from_directory, parse_trace, TraceLoaderError};
pub use trace_set::{CorrectionFactorRow, PooledEs, TraceSet, TraceSetError};
pub use trace_writer::{export_correction_factors, export_histogram_data, export_trace, export_transition_densities, TraceWriterError};
