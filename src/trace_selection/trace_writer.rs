use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use thiserror::Error;

use crate::signal_analysis::classification::CLASS_COLUMNS;
use crate::signal_analysis::hmm::Transition;

use super::channel::Channel;
use super::trace::Trace;
use super::trace_set::CorrectionFactorRow;

const EXPORTER: &str = "Exported by DeepFRET";
const TRACE_COLUMNS: [&str; 8] = ["D-Dexc-bg", "A-Dexc-bg", "A-Aexc-bg", "D-Dexc-rw", "A-Dexc-rw", "A-Aexc-rw", "S", "E"];

/// Exporter and date lines shared by every exported file
pub fn info_header() -> (String, String) {
    let date = Local::now().format("%Y-%m-%d, %H:%M");
    (EXPORTER.to_string(), format!("Date: {}", date))
}

fn fmt_value(value: f64) -> String {
    format!("{:.4}", value)
}

fn fmt_option<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "None".to_string(), |v| v.to_string())
}

// Info header, a blank line, then the tab separated table
fn with_header(table: &str) -> String {
    let (exp_txt, date_txt) = info_header();
    format!("{}\n{}\n\n{}", exp_txt, date_txt, table)
}

fn table<I>(columns: &[&str], rows: I) -> String
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut text = columns.join("\t");
    text.push('\n');
    for row in rows {
        text.push_str(&row.join("\t"));
        text.push('\n');
    }
    text
}

/// Full text of an exported trace
pub fn format_trace(trace: &Trace) -> String {
    let (exp_txt, date_txt) = info_header();

    let mut text = format!(
        "{}\n{}\nMovie filename: {}\nFRET pair #{}\nDonor bleaches at: {} - Acceptor bleaches at: {}\n\n",
        exp_txt,
        date_txt,
        trace.movie.as_deref().unwrap_or("None"),
        fmt_option(trace.pair),
        fmt_option(trace.channel(Channel::Green).bleach),
        fmt_option(trace.channel(Channel::Red).bleach),
    );

    let mut columns: Vec<&str> = TRACE_COLUMNS.to_vec();
    if trace.get_y_pred().is_some() {
        columns.extend(CLASS_COLUMNS);
    }

    let grn = trace.channel(Channel::Green);
    let acc = trace.channel(Channel::Acceptor);
    let red = trace.channel(Channel::Red);

    let rows = (0..trace.len()).map(|t| {
        let mut row = vec![
            fmt_value(grn.bg[t]),
            fmt_value(acc.bg[t]),
            fmt_value(red.bg[t]),
            fmt_value(grn.int[t]),
            fmt_value(acc.int[t]),
            fmt_value(red.int[t]),
            fmt_value(trace.get_stoi()[t]),
            fmt_value(trace.get_fret()[t]),
        ];
        if let Some(y_pred) = trace.get_y_pred() {
            row.extend(y_pred.row(t).iter().map(|p| fmt_value(*p)));
        }
        row
    });

    text.push_str(&table(&columns, rows));
    text
}

/// Writes the trace into `dir` under its pretty name
pub fn export_trace<P: AsRef<Path>>(trace: &Trace, dir: P) -> Result<PathBuf, TraceWriterError> {
    let path = dir.as_ref().join(trace.pretty_name());
    fs::write(&path, format_trace(trace))?;
    log::debug!("Exported {} to {}", trace.name, path.display());

    Ok(path)
}

/// Columns alpha, delta, filename. Missing factors are left blank.
pub fn export_correction_factors<P: AsRef<Path>>(rows: &[CorrectionFactorRow], path: P) -> Result<(), TraceWriterError> {
    let blank_or = |value: Option<f64>| value.map_or_else(String::new, fmt_value);
    let rows = rows.iter().map(|row| vec![blank_or(row.alpha), blank_or(row.delta), row.name.clone()]);

    fs::write(path, with_header(&table(&["alpha", "delta", "filename"], rows)))?;
    Ok(())
}

/// Pooled E and S pairs
pub fn export_histogram_data<P: AsRef<Path>>(fret: &[f64], stoi: &[f64], path: P) -> Result<(), TraceWriterError> {
    if fret.len() != stoi.len() {
        return Err(TraceWriterError::LengthMismatch { e: fret.len(), s: stoi.len() });
    }
    let rows = fret.iter().zip(stoi).map(|(e, s)| vec![fmt_value(*e), fmt_value(*s)]);

    fs::write(path, with_header(&table(&["E", "S"], rows)))?;
    Ok(())
}

pub fn export_transition_densities<P: AsRef<Path>>(transitions: &[Transition], path: P) -> Result<(), TraceWriterError> {
    let rows = transitions.iter()
        .map(|t| vec![fmt_value(t.y_before), fmt_value(t.y_after), t.lifetime.to_string()]);

    fs::write(path, with_header(&table(&["E_before", "E_after", "lifetime"], rows)))?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum TraceWriterError {
    #[error("failed to write export: {0}")]
    Io(#[from] io::Error),
    #[error("{e} E values but {s} S values")]
    LengthMismatch { e: usize, s: usize },
}
