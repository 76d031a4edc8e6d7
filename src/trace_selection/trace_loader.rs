use std::fs;
use std::path::{Path, PathBuf};

use nalgebra::DMatrix;
use thiserror::Error;

use crate::progress::Progress;
use crate::signal_analysis::classification::{seq_probabilities, BLEACHED_CLASS, NUM_CLASSES, SKIP_THRESHOLD_DEFAULT};

use super::channel::TraceChannel;
use super::trace::{Trace, TraceError};

const ISMS_MARKER: &str = "Exported by iSMS";
const ISMS_HEADER_LINES: usize = 5;
const TABLE_MARKER: &str = "D-Dexc";
const PAIR_MARKER: &str = "FRET pair";
const MOVIE_MARKER: &str = "Movie filename";
const BLEACH_MARKER: &str = "Donor bleaches at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Column {
    BackgroundDDexc,
    BackgroundADexc,
    BackgroundAAexc,
    RawDDexc,
    RawADexc,
    RawAAexc,
    Stoichiometry,
    Fret,
    Class(usize),
    // Older exports carry corrected intensities only
    LegacyDDexc,
    LegacyADexc,
    LegacyAAexc,
}

// Trailing periods of older headers are ignored
fn parse_column(header: &str) -> Result<Column, TraceLoaderError> {
    match header.trim_end_matches('.') {
        "D-Dexc-bg" => Ok(Column::BackgroundDDexc),
        "A-Dexc-bg" => Ok(Column::BackgroundADexc),
        "A-Aexc-bg" => Ok(Column::BackgroundAAexc),
        "D-Dexc-rw" => Ok(Column::RawDDexc),
        "A-Dexc-rw" => Ok(Column::RawADexc),
        "A-Aexc-rw" => Ok(Column::RawAAexc),
        "S" => Ok(Column::Stoichiometry),
        "E" => Ok(Column::Fret),
        "p_blch" => Ok(Column::Class(0)),
        "p_aggr" => Ok(Column::Class(1)),
        "p_stat" => Ok(Column::Class(2)),
        "p_dyna" => Ok(Column::Class(3)),
        "p_nois" => Ok(Column::Class(4)),
        "p_scrm" => Ok(Column::Class(5)),
        "D-Dexc_F" => Ok(Column::LegacyDDexc),
        "A-Dexc_I" => Ok(Column::LegacyADexc),
        "A-Aexc_I" => Ok(Column::LegacyAAexc),
        _ => Err(TraceLoaderError::InvalidHeader { header: header.to_string() }),
    }
}

const ISMS_COLUMNS: [Column; 8] = [
    Column::BackgroundDDexc,
    Column::BackgroundADexc,
    Column::BackgroundAAexc,
    Column::RawDDexc,
    Column::RawADexc,
    Column::RawAAexc,
    Column::Stoichiometry,
    Column::Fret,
];

// First line starting with `marker`
fn seek_line<'a>(contents: &'a str, marker: &str) -> Option<&'a str> {
    contents.lines().map(str::trim).find(|line| line.starts_with(marker))
}

// "Donor bleaches at: X - Acceptor bleaches at: Y", "None" for unset
fn parse_bleaches(line: &str) -> (Option<usize>, Option<usize>) {
    let tokens: Vec<&str> = line.split(' ').collect();
    let parse = |index: usize| tokens.get(index).and_then(|token| token.trim().parse::<usize>().ok());

    (parse(3), parse(8))
}

fn parse_rows<'a, I>(lines: I, columns: &[Column], first_line: usize) -> Result<Vec<Vec<f64>>, TraceLoaderError>
where
    I: Iterator<Item = &'a str>,
{
    let mut table = vec![Vec::new(); columns.len()];

    for (offset, line) in lines.enumerate() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        let values = tokens.iter()
            .map(|token| token.parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|_| TraceLoaderError::InvalidLine { line_num: first_line + offset, reason: "non-numeric value".to_string() })?;

        if values.len() != columns.len() {
            return Err(TraceLoaderError::LineHasLessValues {
                line_num: first_line + offset,
                num_line_values: values.len(),
                num_header_values: columns.len(),
            });
        }

        for (column, value) in table.iter_mut().zip(values) {
            column.push(value);
        }
    }

    Ok(table)
}

/// Parses an exported trace. A file without the pair, movie or bleach
/// markers is not a trace and gives `Ok(None)`.
pub fn parse_trace(contents: &str, file_name: &str) -> Result<Option<Trace>, TraceLoaderError> {
    let (pair_line, movie_line, bleach_line) = match (
        seek_line(contents, PAIR_MARKER),
        seek_line(contents, MOVIE_MARKER),
        seek_line(contents, BLEACH_MARKER),
    ) {
        (Some(pair), Some(movie), Some(bleach)) => (pair, movie, bleach),
        _ => return Ok(None),
    };

    // "FRET pair #None" for a trace that never had a pair number
    let pair = match pair_line.rsplit('#').next().map(str::trim) {
        Some("None") => None,
        token => Some(token.and_then(|n| n.parse::<usize>().ok()).ok_or_else(|| TraceLoaderError::InvalidLine {
            line_num: 0,
            reason: format!("invalid pair number in `{}`", pair_line),
        })?),
    };
    let movie = movie_line.rsplit(": ").next()
        .map(str::trim)
        .filter(|movie| *movie != "None")
        .map(str::to_string);

    let lines: Vec<&str> = contents.lines().collect();

    let (columns, table) = if lines.first().map(|line| line.trim()) == Some(ISMS_MARKER) {
        let first_row = lines.iter().skip(ISMS_HEADER_LINES).find(|line| !line.trim().is_empty());
        let num_values = first_row.map_or(0, |line| line.split_whitespace().count());
        let columns: Vec<Column> = match num_values {
            8 => ISMS_COLUMNS.to_vec(),
            5 => ISMS_COLUMNS[3..].to_vec(),
            found => return Err(TraceLoaderError::InvalidColumnCount { found }),
        };
        let table = parse_rows(lines.iter().skip(ISMS_HEADER_LINES).copied(), &columns, ISMS_HEADER_LINES)?;
        (columns, table)
    } else {
        let header_line = lines.iter()
            .position(|line| line.trim_start().starts_with(TABLE_MARKER))
            .ok_or(TraceLoaderError::MissingTable)?;
        let columns = lines[header_line]
            .split_whitespace()
            .map(parse_column)
            .collect::<Result<Vec<Column>, _>>()?;
        let table = parse_rows(lines.iter().skip(header_line + 1).copied(), &columns, header_line + 1)?;
        (columns, table)
    };

    let column = |wanted: Column| columns.iter().position(|c| *c == wanted).map(|i| table[i].clone());
    let len = table.first().map_or(0, |column| column.len());
    let zeros = vec![0.0; len];

    let (mut grn, mut acc, mut red) = if columns.contains(&Column::LegacyDDexc) {
        log::warn!("{} uses the legacy column layout", file_name);
        (
            TraceChannel::from_intensity(column(Column::LegacyDDexc).ok_or(TraceLoaderError::MissingColumn { column: "D-Dexc_F" })?),
            TraceChannel::from_intensity(column(Column::LegacyADexc).ok_or(TraceLoaderError::MissingColumn { column: "A-Dexc_I" })?),
            TraceChannel::from_intensity(column(Column::LegacyAAexc).ok_or(TraceLoaderError::MissingColumn { column: "A-Aexc_I" })?),
        )
    } else {
        (
            TraceChannel::new(
                column(Column::RawDDexc).ok_or(TraceLoaderError::MissingColumn { column: "D-Dexc-rw" })?,
                column(Column::BackgroundDDexc).unwrap_or_else(|| zeros.clone()),
            ),
            TraceChannel::new(
                column(Column::RawADexc).ok_or(TraceLoaderError::MissingColumn { column: "A-Dexc-rw" })?,
                column(Column::BackgroundADexc).unwrap_or_else(|| zeros.clone()),
            ),
            TraceChannel::new(
                column(Column::RawAAexc).ok_or(TraceLoaderError::MissingColumn { column: "A-Aexc-rw" })?,
                column(Column::BackgroundAAexc).unwrap_or_else(|| zeros.clone()),
            ),
        )
    };

    // Bleaches past the end of the table are dropped
    let (grn_bleach, red_bleach) = parse_bleaches(bleach_line);
    grn.bleach = grn_bleach.filter(|frame| *frame < len);
    red.bleach = red_bleach.filter(|frame| *frame < len);
    acc.bleach = None;

    let mut trace = Trace::new(file_name, grn, acc, red).map_err(|error| TraceLoaderError::TraceError { error })?;
    trace.pair = pair;
    trace.movie = movie;

    // Stored E and S may carry corrections; legacy tables only have intensities
    if let (Some(fret), Some(stoi)) = (column(Column::Fret), column(Column::Stoichiometry)) {
        trace.restore_es(fret, stoi).map_err(|error| TraceLoaderError::TraceError { error })?;
    }

    let class_columns: Vec<Vec<f64>> = (0..NUM_CLASSES).filter_map(|c| column(Column::Class(c))).collect();
    if class_columns.len() == NUM_CLASSES {
        let y_pred = DMatrix::from_fn(len, NUM_CLASSES, |t, c| class_columns[c][t]);
        let (y_class, confidence) = seq_probabilities(&y_pred, SKIP_THRESHOLD_DEFAULT, BLEACHED_CLASS);
        trace.restore_predictions(y_pred, y_class, confidence);
    }

    Ok(Some(trace))
}

pub fn load_trace<P: AsRef<Path>>(path: P) -> Result<Option<Trace>, TraceLoaderError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .map_err(|err| TraceLoaderError::FailedToLoadSingleFile { file: path.display().to_string(), reason: err.to_string() })?;

    let file_name = path.file_name().map_or_else(|| path.display().to_string(), |name| name.to_string_lossy().to_string());

    parse_trace(&contents, &file_name)
}

/// Loads every trace file of a directory in name order. Files that fail to
/// parse or carry no trace are skipped with a warning.
pub fn load_traces_from_directory<P, G>(dir: P, progress: &mut G) -> Result<Vec<Trace>, TraceLoaderError>
where
    P: AsRef<Path>,
    G: Progress + ?Sized,
{
    let entries = fs::read_dir(dir.as_ref())
        .map_err(|_| TraceLoaderError::InvalidDirectoryName { dir: dir.as_ref().display().to_string() })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.is_file())
        .collect();
    paths.sort();

    progress.start(paths.len());
    let mut traces = Vec::with_capacity(paths.len());

    for path in paths {
        if progress.was_canceled() {
            break;
        }

        log::debug!("Loading file: {}", path.display());
        match load_trace(&path) {
            Ok(Some(trace)) => traces.push(trace),
            Ok(None) => log::warn!("{} holds no trace, skipped", path.display()),
            Err(err) => log::warn!("Failed to load {}: {}", path.display(), err),
        }
        progress.increment();
    }

    Ok(traces)
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TraceLoaderError {
    #[error("line {line_num} has {num_line_values} values for {num_header_values} columns")]
    LineHasLessValues { line_num: usize, num_line_values: usize, num_header_values: usize },
    #[error("unknown column `{header}`")]
    InvalidHeader { header: String },
    #[error("table with {found} columns is neither the full nor the reduced layout")]
    InvalidColumnCount { found: usize },
    #[error("no table header")]
    MissingTable,
    #[error("column `{column}` missing")]
    MissingColumn { column: &'static str },
    #[error("invalid line {line_num}: {reason}")]
    InvalidLine { line_num: usize, reason: String },
    #[error("{error}")]
    TraceError { error: TraceError },
    #[error("failed to read {file}: {reason}")]
    FailedToLoadSingleFile { file: String, reason: String },
    #[error("cannot read directory {dir}")]
    InvalidDirectoryName { dir: String },
}
