use nalgebra::DMatrix;
use thiserror::Error;

use crate::progress::Progress;

pub const NUM_CLASSES: usize = 6;
pub const CLASS_COLUMNS: [&str; NUM_CLASSES] = ["p_blch", "p_aggr", "p_stat", "p_dyna", "p_nois", "p_scrm"];

pub const BLEACHED_CLASS: usize = 0;
pub const STATIC_CLASS: usize = 2;
pub const DYNAMIC_CLASS: usize = 3;

pub const SKIP_THRESHOLD_DEFAULT: f64 = 0.5;
pub const PREDICTION_BATCH_SIZE: usize = 256;

/// Per-frame class probabilities for a batch of traces. Each input is
/// frames × features, each output must be frames × `NUM_CLASSES`.
pub trait TraceClassifier {
    fn predict(&self, inputs: &[DMatrix<f64>]) -> Result<Vec<DMatrix<f64>>, ClassifierError>;
}

/// Trace level class probabilities and the static + dynamic confidence.
/// Frames whose `skip_column` probability reaches `skip_threshold` are ignored.
pub fn seq_probabilities(y_pred: &DMatrix<f64>, skip_threshold: f64, skip_column: usize) -> (Vec<f64>, f64) {
    let num_classes = y_pred.ncols();
    let mut sums = vec![0.0; num_classes];
    let mut kept = 0_usize;

    if skip_column < num_classes {
        for row in y_pred.row_iter() {
            if row[skip_column] < skip_threshold {
                for (sum, p) in sums.iter_mut().zip(row.iter()) {
                    *sum += p;
                }
                kept += 1;
            }
        }
    }

    let total: f64 = sums.iter().sum();
    let p: Vec<f64> = if kept > 0 && total > 0.0 {
        sums.iter().map(|s| (s / kept as f64) / (total / kept as f64)).collect()
    } else {
        vec![0.0; num_classes]
    };

    let confidence = [STATIC_CLASS, DYNAMIC_CLASS].iter()
        .filter_map(|c| p.get(*c))
        .sum();

    (p, confidence)
}

/// Divides the whole matrix by its maximum, keeping the ratios between features
pub fn sample_max_normalize(x: &DMatrix<f64>) -> DMatrix<f64> {
    let max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max.is_finite() && max != 0.0 {
        x / max
    } else {
        x.clone()
    }
}

/// Runs the classifier batch by batch. A cancel between batches returns the
/// predictions made so far, so the output may be shorter than `inputs`.
pub fn predict_batch<C, P>(
    inputs: &[DMatrix<f64>],
    classifier: &C,
    batch_size: usize,
    progress: &mut P,
) -> Result<Vec<DMatrix<f64>>, ClassifierError>
where
    C: TraceClassifier + ?Sized,
    P: Progress + ?Sized,
{
    if batch_size == 0 {
        return Err(ClassifierError::InvalidBatchSize);
    }

    let normalized: Vec<DMatrix<f64>> = inputs.iter().map(sample_max_normalize).collect();
    let num_batches = normalized.len().div_ceil(batch_size);
    progress.start(num_batches);

    let mut predictions = Vec::with_capacity(inputs.len());
    for batch in normalized.chunks(batch_size) {
        if progress.was_canceled() {
            log::info!("Prediction canceled after {} of {} traces", predictions.len(), inputs.len());
            break;
        }

        let output = classifier.predict(batch)?;
        if output.len() != batch.len() {
            return Err(ClassifierError::BatchSizeMismatch { expected: batch.len(), found: output.len() });
        }

        for (input, prediction) in batch.iter().zip(&output) {
            if prediction.nrows() != input.nrows() || prediction.ncols() != NUM_CLASSES {
                return Err(ClassifierError::InvalidOutputShape {
                    expected: [input.nrows(), NUM_CLASSES],
                    found: [prediction.nrows(), prediction.ncols()],
                });
            }
        }

        predictions.extend(output);
        progress.increment();
    }

    Ok(predictions)
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClassifierError {
    #[error("batch size must be at least 1")]
    InvalidBatchSize,
    #[error("classifier returned {found} predictions for {expected} traces")]
    BatchSizeMismatch { expected: usize, found: usize },
    #[error("prediction of shape {found:?}, expected {expected:?}")]
    InvalidOutputShape { expected: [usize; 2], found: [usize; 2] },
    #[error("classifier failed: {0}")]
    Backend(String),
}
