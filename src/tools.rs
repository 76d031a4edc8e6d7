use nalgebra::DMatrix;

// Median ignoring NaNs. Returns None if nothing is left.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };

    Some(median)
}

// Population mean and standard deviation
pub fn compute_mean_and_std(values: &[f64]) -> [f64; 2] {
    if values.is_empty() {
        return [f64::NAN, f64::NAN];
    }
    let n = values.len() as f64;
    let mean: f64 = values.iter().sum::<f64>() / n;
    let variance: f64 = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    [mean, variance.sqrt()]
}

/// Median filter with zero padding at both edges. `window_size` should be odd;
/// an even size is bumped to the next odd one.
pub fn median_filter(values: &[f64], window_size: usize) -> Vec<f64> {
    let window_size = if window_size % 2 == 0 { window_size + 1 } else { window_size };
    let half = window_size / 2;
    let len = values.len() as isize;

    let mut window: Vec<f64> = Vec::with_capacity(window_size);
    let mut filtered = Vec::with_capacity(values.len());

    for i in 0..len {
        window.clear();
        for j in (i - half as isize)..=(i + half as isize) {
            if j < 0 || j >= len {
                window.push(0.0);
            } else {
                window.push(values[j as usize]);
            }
        }
        window.sort_by(|a, b| a.total_cmp(b));
        filtered.push(window[half]);
    }

    filtered
}

/// Standardizes every column to zero mean and unit (population) variance.
/// Columns without variance are only centered.
pub fn z_score_columns(matrix: &DMatrix<f64>) -> DMatrix<f64> {
    let mut scaled = matrix.clone();

    for mut column in scaled.column_iter_mut() {
        let values: Vec<f64> = column.iter().copied().collect();
        let [mean, std] = compute_mean_and_std(&values);
        let scale = if std > 0.0 && std.is_finite() { std } else { 1.0 };

        for value in column.iter_mut() {
            *value = (*value - mean) / scale;
        }
    }

    scaled
}

/// Start index and length of each run of equal values.
pub fn count_adjacent_values<T: PartialEq>(values: &[T]) -> (Vec<usize>, Vec<usize>) {
    let mut starts = Vec::new();
    let mut lengths = Vec::new();

    let mut i = 0;
    while i < values.len() {
        let start = i;
        while i < values.len() && values[i] == values[start] {
            i += 1;
        }
        starts.push(start);
        lengths.push(i - start);
    }

    (starts, lengths)
}

pub fn all_equal<I>(iterable: I) -> bool
where
    I: IntoIterator,
    I::Item: PartialEq,
{
    let mut iter = iterable.into_iter();
    match iter.next() {
        Some(first) => iter.all(|rest| rest == first),
        None => true,
    }
}
