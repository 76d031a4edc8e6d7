// Score given to a model order whose fit or likelihood evaluation failed
pub const BIC_SENTINEL: f64 = 10e5;

/// Free parameters of a k state model: means, variances, transitions and weights
pub fn num_parameters(num_states: usize) -> usize {
    4 * num_states + num_states * num_states
}

pub fn compute_bic(log_likelihood: f64, num_states: usize, n_samples: usize) -> f64 {
    -2.0 * log_likelihood + (num_parameters(num_states) as f64) * (n_samples as f64).ln()
}

/// Picks an index into `scores` (lower is better). When the runner-up has fewer
/// states and lies within `tolerance` of the best score it wins instead.
pub fn heuristic_bic(scores: &[f64], tolerance: f64) -> Option<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|a, b| scores[*a].total_cmp(&scores[*b]));

    match order.as_slice() {
        [] => None,
        [single] => Some(*single),
        [best, second, ..] => {
            if second < best && scores[*best] + tolerance > scores[*second] {
                Some(*second)
            } else {
                Some(*best)
            }
        }
    }
}
