use nalgebra::{DMatrix, DVector};

use super::hmm_matrices::*;
use super::state::*;

/// Emission probabilities per state and frame, rescaled by the per-frame
/// maximum so that exp() never underflows. `log_shifts[t]` holds that maximum.
#[derive(Debug, Clone)]
pub struct EmissionMatrix {
    pub scaled: Vec<Vec<f64>>, // [state][t]
    pub log_shifts: Vec<f64>,
}

impl EmissionMatrix {
    pub fn compute(states: &[State], observations: &DMatrix<f64>) -> Self {
        let num_observations = observations.nrows();

        let rows: Vec<DVector<f64>> = (0..num_observations)
            .map(|t| observations.row(t).transpose())
            .collect();

        let log_probs: Vec<Vec<f64>> = states.iter()
            .map(|state| rows.iter().map(|x| state.log_emission_probability(x)).collect())
            .collect();

        let log_shifts: Vec<f64> = (0..num_observations)
            .map(|t| log_probs.iter().map(|row| row[t]).fold(f64::NEG_INFINITY, f64::max))
            .collect();

        let scaled = log_probs.iter()
            .map(|row| row.iter().zip(&log_shifts).map(|(lp, shift)| (lp - shift).exp()).collect())
            .collect();

        Self { scaled, log_shifts }
    }

    pub fn num_observations(&self) -> usize {
        self.log_shifts.len()
    }
}

/// Scaled forward pass. Returns the alphas, normalized per frame, and the
/// normalization constants. None if a frame has zero probability under every state.
pub fn compute_scaled_alphas(
    emissions: &EmissionMatrix,
    start_matrix: &StartMatrix,
    transition_matrix: &TransitionMatrix,
) -> Option<(Vec<Vec<f64>>, Vec<f64>)> {
    let num_states = start_matrix.len();
    let num_observations = emissions.num_observations();

    let mut alphas = vec![vec![0.0; num_observations]; num_states];
    let mut scaling_factors = Vec::with_capacity(num_observations);

    for t in 0..num_observations {
        let mut normalization = 0.0;

        for j in 0..num_states {
            let prior = if t == 0 {
                start_matrix[j]
            } else {
                (0..num_states).map(|i| alphas[i][t - 1] * transition_matrix[(i, j)]).sum()
            };

            alphas[j][t] = prior * emissions.scaled[j][t];
            normalization += alphas[j][t];
        }

        if !(normalization > 0.0 && normalization.is_finite()) {
            return None;
        }

        for alpha in alphas.iter_mut() {
            alpha[t] /= normalization;
        }
        scaling_factors.push(normalization);
    }

    Some((alphas, scaling_factors))
}

pub fn compute_scaled_betas(
    emissions: &EmissionMatrix,
    transition_matrix: &TransitionMatrix,
    scaling_factors: &[f64],
) -> Vec<Vec<f64>> {
    let num_states = transition_matrix.len();
    let num_observations = emissions.num_observations();

    let mut betas = vec![vec![0.0; num_observations]; num_states];
    if num_observations == 0 {
        return betas;
    }

    for beta in betas.iter_mut() {
        beta[num_observations - 1] = 1.0;
    }

    for t in (0..num_observations - 1).rev() {
        for i in 0..num_states {
            let value: f64 = (0..num_states)
                .map(|j| transition_matrix[(i, j)] * emissions.scaled[j][t + 1] * betas[j][t + 1])
                .sum();
            betas[i][t] = value / scaling_factors[t + 1];
        }
    }

    betas
}

// Scaled alphas and betas multiply straight into posteriors
pub fn compute_gammas_with_scaled(alphas: &[Vec<f64>], betas: &[Vec<f64>]) -> Vec<Vec<f64>> {
    alphas.iter()
        .zip(betas)
        .map(|(alpha, beta)| alpha.iter().zip(beta).map(|(a, b)| a * b).collect())
        .collect()
}

/// Expected transition counts summed over time, `[from][to]`
pub fn compute_xi_sums_with_scaled(
    emissions: &EmissionMatrix,
    transition_matrix: &TransitionMatrix,
    alphas: &[Vec<f64>],
    betas: &[Vec<f64>],
    scaling_factors: &[f64],
) -> Vec<Vec<f64>> {
    let num_states = transition_matrix.len();
    let num_observations = emissions.num_observations();

    let mut xi_sums = vec![vec![0.0; num_states]; num_states];

    for t in 0..num_observations.saturating_sub(1) {
        for i in 0..num_states {
            for j in 0..num_states {
                xi_sums[i][j] += alphas[i][t]
                    * transition_matrix[(i, j)]
                    * emissions.scaled[j][t + 1]
                    * betas[j][t + 1]
                    / scaling_factors[t + 1];
            }
        }
    }

    xi_sums
}

pub fn log_likelihood_from_scaling(emissions: &EmissionMatrix, scaling_factors: &[f64]) -> f64 {
    scaling_factors.iter()
        .zip(&emissions.log_shifts)
        .map(|(c, shift)| c.ln() + shift)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_states() -> Vec<State> {
        vec![
            State::new_1d(0, 0.0, 1.0).unwrap(),
            State::new_1d(1, 3.0, 1.0).unwrap(),
        ]
    }

    // Brute force likelihood over every path of a short sequence
    fn brute_force_likelihood(states: &[State], start: &StartMatrix, transition: &TransitionMatrix, obs: &[f64]) -> f64 {
        let n = states.len();
        let t_len = obs.len();
        let mut total = 0.0;

        for code in 0..n.pow(t_len as u32) {
            let mut path = Vec::with_capacity(t_len);
            let mut c = code;
            for _ in 0..t_len {
                path.push(c % n);
                c /= n;
            }

            let mut p = start[path[0]];
            for t in 0..t_len {
                if t > 0 {
                    p *= transition[(path[t - 1], path[t])];
                }
                let x = DVector::from_element(1, obs[t]);
                p *= states[path[t]].log_emission_probability(&x).exp();
            }
            total += p;
        }

        total.ln()
    }

    // Test that the scaled forward pass reproduces the exact likelihood
    #[test]
    fn test_scaled_forward_likelihood() {
        let states = two_states();
        let start = StartMatrix::new(vec![0.6, 0.4]);
        let transition = TransitionMatrix::new(vec![vec![0.9, 0.1], vec![0.2, 0.8]]);
        let obs = vec![0.1, 2.5, 3.2, -0.4, 0.3];
        let observations = DMatrix::from_column_slice(obs.len(), 1, &obs);

        let emissions = EmissionMatrix::compute(&states, &observations);
        let (_, scaling) = compute_scaled_alphas(&emissions, &start, &transition).unwrap();
        let log_likelihood = log_likelihood_from_scaling(&emissions, &scaling);

        let expected = brute_force_likelihood(&states, &start, &transition, &obs);
        assert!((log_likelihood - expected).abs() < 1e-9);
    }

    // Test that posteriors are normalized and expected transitions sum to T - 1
    #[test]
    fn test_gammas_and_xis_normalized() {
        let states = two_states();
        let start = StartMatrix::new_balanced(2);
        let transition = TransitionMatrix::new(vec![vec![0.7, 0.3], vec![0.4, 0.6]]);
        let obs = vec![0.0, 0.2, 2.9, 3.1, 3.0, 0.1];
        let observations = DMatrix::from_column_slice(obs.len(), 1, &obs);

        let emissions = EmissionMatrix::compute(&states, &observations);
        let (alphas, scaling) = compute_scaled_alphas(&emissions, &start, &transition).unwrap();
        let betas = compute_scaled_betas(&emissions, &transition, &scaling);
        let gammas = compute_gammas_with_scaled(&alphas, &betas);

        for t in 0..obs.len() {
            let sum: f64 = gammas.iter().map(|g| g[t]).sum();
            assert!((sum - 1.0).abs() < 1e-9);
        }

        let xi_sums = compute_xi_sums_with_scaled(&emissions, &transition, &alphas, &betas, &scaling);
        let total: f64 = xi_sums.iter().flatten().sum();
        assert!((total - (obs.len() - 1) as f64).abs() < 1e-9);
    }
}
