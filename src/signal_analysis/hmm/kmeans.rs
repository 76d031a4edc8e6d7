use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

pub const KMEANS_SEED: u64 = 42;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum KMeansError {
    #[error("cannot form {k} clusters from {num_points} points")]
    NotEnoughPoints { k: usize, num_points: usize },
    #[error("number of clusters must be at least 1")]
    ZeroClusters,
}

fn squared_distance(data: &DMatrix<f64>, row: usize, center: &DVector<f64>) -> f64 {
    data.row(row).iter().zip(center.iter()).map(|(a, b)| (a - b).powi(2)).sum()
}

// k-means++ seeding: each new center is drawn with probability proportional
// to the squared distance to the closest existing one
fn plus_plus_centers(data: &DMatrix<f64>, k: usize, rng: &mut StdRng) -> Vec<DVector<f64>> {
    let num_points = data.nrows();
    let mut centers: Vec<DVector<f64>> = Vec::with_capacity(k);

    let first = rng.gen_range(0..num_points);
    centers.push(data.row(first).transpose());

    let mut closest: Vec<f64> = (0..num_points).map(|i| squared_distance(data, i, &centers[0])).collect();

    while centers.len() < k {
        let total: f64 = closest.iter().sum();

        let next = if total > 0.0 {
            let target = rng.gen_range(0.0..total);
            let mut cumulative = 0.0;
            let mut chosen = num_points - 1;
            for (i, d) in closest.iter().enumerate() {
                cumulative += d;
                if cumulative > target {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            // Every point sits on a center already
            rng.gen_range(0..num_points)
        };

        let center = data.row(next).transpose();
        for (i, d) in closest.iter_mut().enumerate() {
            *d = d.min(squared_distance(data, i, &center));
        }
        centers.push(center);
    }

    centers
}

/// Lloyd's k-means over the rows of `data`, seeded for reproducibility.
/// Returns the centers and the cluster of every row.
pub fn k_means(
    data: &DMatrix<f64>,
    k: usize,
    max_iterations: usize,
    tolerance: f64,
    seed: u64,
) -> Result<(Vec<DVector<f64>>, Vec<usize>), KMeansError> {
    if k == 0 {
        return Err(KMeansError::ZeroClusters);
    }
    let num_points = data.nrows();
    if num_points < k {
        return Err(KMeansError::NotEnoughPoints { k, num_points });
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut centers = plus_plus_centers(data, k, &mut rng);
    let mut assignments = vec![0; num_points];

    for iteration in 0..max_iterations {
        let mut changes = 0;

        // Assign every point to the nearest center
        for (i, assignment) in assignments.iter_mut().enumerate() {
            let mut best = 0;
            let mut best_distance = f64::INFINITY;
            for (c, center) in centers.iter().enumerate() {
                let distance = squared_distance(data, i, center);
                if distance < best_distance {
                    best_distance = distance;
                    best = c;
                }
            }
            if *assignment != best || iteration == 0 {
                changes += 1;
                *assignment = best;
            }
        }

        // Recompute centers, empty clusters keep their old position
        let mut sums = vec![DVector::zeros(data.ncols()); k];
        let mut counts = vec![0_usize; k];
        for (i, assignment) in assignments.iter().enumerate() {
            sums[*assignment] += data.row(i).transpose();
            counts[*assignment] += 1;
        }

        let mut max_shift: f64 = 0.0;
        for c in 0..k {
            if counts[c] > 0 {
                let new_center = &sums[c] / counts[c] as f64;
                max_shift = max_shift.max((&new_center - &centers[c]).norm());
                centers[c] = new_center;
            }
        }

        if max_shift < tolerance || changes == 0 {
            break;
        }
    }

    Ok((centers, assignments))
}

/// 1D k-means seeded at evenly spaced quantiles of the data
pub fn k_means_1d(data: &[f64], k: usize, max_iterations: usize, tolerance: f64) -> Result<(Vec<f64>, Vec<usize>), KMeansError> {
    if k == 0 {
        return Err(KMeansError::ZeroClusters);
    }
    if data.len() < k {
        return Err(KMeansError::NotEnoughPoints { k, num_points: data.len() });
    }

    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mut centers: Vec<f64> = (0..k)
        .map(|i| {
            let q = (i as f64 + 0.5) / k as f64;
            sorted[((q * sorted.len() as f64) as usize).min(sorted.len() - 1)]
        })
        .collect();

    let mut assignments = vec![0; data.len()];

    for _ in 0..max_iterations {
        for (i, &point) in data.iter().enumerate() {
            assignments[i] = centers.iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| (*a - point).abs().total_cmp(&(*b - point).abs()))
                .map(|(idx, _)| idx)
                .unwrap_or(0);
        }

        let mut new_centers = centers.clone();
        let mut sums = vec![0.0; k];
        let mut counts = vec![0_usize; k];
        for (assignment, &point) in assignments.iter().zip(data) {
            sums[*assignment] += point;
            counts[*assignment] += 1;
        }
        for c in 0..k {
            if counts[c] > 0 {
                new_centers[c] = sums[c] / counts[c] as f64;
            }
        }

        let max_shift = centers.iter()
            .zip(&new_centers)
            .map(|(old, new)| (old - new).abs())
            .fold(0.0, f64::max);

        centers = new_centers;
        if max_shift < tolerance {
            break;
        }
    }

    Ok((centers, assignments))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test that every point ends up at its nearest center
    #[test]
    fn test_k_means_1d() {
        let data = vec![1.0, 1.1, 1.2, 5.0, 5.1, 5.2, 10.0, 10.1, 10.2];
        let (centers, assignments) = k_means_1d(&data, 3, 100, 1e-4).unwrap();

        assert_eq!(centers.len(), 3);
        for (i, &point) in data.iter().enumerate() {
            let own = (point - centers[assignments[i]]).abs();
            for &center in &centers {
                assert!(own <= (point - center).abs());
            }
        }

        let mut sorted = centers.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        assert!((sorted[0] - 1.1).abs() < 1e-9);
        assert!((sorted[1] - 5.1).abs() < 1e-9);
        assert!((sorted[2] - 10.1).abs() < 1e-9);
    }

    // Test 2D clustering of two separated blobs
    #[test]
    fn test_k_means_2d() {
        let mut values = Vec::new();
        for i in 0..10 {
            let jitter = i as f64 * 0.01;
            values.extend_from_slice(&[0.0 + jitter, 0.0 - jitter]);
        }
        for i in 0..10 {
            let jitter = i as f64 * 0.01;
            values.extend_from_slice(&[5.0 - jitter, 5.0 + jitter]);
        }
        let data = DMatrix::from_row_slice(20, 2, &values);

        let (centers, assignments) = k_means(&data, 2, 100, 1e-6, KMEANS_SEED).unwrap();
        assert_eq!(centers.len(), 2);

        // Same blob, same cluster
        assert!(assignments[..10].iter().all(|a| *a == assignments[0]));
        assert!(assignments[10..].iter().all(|a| *a == assignments[10]));
        assert_ne!(assignments[0], assignments[10]);
    }

    #[test]
    fn test_k_means_not_enough_points() {
        let data = DMatrix::from_row_slice(2, 1, &[0.0, 1.0]);
        assert_eq!(k_means(&data, 3, 10, 1e-6, KMEANS_SEED), Err(KMeansError::NotEnoughPoints { k: 3, num_points: 2 }));
        assert_eq!(k_means_1d(&[1.0], 0, 10, 1e-6), Err(KMeansError::ZeroClusters));
    }
}
