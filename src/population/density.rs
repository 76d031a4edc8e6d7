use std::f64::consts::PI;
use std::str::FromStr;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

pub const BANDWIDTH_DEFAULT: f64 = 0.1;
pub const RESOLUTION_DEFAULT: usize = 100;
pub const N_COLORS_DEFAULT: usize = 2;
pub const EXTEND_GRID_DEFAULT: f64 = 1.0;

// Acceptable tick multiples, from 1 to 10
const LOCATOR_STEPS: [f64; 10] = [1.0, 1.5, 2.0, 2.5, 3.0, 4.0, 5.0, 6.0, 8.0, 10.0];
const LOCATOR_OFFSET_THRESHOLD: f64 = 100.0;

/// Smoothing kernels of the density estimate, normalized over the plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kernel {
    Gaussian,
    Tophat,
    #[serde(alias = "epa")]
    Epanechnikov,
    Exponential,
    Linear,
    Cosine,
}

impl Kernel {
    /// Kernel value at distance `r` for bandwidth `h`
    pub fn evaluate(&self, r: f64, h: f64) -> f64 {
        let h2 = h * h;
        let u = r / h;

        match self {
            Kernel::Gaussian => (-0.5 * u * u).exp() / (2.0 * PI * h2),
            Kernel::Exponential => (-u).exp() / (2.0 * PI * h2),
            _ if u >= 1.0 => 0.0,
            Kernel::Tophat => 1.0 / (PI * h2),
            Kernel::Epanechnikov => (1.0 - u * u) * 2.0 / (PI * h2),
            Kernel::Linear => (1.0 - u) * 3.0 / (PI * h2),
            Kernel::Cosine => (0.5 * PI * u).cos() / ((4.0 - 8.0 / PI) * h2),
        }
    }
}

impl FromStr for Kernel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "gaussian" => Ok(Kernel::Gaussian),
            "tophat" => Ok(Kernel::Tophat),
            "epanechnikov" | "epa" => Ok(Kernel::Epanechnikov),
            "exponential" => Ok(Kernel::Exponential),
            "linear" => Ok(Kernel::Linear),
            "cosine" => Ok(Kernel::Cosine),
            _ => Err(ConfigError::UnknownMode { kind: "kernel", mode: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensitySettings {
    pub bandwidth: Option<f64>, // None picks n^(-1/6)
    pub kernel: Kernel,
    pub resolution: usize,
    pub n_colors: usize,
    pub extend_grid: f64,
    pub shade_lowest: bool,
    pub levels: Option<Vec<f64>>, // Replaces the locator levels
}

impl Default for DensitySettings {
    fn default() -> Self {
        Self {
            bandwidth: Some(BANDWIDTH_DEFAULT),
            kernel: Kernel::Gaussian,
            resolution: RESOLUTION_DEFAULT,
            n_colors: N_COLORS_DEFAULT,
            extend_grid: EXTEND_GRID_DEFAULT,
            shade_lowest: false,
            levels: None,
        }
    }
}

impl DensitySettings {
    /// Coarser linear-kernel grid used for transition density plots
    pub fn transition_density() -> Self {
        Self {
            bandwidth: Some(0.05),
            kernel: Kernel::Linear,
            resolution: 40,
            n_colors: 5,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(bandwidth) = self.bandwidth {
            if !(bandwidth.is_finite() && bandwidth > 0.0) {
                return Err(ConfigError::InvalidValue {
                    field: "density.bandwidth",
                    reason: format!("must be finite and positive, got {}", bandwidth),
                });
            }
        }

        if self.resolution < 2 {
            return Err(ConfigError::InvalidValue { field: "density.resolution", reason: "must be at least 2".to_string() });
        }

        if self.n_colors == 0 {
            return Err(ConfigError::InvalidValue { field: "density.n_colors", reason: "must be at least 1".to_string() });
        }

        if !(self.extend_grid.is_finite() && self.extend_grid >= 0.0) {
            return Err(ConfigError::InvalidValue {
                field: "density.extend_grid",
                reason: format!("must be finite and non-negative, got {}", self.extend_grid),
            });
        }

        if let Some(levels) = &self.levels {
            if levels.iter().any(|l| !l.is_finite()) || levels.windows(2).any(|w| w[0] >= w[1]) {
                return Err(ConfigError::InvalidValue {
                    field: "density.levels",
                    reason: "levels must be finite and strictly ascending".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Rule-of-thumb bandwidth used when none is given
pub fn auto_bandwidth(num_points: usize) -> f64 {
    (num_points as f64).powf(-1.0 / 6.0)
}

/// Silverman-style bandwidth for `n` points in `d` dimensions, scaled by `factor²`
pub fn estimate_bw(n: usize, d: usize, factor: f64) -> f64 {
    let n = n as f64;
    let d = d as f64;
    (n * (d + 2.0) / 4.0).powf(-1.0 / (d + 4.0)) * factor.powi(2)
}

/// Picks up to `nbins + 1` evenly spaced ticks at nice numbers that cover a range.
/// The first tick sits at or below the minimum, the last at or above the maximum.
#[derive(Debug, Clone, PartialEq)]
pub struct MaxNLocator {
    nbins: usize,
    min_n_ticks: usize,
    extended_steps: Vec<f64>,
}

impl MaxNLocator {
    pub fn new(nbins: usize, min_n_ticks: usize) -> Self {
        // 0.1·steps[..last], steps, 10·steps[1]
        let mut extended_steps: Vec<f64> = LOCATOR_STEPS[..LOCATOR_STEPS.len() - 1].iter().map(|s| 0.1 * s).collect();
        extended_steps.extend_from_slice(&LOCATOR_STEPS);
        extended_steps.push(10.0 * LOCATOR_STEPS[1]);

        Self { nbins: nbins.max(1), min_n_ticks, extended_steps }
    }

    // Widens an empty or non-finite interval
    fn nonsingular(vmin: f64, vmax: f64) -> (f64, f64) {
        const EXPANDER: f64 = 1e-13;
        const TINY: f64 = 1e-14;

        if !vmin.is_finite() || !vmax.is_finite() {
            return (-EXPANDER, EXPANDER);
        }

        let (mut vmin, mut vmax) = if vmax < vmin { (vmax, vmin) } else { (vmin, vmax) };
        let maxabs = vmin.abs().max(vmax.abs());

        if maxabs < (1e6 / TINY) * f64::MIN_POSITIVE {
            return (-EXPANDER, EXPANDER);
        }
        if vmax - vmin <= maxabs * TINY {
            if vmax == 0.0 && vmin == 0.0 {
                return (-EXPANDER, EXPANDER);
            }
            vmin -= EXPANDER * vmin.abs();
            vmax += EXPANDER * vmax.abs();
        }

        (vmin, vmax)
    }

    fn scale_range(vmin: f64, vmax: f64, n: usize) -> (f64, f64) {
        let dv = (vmax - vmin).abs();
        let meanv = (vmax + vmin) / 2.0;

        let offset = if meanv.abs() / dv < LOCATOR_OFFSET_THRESHOLD {
            0.0
        } else {
            10_f64.powf(meanv.abs().log10().floor()).copysign(meanv)
        };
        let scale = 10_f64.powf((dv / n as f64).log10().floor());

        (scale, offset)
    }

    pub fn tick_values(&self, vmin: f64, vmax: f64) -> Vec<f64> {
        let (vmin, vmax) = Self::nonsingular(vmin, vmax);
        let (scale, offset) = Self::scale_range(vmin, vmax, self.nbins);
        let vmin = vmin - offset;
        let vmax = vmax - offset;

        let steps: Vec<f64> = self.extended_steps.iter().map(|s| s * scale).collect();
        let raw_step = (vmax - vmin) / self.nbins as f64;
        let istep = steps.iter().position(|s| *s >= raw_step).unwrap_or(steps.len() - 1);

        let edge = EdgeInteger::new(offset);
        let ticks_for = |step: f64| -> Vec<f64> {
            let best_vmin = (vmin / step).floor() * step;
            let low = edge.le(vmin - best_vmin, step);
            let high = edge.ge(vmax - best_vmin, step);
            (low as i64..=high as i64).map(|i| i as f64 * step + best_vmin).collect()
        };

        // Largest step first, smaller ones until enough ticks land inside
        let ticks = steps[..=istep].iter()
            .rev()
            .map(|step| ticks_for(*step))
            .find(|ticks| ticks.iter().filter(|t| **t >= vmin && **t <= vmax).count() >= self.min_n_ticks)
            .unwrap_or_else(|| ticks_for(steps[0]));

        ticks.iter().map(|t| t + offset).collect()
    }
}

// Integer multiples of a step, tolerant to rounding near the edges
struct EdgeInteger {
    offset: f64,
}

impl EdgeInteger {
    fn new(offset: f64) -> Self {
        Self { offset: offset.abs() }
    }

    fn close_to(&self, ms: f64, edge: f64, step: f64) -> bool {
        let tol = if self.offset > 0.0 {
            let digits = (self.offset / step).log10();
            10_f64.powf(digits - 12.0).max(1e-10).min(0.4999)
        } else {
            1e-10
        };
        (ms - edge).abs() < tol
    }

    fn le(&self, x: f64, step: f64) -> f64 {
        let d = x.div_euclid(step);
        let m = x.rem_euclid(step);
        if self.close_to(m / step, 1.0, step) { d + 1.0 } else { d }
    }

    fn ge(&self, x: f64, step: f64) -> f64 {
        let d = x.div_euclid(step);
        let m = x.rem_euclid(step);
        if self.close_to(m / step, 0.0, step) { d } else { d + 1.0 }
    }
}

/// Density grid ready for filled contours. `x[(i, j)]` is the i-th grid
/// value along x, `y[(i, j)]` the j-th along y.
#[derive(Debug, Clone, PartialEq)]
pub struct Contour2D {
    pub x: DMatrix<f64>,
    pub y: DMatrix<f64>,
    pub z: DMatrix<f64>,
    pub levels: Vec<f64>,
}

fn linspace(start: f64, end: f64, num: usize) -> Vec<f64> {
    let step = (end - start) / (num - 1) as f64;
    (0..num).map(|i| start + i as f64 * step).collect()
}

// Data range widened by |mean|·extend on both sides
fn grid_axis(values: &[f64], extend_grid: f64, resolution: usize) -> Vec<f64> {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let margin = mean.abs() * extend_grid;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    linspace(min - margin, max + margin, resolution)
}

/// Kernel density estimate of the (x, y) pairs on a square grid, with contour levels
pub fn contour_2d(x: &[f64], y: &[f64], settings: &DensitySettings) -> Result<Contour2D, DensityError> {
    if x.is_empty() || y.is_empty() {
        return Err(DensityError::EmptyInput);
    }
    if x.len() != y.len() {
        return Err(DensityError::LengthMismatch { x: x.len(), y: y.len() });
    }
    if x.iter().chain(y).any(|v| !v.is_finite()) {
        return Err(DensityError::NonFiniteInput);
    }
    settings.validate().map_err(|err| DensityError::InvalidSettings { reason: err.to_string() })?;

    let bandwidth = settings.bandwidth.unwrap_or_else(|| auto_bandwidth(x.len()));
    let resolution = settings.resolution;

    let x_axis = grid_axis(x, settings.extend_grid, resolution);
    let y_axis = grid_axis(y, settings.extend_grid, resolution);

    let grid_x = DMatrix::from_fn(resolution, resolution, |i, _| x_axis[i]);
    let grid_y = DMatrix::from_fn(resolution, resolution, |_, j| y_axis[j]);

    let n = x.len() as f64;
    let z = DMatrix::from_fn(resolution, resolution, |i, j| {
        let (gx, gy) = (x_axis[i], y_axis[j]);
        let total: f64 = x.iter()
            .zip(y)
            .map(|(px, py)| settings.kernel.evaluate((px - gx).hypot(py - gy), bandwidth))
            .sum();
        total / n
    });

    let levels = match &settings.levels {
        Some(levels) => levels.clone(),
        None => {
            let n_colors = if settings.shade_lowest { settings.n_colors } else { settings.n_colors + 1 };
            let locator = MaxNLocator::new(n_colors, n_colors);
            let mut levels = locator.tick_values(z.min(), z.max());
            if !settings.shade_lowest && !levels.is_empty() {
                levels.remove(0);
            }
            levels
        }
    };

    log::debug!("Density over {} points, bandwidth {:.4}, {} levels", x.len(), bandwidth, levels.len());

    Ok(Contour2D { x: grid_x, y: grid_y, z, levels })
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DensityError {
    #[error("no points to estimate a density from")]
    EmptyInput,
    #[error("{x} x values but {y} y values")]
    LengthMismatch { x: usize, y: usize },
    #[error("points must be finite")]
    NonFiniteInput,
    #[error("invalid density settings: {reason}")]
    InvalidSettings { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    fn cluster() -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..50).map(|i| 0.4 + 0.004 * i as f64).collect();
        let y: Vec<f64> = (0..50).map(|i| 0.6 - 0.003 * ((i * 7) % 50) as f64).collect();
        (x, y)
    }

    fn grid_integral(contour: &Contour2D) -> f64 {
        let dx = contour.x[(1, 0)] - contour.x[(0, 0)];
        let dy = contour.y[(0, 1)] - contour.y[(0, 0)];
        contour.z.sum() * dx * dy
    }

    #[test]
    fn test_locator_tick_values() {
        assert!(close(&MaxNLocator::new(3, 3).tick_values(0.0, 1.0), &[0.0, 0.4, 0.8, 1.2]));
        assert!(close(&MaxNLocator::new(5, 5).tick_values(0.0, 10.0), &[0.0, 2.0, 4.0, 6.0, 8.0, 10.0]));
    }

    // Test that the density integrates to one over a wide grid
    #[test]
    fn test_kde_normalization() {
        let (x, y) = cluster();

        for (kernel, bandwidth, tolerance) in [(Kernel::Gaussian, 0.05, 0.01), (Kernel::Epanechnikov, 0.1, 0.03), (Kernel::Cosine, 0.1, 0.03)] {
            let settings = DensitySettings { bandwidth: Some(bandwidth), kernel, resolution: 150, ..Default::default() };
            let contour = contour_2d(&x, &y, &settings).unwrap();
            let area = grid_integral(&contour);
            assert!((area - 1.0).abs() < tolerance, "{:?} integrates to {}", kernel, area);
        }
    }

    // Test that levels ascend and bracket the density range
    #[test]
    fn test_contour_levels() {
        let (x, y) = cluster();
        let contour = contour_2d(&x, &y, &DensitySettings::default()).unwrap();

        assert_eq!(contour.z.shape(), (RESOLUTION_DEFAULT, RESOLUTION_DEFAULT));
        assert!(contour.levels.len() >= N_COLORS_DEFAULT);
        assert!(contour.levels.windows(2).all(|w| w[0] < w[1]));
        assert!(contour.levels[0] > contour.z.min());
        assert!(*contour.levels.last().unwrap() >= contour.z.max() - 1e-9);

        let shaded = DensitySettings { shade_lowest: true, ..Default::default() };
        let contour = contour_2d(&x, &y, &shaded).unwrap();
        assert!(contour.levels[0] <= contour.z.min());

        let explicit = DensitySettings { levels: Some(vec![0.5, 1.0]), ..Default::default() };
        assert_eq!(contour_2d(&x, &y, &explicit).unwrap().levels, vec![0.5, 1.0]);
    }

    #[test]
    fn test_grid_extends_beyond_data() {
        let x = vec![1.0, 3.0];
        let y = vec![2.0, 2.0];
        let settings = DensitySettings { resolution: 5, ..Default::default() };
        let contour = contour_2d(&x, &y, &settings).unwrap();

        // Mean of x is 2, so the axis spans [-1, 5]
        assert!((contour.x[(0, 3)] + 1.0).abs() < 1e-12);
        assert!((contour.x[(4, 0)] - 5.0).abs() < 1e-12);
        assert!((contour.y[(2, 4)] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_inputs() {
        let settings = DensitySettings::default();
        assert_eq!(contour_2d(&[], &[], &settings), Err(DensityError::EmptyInput));
        assert_eq!(contour_2d(&[0.1, 0.2], &[0.1], &settings), Err(DensityError::LengthMismatch { x: 2, y: 1 }));
        assert_eq!(contour_2d(&[f64::NAN], &[0.1], &settings), Err(DensityError::NonFiniteInput));
    }

    #[test]
    fn test_kernel_from_str() {
        assert_eq!("epa".parse::<Kernel>().unwrap(), Kernel::Epanechnikov);
        assert_eq!("Linear".parse::<Kernel>().unwrap(), Kernel::Linear);
        assert!("box".parse::<Kernel>().is_err());
    }

    #[test]
    fn test_bandwidth_rules() {
        assert!((auto_bandwidth(64) - 0.5).abs() < 1e-12);
        // n(d+2)/4 = 8 for n = 8, d = 2
        assert!((estimate_bw(8, 2, 1.0) - 8_f64.powf(-1.0 / 6.0)).abs() < 1e-12);
        assert!((estimate_bw(8, 2, 2.0) - 4.0 * 8_f64.powf(-1.0 / 6.0)).abs() < 1e-12);
    }

    #[test]
    fn test_settings_validation() {
        assert!(DensitySettings::default().validate().is_ok());
        assert!(DensitySettings::transition_density().validate().is_ok());

        let settings = DensitySettings { bandwidth: Some(0.0), ..Default::default() };
        assert!(settings.validate().is_err());

        let settings = DensitySettings { levels: Some(vec![1.0, 0.5]), ..Default::default() };
        assert!(settings.validate().is_err());
    }
}
