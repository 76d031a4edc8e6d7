pub mod density;
pub mod gaussian_mixture;
pub mod lifetimes;

pub use density::{contour_2d, estimate_bw, Contour2D, DensityError, DensitySettings, Kernel, MaxNLocator};
pub use gaussian_mixture::{fit_gaussian_mixture, GaussianMixtureFit, MixtureError, MixtureOrder};
pub use lifetimes::{fit_exponential_lifetime, ExponentialFit};
