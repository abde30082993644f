use nalgebra::{DMatrix, DVector};

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

use crate::error::{GpError, Result};

/// Model of observation noise
///
/// A `Uniform` variance is learned alongside the kernel (in log scale);
/// `PerPoint` variances are known and held fixed.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub enum NoiseModel {
    /// The same noise variance σ² is applied to all values
    Uniform(f64),
    /// Different noise variances are applied to each y-value
    PerPoint(DVector<f64>),
}

impl Default for NoiseModel {
    fn default() -> Self {
        NoiseModel::Uniform(0.1)
    }
}

impl NoiseModel {
    /// Homoscedastic noise with variance `variance`
    pub fn uniform(variance: f64) -> Result<Self> {
        if variance > 0.0 && variance.is_finite() {
            Ok(Self::Uniform(variance))
        } else {
            Err(GpError::invalid_parameter("noise", variance))
        }
    }

    /// Fixed per-observation variances
    pub fn per_point(variances: DVector<f64>) -> Result<Self> {
        match variances.iter().find(|v| !(**v >= 0.0 && v.is_finite())) {
            Some(&v) => Err(GpError::invalid_parameter("noise", v)),
            None => Ok(Self::PerPoint(variances)),
        }
    }

    /// Learned noise variance, if any
    #[must_use]
    pub fn variance(&self) -> Option<f64> {
        match self {
            Self::Uniform(v) => Some(*v),
            Self::PerPoint(_) => None,
        }
    }

    #[must_use]
    pub fn n_parameters(&self) -> usize {
        match self {
            Self::Uniform(_) => 1,
            Self::PerPoint(_) => 0,
        }
    }

    /// Learned parameters in log scale
    #[must_use]
    pub fn parameters(&self) -> DVector<f64> {
        match self {
            Self::Uniform(v) => DVector::from_element(1, v.ln()),
            Self::PerPoint(_) => DVector::zeros(0),
        }
    }

    pub fn named_parameters(&self) -> Vec<(String, f64)> {
        match self {
            Self::Uniform(v) => vec![("noise".to_string(), *v)],
            Self::PerPoint(_) => Vec::new(),
        }
    }

    pub fn reparameterize(&self, params: &[f64]) -> Result<Self> {
        if params.len() != self.n_parameters() {
            return Err(GpError::shape(
                "noise parameters",
                self.n_parameters(),
                params.len(),
            ));
        }
        match self {
            Self::Uniform(_) => Self::uniform(params[0].exp()),
            Self::PerPoint(_) => Ok(self.clone()),
        }
    }

    /// Check the model can be applied to `n` observations
    pub fn check_size(&self, n: usize) -> Result<()> {
        match self {
            Self::PerPoint(sigma) if sigma.len() != n => {
                Err(GpError::shape("per point noise", n, sigma.len()))
            }
            _ => Ok(()),
        }
    }

    /// Noise variance of each of `n` observations
    pub fn diagonal(&self, n: usize) -> Result<DVector<f64>> {
        self.check_size(n)?;
        Ok(match self {
            Self::Uniform(v) => DVector::from_element(n, *v),
            Self::PerPoint(sigma) => sigma.clone(),
        })
    }

    /// Enact the given noise model onto the given covariance matrix
    pub fn add_noise_to_kernel(
        &self,
        cov: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>> {
        let diag = self.diagonal(cov.nrows())?;
        let mut noisy = cov.clone();
        noisy.set_diagonal(&(cov.diagonal() + diag));
        Ok(noisy)
    }

    /// `Σ_ij w[(i, j)] ∂(K + Σ_noise)[(i, j)]/∂ ln σ²`
    #[must_use]
    pub fn gradient(&self, w: &DMatrix<f64>) -> DVector<f64> {
        match self {
            Self::Uniform(v) => DVector::from_element(1, v * w.trace()),
            Self::PerPoint(_) => DVector::zeros(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_noise_is_added_to_the_diagonal() -> Result<()> {
        let noise = NoiseModel::uniform(0.5)?;
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 0.2, 0.2, 1.0]);
        let noisy = noise.add_noise_to_kernel(&cov)?;
        assert_eq!(noisy, DMatrix::from_row_slice(2, 2, &[1.5, 0.2, 0.2, 1.5]));
        assert::close(noise.parameters()[0], 0.5_f64.ln(), 1E-12);
        Ok(())
    }

    #[test]
    fn per_point_noise_must_match_size() -> Result<()> {
        let noise =
            NoiseModel::per_point(DVector::from_column_slice(&[0.1, 0.2, 0.3]))?;
        let cov = DMatrix::identity(2, 2);
        assert_eq!(
            noise.add_noise_to_kernel(&cov),
            Err(GpError::shape("per point noise", 2, 3))
        );
        assert_eq!(noise.n_parameters(), 0);
        assert_eq!(noise.reparameterize(&[])?, noise);
        Ok(())
    }

    #[test]
    fn invalid_noise_is_rejected() {
        assert!(NoiseModel::uniform(0.0).is_err());
        assert!(NoiseModel::uniform(f64::INFINITY).is_err());
        assert!(
            NoiseModel::per_point(DVector::from_column_slice(&[0.1, -0.1]))
                .is_err()
        );
    }

    #[test]
    fn gradient_is_scaled_trace() -> Result<()> {
        let noise = NoiseModel::uniform(0.25)?;
        let w = DMatrix::from_row_slice(2, 2, &[1.0, 9.0, 9.0, 3.0]);
        assert::close(noise.gradient(&w)[0], 1.0, 1E-12);
        Ok(())
    }
}
