use super::{
    check_positive, check_weight_shape, e2_norm, expect_n_parameters,
    CovGrad, CovGradError, Kernel, KernelError,
};
use nalgebra::base::constraint::{SameNumberOfColumns, ShapeConstraint};
use nalgebra::base::storage::Storage;
use nalgebra::{dvector, DMatrix, DVector, Dim, Matrix};

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

/// White Noise Kernel
///
/// `k(a, b) = noise_level` when `a == b` and zero otherwise. Added to a
/// signal kernel it models independent observation noise.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct WhiteKernel {
    /// Level of the noise
    noise_level: f64,
}

impl WhiteKernel {
    /// Create a new WhiteKernel with the given level of noise
    pub fn new(noise_level: f64) -> Result<Self, KernelError> {
        Ok(Self {
            noise_level: check_positive("noise_level", noise_level)?,
        })
    }

    /// Create a new WhiteKernel without check the parameters
    #[must_use]
    pub fn new_unchecked(noise_level: f64) -> Self {
        Self { noise_level }
    }

    #[must_use]
    pub fn noise_level(&self) -> f64 {
        self.noise_level
    }
}

impl Kernel for WhiteKernel {
    fn n_parameters(&self) -> usize {
        1
    }

    fn covariance<R1, R2, C1, C2, S1, S2>(
        &self,
        x1: &Matrix<f64, R1, C1, S1>,
        x2: &Matrix<f64, R2, C2, S2>,
    ) -> DMatrix<f64>
    where
        R1: Dim,
        R2: Dim,
        C1: Dim,
        C2: Dim,
        S1: Storage<f64, R1, C1>,
        S2: Storage<f64, R2, C2>,
        ShapeConstraint: SameNumberOfColumns<C1, C2>,
    {
        DMatrix::from_fn(x1.nrows(), x2.nrows(), |i, j| {
            if e2_norm(&x1.row(i), &x2.row(j), 1.0) == 0.0 {
                self.noise_level
            } else {
                0.0
            }
        })
    }

    fn is_stationary(&self) -> bool {
        true
    }

    fn diag<R, C, S>(&self, x: &Matrix<f64, R, C, S>) -> DVector<f64>
    where
        R: Dim,
        C: Dim,
        S: Storage<f64, R, C>,
    {
        DVector::from_element(x.nrows(), self.noise_level)
    }

    fn parameters(&self) -> DVector<f64> {
        dvector![self.noise_level.ln()]
    }

    fn named_parameters(&self) -> Vec<(String, f64)> {
        vec![("noise_level".to_string(), self.noise_level)]
    }

    fn reparameterize(&self, params: &[f64]) -> Result<Self, KernelError> {
        expect_n_parameters(params, 1)?;
        Self::new(params[0].exp())
    }

    fn covariance_with_gradient<R, C, S>(
        &self,
        x: &Matrix<f64, R, C, S>,
    ) -> Result<(DMatrix<f64>, CovGrad), CovGradError>
    where
        R: Dim,
        C: Dim,
        S: Storage<f64, R, C>,
    {
        let cov = self.covariance(x, x);
        let grad = CovGrad::new(x.nrows(), vec![cov.clone()])?;
        Ok((cov, grad))
    }

    fn input_gradient<R, C, S>(
        &self,
        x: &Matrix<f64, R, C, S>,
        dl_dk: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, KernelError>
    where
        R: Dim,
        C: Dim,
        S: Storage<f64, R, C>,
    {
        // piecewise constant in x
        check_weight_shape(x.nrows(), dl_dk)?;
        Ok(DMatrix::zeros(x.nrows(), x.ncols()))
    }
}
