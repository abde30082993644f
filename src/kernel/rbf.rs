use super::{
    check_positive, check_weight_shape, e2_norm, expect_n_parameters,
    CovGrad, CovGradError, Kernel, KernelError,
};
use nalgebra::base::constraint::{SameNumberOfColumns, ShapeConstraint};
use nalgebra::base::storage::Storage;
use nalgebra::{dvector, DMatrix, DVector, Dim, Matrix};

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

/// Radial-basis function (RBF) kernel
/// The distance metric here is L2 (Euclidean).
///
/// ```math
///     K(\mathbf{x}, \mathbf{x'}) = \exp\left(-\frac{\|\mathbf{x} - \mathbf{x'}\|^2}{2l^2}\right)
/// ```
///
/// Multiply by a [`ConstantKernel`](super::ConstantKernel) to get an output
/// scale.
///
/// # Parameters
/// * `l` - Length scale.
///
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct RBFKernel {
    length_scale: f64,
}

impl RBFKernel {
    /// Create a new rbf kernel with the given length scale
    pub fn new(length_scale: f64) -> Result<Self, KernelError> {
        Ok(Self {
            length_scale: check_positive("length_scale", length_scale)?,
        })
    }

    /// Create a new `RBFKernel` without checking parameters
    #[must_use]
    pub fn new_unchecked(length_scale: f64) -> Self {
        Self { length_scale }
    }

    #[must_use]
    pub fn length_scale(&self) -> f64 {
        self.length_scale
    }
}

impl Default for RBFKernel {
    fn default() -> Self {
        Self { length_scale: 1.0 }
    }
}

impl Kernel for RBFKernel {
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
        let m = x1.nrows();
        let n = x2.nrows();

        let mut dm: DMatrix<f64> = DMatrix::zeros(m, n);

        for i in 0..m {
            for j in 0..n {
                let d = e2_norm(&x1.row(i), &x2.row(j), self.length_scale);
                dm[(i, j)] = d;
            }
        }

        dm.map(|e| (-0.5 * e).exp())
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
        DVector::repeat(x.nrows(), 1.0)
    }

    fn parameters(&self) -> DVector<f64> {
        dvector![self.length_scale.ln()]
    }

    fn named_parameters(&self) -> Vec<(String, f64)> {
        vec![("length_scale".to_string(), self.length_scale)]
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
        let n = x.nrows();

        let mut dm = DMatrix::zeros(n, n);
        let mut grad = CovGrad::zeros(n, 1);

        for i in 0..n {
            for j in 0..i {
                // Save covariance
                let d2 = e2_norm(&x.row(i), &x.row(j), self.length_scale);
                let cov_ij = (-d2 / 2.0).exp();

                dm[(i, j)] = cov_ij;
                dm[(j, i)] = cov_ij;

                // Save gradient
                let dc_dl = d2 * cov_ij;
                grad[(i, j, 0)] = dc_dl;
                grad[(j, i, 0)] = dc_dl;
            }
            dm[(i, i)] = 1.0;
        }

        Ok((dm, grad))
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
        let n = x.nrows();
        check_weight_shape(n, dl_dk)?;

        let l2 = self.length_scale * self.length_scale;
        let mut grad = DMatrix::zeros(n, x.ncols());
        for i in 0..n {
            for j in (0..n).filter(|&j| j != i) {
                let d2 = e2_norm(&x.row(i), &x.row(j), self.length_scale);
                let k = (-0.5 * d2).exp();
                // K is symmetric, both entries move with x_i
                let w = -(dl_dk[(i, j)] + dl_dk[(j, i)]) * k / l2;
                for p in 0..x.ncols() {
                    grad[(i, p)] += w * (x[(i, p)] - x[(j, p)]);
                }
            }
        }
        Ok(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{ConstantKernel, KernelExpr};

    fn grid() -> DMatrix<f64> {
        DMatrix::from_row_slice(4, 2, &[0.0, 0.5, 1.0, -0.5, 0.3, 2.0, -1.5, 0.0])
    }

    fn squared_distance(x: &DMatrix<f64>, i: usize, j: usize) -> f64 {
        (x.row(i) - x.row(j)).norm_squared()
    }

    #[test]
    fn rbf_matches_closed_form() -> Result<(), KernelError> {
        let x = grid();
        for l in [0.3, 1.0, 2.5] {
            let cov = RBFKernel::new(l)?.covariance(&x, &x);
            for i in 0..4 {
                for j in 0..4 {
                    let expected = (-squared_distance(&x, i, j) / (2.0 * l * l)).exp();
                    assert::close(cov[(i, j)], expected, 1E-12);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn rbf_length_scale_gradient() -> Result<(), KernelError> {
        // ∂k/∂ln l = k · d² / l²
        let x = grid();
        let l = 0.8;
        let (cov, grad) = RBFKernel::new(l)?.covariance_with_gradient(&x)?;
        let expected = DMatrix::from_fn(4, 4, |i, j| {
            cov[(i, j)] * squared_distance(&x, i, j) / (l * l)
        });
        assert!(grad[0].relative_eq(&expected, 1E-10, 1E-10));
        assert_eq!(cov.diagonal(), DVector::from_element(4, 1.0));
        Ok(())
    }

    #[test]
    fn product_of_rbfs_is_an_rbf() -> Result<(), KernelError> {
        // 1/l² = 1/a² + 1/b²
        let (a, b) = (0.6_f64, 1.7_f64);
        let l = (a * a * b * b / (a * a + b * b)).sqrt();
        let product = RBFKernel::new(a)? * RBFKernel::new(b)?;
        let x = grid();
        assert!(product
            .covariance(&x, &x)
            .relative_eq(&RBFKernel::new(l)?.covariance(&x, &x), 1E-12, 1E-12));
        Ok(())
    }

    #[test]
    fn outputscale_multiplies_rbf() -> Result<(), KernelError> {
        let x = grid();
        let y = DMatrix::from_row_slice(2, 2, &[0.1, 0.1, -2.0, 1.0]);
        let scaled = KernelExpr::scaled_rbf(2.5, 0.9)?;
        let by_hand = ConstantKernel::new(2.5)? * RBFKernel::new(0.9)?;
        assert_eq!(scaled, by_hand);
        let expected = RBFKernel::new(0.9)?.covariance(&x, &y) * 2.5;
        assert!(scaled.covariance(&x, &y).relative_eq(&expected, 1E-12, 1E-12));
        assert_eq!(scaled.diag(&x), DVector::from_element(4, 2.5));
        Ok(())
    }

    #[test]
    fn rbf_simple() {
        let kernel = RBFKernel::default();
        assert::close(kernel.parameters()[0], 0.0, 1E-10);
        assert_eq!(
            kernel,
            kernel
                .reparameterize(&[0.0])
                .expect("Should create kernel from params")
        );
        assert!(kernel.is_stationary());
        assert!(RBFKernel::new(0.0).is_err());
        assert!(RBFKernel::new(-1.0).is_err());
    }

    #[test]
    fn rbf_input_gradient_matches_finite_differences() -> Result<(), KernelError> {
        let kernel = RBFKernel::new(0.7)?;
        let x = DMatrix::from_row_slice(3, 2, &[0.1, -0.3, 0.5, 0.2, -0.4, 0.9]);
        // An asymmetric weighting catches a missing transpose term
        let w = DMatrix::from_row_slice(
            3,
            3,
            &[0.3, -1.2, 0.5, 0.7, 0.1, -0.4, 2.0, 0.6, -0.9],
        );
        let loss = |x: &DMatrix<f64>| kernel.covariance(x, x).dot(&w);

        let grad = kernel.input_gradient(&x, &w)?;
        let h = 1E-6;
        for i in 0..3 {
            for p in 0..2 {
                let mut xp = x.clone();
                xp[(i, p)] += h;
                let mut xm = x.clone();
                xm[(i, p)] -= h;
                let fd = (loss(&xp) - loss(&xm)) / (2.0 * h);
                assert::close(grad[(i, p)], fd, 1E-6);
            }
        }
        Ok(())
    }
}
