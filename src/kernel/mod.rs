//! Covariance functions
//!
//! Every kernel stores its positive hyper-parameters in natural scale and
//! exposes them to optimizers in log scale, so an unconstrained update can
//! never produce an invalid kernel.

use nalgebra::base::constraint::{SameNumberOfColumns, ShapeConstraint};
use nalgebra::base::storage::Storage;
use nalgebra::{DMatrix, DVector, Dim, Matrix};
use std::f64;

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

mod covgrad;
pub use covgrad::*;

mod misc;
pub use self::misc::*;

mod constant_kernel;
pub use self::constant_kernel::*;

mod rbf;
pub use self::rbf::*;

mod white_kernel;
pub use self::white_kernel::*;

mod spectral_mixture;
pub use self::spectral_mixture::*;

mod expr;
pub use self::expr::*;

/// Kernel Function
pub trait Kernel: std::fmt::Debug + Clone + PartialEq {
    /// Number of (log-scale) parameters
    fn n_parameters(&self) -> usize;

    /// Returns the covariance matrix between the rows of `x1` and `x2`
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
        ShapeConstraint: SameNumberOfColumns<C1, C2>;

    /// Reports if the given kernel function is stationary.
    fn is_stationary(&self) -> bool;

    /// Returns the diagonal of kernel(x, x)
    fn diag<R, C, S>(&self, x: &Matrix<f64, R, C, S>) -> DVector<f64>
    where
        R: Dim,
        C: Dim,
        S: Storage<f64, R, C>;

    /// Input dimension the kernel was built for, if it is fixed
    fn input_dim(&self) -> Option<usize> {
        None
    }

    /// Check that every part of the kernel accepts inputs of dimension `d`
    fn check_input_dim(&self, d: usize) -> Result<(), KernelError> {
        match self.input_dim() {
            Some(expected) if expected != d => {
                Err(KernelError::DimensionMismatch { expected, given: d })
            }
            _ => Ok(()),
        }
    }

    /// Return the corresponding parameter vector
    /// The parameters here are in a log-scale
    fn parameters(&self) -> DVector<f64>;

    /// Parameters in natural scale, labelled for reporting
    fn named_parameters(&self) -> Vec<(String, f64)>;

    /// Create a new kernel of the same shape from the provided parameters.
    /// The parameters here are in a log-scale
    fn reparameterize(&self, params: &[f64]) -> Result<Self, KernelError>;

    /// Takes a sequence of parameters and consumes only the ones it needs
    /// to create itself.
    /// The parameters here are in a log-scale
    fn consume_parameters<'p>(
        &self,
        params: &'p [f64],
    ) -> Result<(Self, &'p [f64]), KernelError> {
        let n = self.n_parameters();
        if params.len() < n {
            Err(KernelError::MissingParameters(n - params.len()))
        } else {
            let (cur, next) = params.split_at(n);
            Ok((self.reparameterize(cur)?, next))
        }
    }

    /// Covariance and Gradient with the log-scaled hyper-parameters
    fn covariance_with_gradient<R, C, S>(
        &self,
        x: &Matrix<f64, R, C, S>,
    ) -> Result<(DMatrix<f64>, CovGrad), CovGradError>
    where
        R: Dim,
        C: Dim,
        S: Storage<f64, R, C>;

    /// Gradient of a scalar `L` with respect to the rows of `x`, given
    /// `dl_dk[(i, j)] = ∂L/∂K(x, x)[(i, j)]`.
    ///
    /// The result has the shape of `x`.
    fn input_gradient<R, C, S>(
        &self,
        x: &Matrix<f64, R, C, S>,
        dl_dk: &DMatrix<f64>,
    ) -> Result<DMatrix<f64>, KernelError>
    where
        R: Dim,
        C: Dim,
        S: Storage<f64, R, C>;
}

/// Errors from Kernel construction
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
pub enum KernelError {
    /// Parameter Out of Bounds
    ParameterOutOfBounds {
        /// Name of parameter
        name: String,
        /// Value given
        given: f64,
        /// Lower and upper bounds on value
        bounds: (f64, f64),
    },
    /// Too many parameters provided
    ExtraneousParameters(usize),
    /// Too few parameters provided
    MissingParameters(usize),
    /// The kernel was built for inputs of another dimension
    DimensionMismatch {
        /// Dimension the kernel expects
        expected: usize,
        /// Dimension given
        given: usize,
    },
    /// A composite kernel was built without children
    EmptyComposite,
    /// An error in computing cov-grad
    CovGrad(CovGradError),
}

impl KernelError {
    pub(crate) fn positive(name: &str, given: f64) -> Self {
        Self::ParameterOutOfBounds {
            name: name.to_string(),
            given,
            bounds: (0.0, f64::INFINITY),
        }
    }
}

impl std::error::Error for KernelError {}

impl std::fmt::Display for KernelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ParameterOutOfBounds {
                name,
                given,
                bounds,
            } => writeln!(
                f,
                "Parameter {} is out of bounds ({}, {}), given: {}",
                name, bounds.0, bounds.1, given
            ),
            Self::ExtraneousParameters(n) => {
                writeln!(f, "{} extra parameters provided to kernel", n)
            }
            Self::MissingParameters(n) => {
                writeln!(f, "Missing {} parameters", n)
            }
            Self::DimensionMismatch { expected, given } => writeln!(
                f,
                "Kernel expects inputs of dimension {}, given {}",
                expected, given
            ),
            Self::EmptyComposite => {
                writeln!(f, "A composite kernel needs at least one child")
            }
            Self::CovGrad(e) => {
                writeln!(f, "Covariance Gradient couldn't be computed: {}", e)
            }
        }
    }
}

impl From<CovGradError> for KernelError {
    fn from(e: CovGradError) -> Self {
        Self::CovGrad(e)
    }
}

/// Check positivity of a natural-scale parameter
pub(crate) fn check_positive(name: &str, value: f64) -> Result<f64, KernelError> {
    if value > 0.0 && value.is_finite() {
        Ok(value)
    } else {
        Err(KernelError::positive(name, value))
    }
}

/// Exactly `n` parameters or an error saying how many are off
pub(crate) fn expect_n_parameters(
    params: &[f64],
    n: usize,
) -> Result<(), KernelError> {
    match params.len() {
        m if m < n => Err(KernelError::MissingParameters(n - m)),
        m if m > n => Err(KernelError::ExtraneousParameters(m - n)),
        _ => Ok(()),
    }
}

/// `dl_dk` must be n×n to be paired with the covariance of n inputs
pub(crate) fn check_weight_shape(
    n: usize,
    dl_dk: &DMatrix<f64>,
) -> Result<(), KernelError> {
    if dl_dk.shape() == (n, n) {
        Ok(())
    } else {
        Err(KernelError::CovGrad(CovGradError::ShapeMismatch(vec![
            (n, n),
            dl_dk.shape(),
        ])))
    }
}

macro_rules! impl_mul_add {
    ($type: ty) => {
        impl<B> std::ops::Mul<B> for $type
        where
            B: Into<KernelExpr>,
        {
            type Output = KernelExpr;

            fn mul(self, rhs: B) -> Self::Output {
                KernelExpr::from(self).combine(Combine::Product, rhs.into())
            }
        }

        impl<B> std::ops::Add<B> for $type
        where
            B: Into<KernelExpr>,
        {
            type Output = KernelExpr;

            fn add(self, rhs: B) -> Self::Output {
                KernelExpr::from(self).combine(Combine::Sum, rhs.into())
            }
        }
    };
}

impl_mul_add!(ConstantKernel);
impl_mul_add!(RBFKernel);
impl_mul_add!(WhiteKernel);
impl_mul_add!(SpectralMixtureKernel);
impl_mul_add!(LeafKernel);
impl_mul_add!(KernelExpr);
