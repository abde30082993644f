#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

use nalgebra::{DMatrix, DVector};
use std::fmt;
use std::ops::{Index, IndexMut};

/// Gradient of an n×n covariance matrix with respect to each of a kernel's
/// log-scale parameters: one n×n slice per parameter.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct CovGrad {
    n: usize,
    slices: Vec<DMatrix<f64>>,
}

impl fmt::Display for CovGrad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.slices.iter().try_for_each(|s| write!(f, "{s}"))
    }
}

impl CovGrad {
    /// Create a new cov-grad with given n×n slices
    pub fn new(n: usize, slices: Vec<DMatrix<f64>>) -> Result<Self, CovGradError> {
        let shapes: Vec<(usize, usize)> =
            slices.iter().map(nalgebra::Matrix::shape).collect();
        if shapes.iter().all(|&s| s == (n, n)) {
            Ok(Self { n, slices })
        } else {
            Err(CovGradError::ShapeMismatch(shapes))
        }
    }

    /// Create a new unchecked `CovGrad`; `slices` must not be empty
    #[must_use]
    pub fn new_unchecked(slices: &[DMatrix<f64>]) -> Self {
        Self {
            n: slices[0].nrows(),
            slices: slices.to_vec(),
        }
    }

    /// Create a new cov-grad with all zeros
    #[must_use]
    pub fn zeros(n: usize, m: usize) -> Self {
        Self {
            n,
            slices: (0..m).map(|_| DMatrix::zeros(n, n)).collect(),
        }
    }

    /// Size of the covariance matrix
    #[must_use]
    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of parameters
    #[must_use]
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DMatrix<f64>> {
        self.slices.iter()
    }

    /// Component wise multiplication of every slice
    pub fn component_mul(
        &self,
        other: &DMatrix<f64>,
    ) -> Result<Self, CovGradError> {
        if other.shape() == (self.n, self.n) {
            let slices =
                self.slices.iter().map(|s| s.component_mul(other)).collect();
            Ok(Self { n: self.n, slices })
        } else {
            Err(CovGradError::ShapeMismatch(vec![
                (self.n, self.n),
                other.shape(),
            ]))
        }
    }

    /// Concatenate the parameter slices of another `CovGrad`
    pub fn concat_cols(&self, other: &Self) -> Result<Self, CovGradError> {
        if other.n == self.n {
            let slices = [self.slices.clone(), other.slices.clone()].concat();
            Ok(Self { n: self.n, slices })
        } else {
            Err(CovGradError::ShapeMismatch(vec![
                (self.n, self.n),
                (other.n, other.n),
            ]))
        }
    }

    /// `Σ_ij w[(i, j)] ∂K[(i, j)]/∂θ_k` for every parameter `k`.
    ///
    /// With `w = ½(ααᵀ - K⁻¹)` this is the gradient of the log marginal
    /// likelihood.
    pub fn contract(&self, w: &DMatrix<f64>) -> Result<DVector<f64>, CovGradError> {
        if w.shape() != (self.n, self.n) {
            return Err(CovGradError::ShapeMismatch(vec![
                (self.n, self.n),
                w.shape(),
            ]));
        }
        Ok(DVector::from_iterator(
            self.slices.len(),
            self.slices.iter().map(|s| s.dot(w)),
        ))
    }

    /// Check if this is relatively eq to another `CovGrad`
    #[must_use]
    pub fn relative_eq(&self, other: &CovGrad, rel: f64, abs: f64) -> bool {
        self.slices.len() == other.slices.len()
            && self
                .slices
                .iter()
                .zip(other.slices.iter())
                .all(|(a, b)| a.relative_eq(b, rel, abs))
    }

    /// Create a new `CovGrad` from a sequence of column slices
    pub fn from_column_slices(
        n: usize,
        m: usize,
        slice: &[f64],
    ) -> Result<Self, CovGradError> {
        if n * n * m == slice.len() {
            let slices = slice
                .chunks_exact(n * n)
                .map(|chunk| DMatrix::from_column_slice(n, n, chunk))
                .collect();
            Ok(Self { n, slices })
        } else {
            Err(CovGradError::ImproperSize(n * n * m, slice.len()))
        }
    }
}

impl Index<usize> for CovGrad {
    type Output = DMatrix<f64>;

    fn index(&self, k: usize) -> &Self::Output {
        &self.slices[k]
    }
}

impl IndexMut<usize> for CovGrad {
    fn index_mut(&mut self, k: usize) -> &mut Self::Output {
        &mut self.slices[k]
    }
}

impl Index<(usize, usize, usize)> for CovGrad {
    type Output = f64;

    fn index(&self, (i, j, k): (usize, usize, usize)) -> &Self::Output {
        &self.slices[k][(i, j)]
    }
}

impl IndexMut<(usize, usize, usize)> for CovGrad {
    fn index_mut(
        &mut self,
        (i, j, k): (usize, usize, usize),
    ) -> &mut Self::Output {
        &mut self.slices[k][(i, j)]
    }
}

/// Error from constructing a `CovGrad`
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub enum CovGradError {
    /// The shapes of the slices do not match
    ShapeMismatch(Vec<(usize, usize)>),
    /// Improper number of points to construct a `CovGrad`
    ImproperSize(usize, usize),
}

impl std::error::Error for CovGradError {}

impl std::fmt::Display for CovGradError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CovGradError::ShapeMismatch(shapes) => writeln!(f, "Cannot create Covariance Gradient: Shape Mismatch: Shapes {shapes:?}"),
            CovGradError::ImproperSize(expected, given) => writeln!(f, "Cannot create Covariance Gradient with given shapes. Given: {given}, Expected: {expected}"),
        }
    }
}
