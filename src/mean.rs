//! Prior mean functions

use nalgebra::{DMatrix, DVector};

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

use crate::error::{GpError, Result};

/// Prior mean of a Gaussian process
///
/// Parameters of a mean function are unconstrained reals and are exposed to
/// optimizers as-is.
pub trait Mean: std::fmt::Debug + Clone + PartialEq {
    /// Number of parameters
    fn n_parameters(&self) -> usize;

    /// Mean at each row of `x`
    fn mean(&self, x: &DMatrix<f64>) -> DVector<f64>;

    /// Input dimension the mean was built for, if it is fixed
    fn input_dim(&self) -> Option<usize> {
        None
    }

    fn parameters(&self) -> DVector<f64>;

    /// Parameters labelled for reporting
    fn named_parameters(&self) -> Vec<(String, f64)>;

    /// Create a new mean of the same shape from the provided parameters
    fn reparameterize(&self, params: &[f64]) -> Result<Self>;

    /// Jacobian `∂m(x_i)/∂θ_k`, an `n × n_parameters` matrix
    fn gradient(&self, x: &DMatrix<f64>) -> DMatrix<f64>;

    /// Gradient of a scalar `L` w.r.t. the rows of `x` given `dl_dm = ∂L/∂m`
    fn input_gradient(
        &self,
        x: &DMatrix<f64>,
        dl_dm: &DVector<f64>,
    ) -> DMatrix<f64>;
}

fn expect_len(params: &[f64], n: usize) -> Result<()> {
    if params.len() == n {
        Ok(())
    } else {
        Err(GpError::shape("mean parameters", n, params.len()))
    }
}

/// `m(x) = 0`
#[derive(Clone, Copy, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
pub struct ZeroMean;

impl Mean for ZeroMean {
    fn n_parameters(&self) -> usize {
        0
    }

    fn mean(&self, x: &DMatrix<f64>) -> DVector<f64> {
        DVector::zeros(x.nrows())
    }

    fn parameters(&self) -> DVector<f64> {
        DVector::zeros(0)
    }

    fn named_parameters(&self) -> Vec<(String, f64)> {
        Vec::new()
    }

    fn reparameterize(&self, params: &[f64]) -> Result<Self> {
        expect_len(params, 0).map(|_| Self)
    }

    fn gradient(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::zeros(x.nrows(), 0)
    }

    fn input_gradient(
        &self,
        x: &DMatrix<f64>,
        _dl_dm: &DVector<f64>,
    ) -> DMatrix<f64> {
        DMatrix::zeros(x.nrows(), x.ncols())
    }
}

/// A single learned value broadcast to every input
#[derive(Clone, Copy, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct ConstantMean {
    value: f64,
}

impl ConstantMean {
    pub fn new(value: f64) -> Result<Self> {
        if value.is_finite() {
            Ok(Self { value })
        } else {
            Err(GpError::invalid_parameter("mean.constant", value))
        }
    }

    #[must_use]
    pub fn value(&self) -> f64 {
        self.value
    }
}

impl Mean for ConstantMean {
    fn n_parameters(&self) -> usize {
        1
    }

    fn mean(&self, x: &DMatrix<f64>) -> DVector<f64> {
        DVector::from_element(x.nrows(), self.value)
    }

    fn parameters(&self) -> DVector<f64> {
        DVector::from_element(1, self.value)
    }

    fn named_parameters(&self) -> Vec<(String, f64)> {
        vec![("mean.constant".to_string(), self.value)]
    }

    fn reparameterize(&self, params: &[f64]) -> Result<Self> {
        expect_len(params, 1)?;
        Self::new(params[0])
    }

    fn gradient(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_element(x.nrows(), 1, 1.0)
    }

    fn input_gradient(
        &self,
        x: &DMatrix<f64>,
        _dl_dm: &DVector<f64>,
    ) -> DMatrix<f64> {
        DMatrix::zeros(x.nrows(), x.ncols())
    }
}

/// `m(x) = xᵀw + b`
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct LinearMean {
    weights: DVector<f64>,
    bias: f64,
}

impl LinearMean {
    pub fn new(weights: DVector<f64>, bias: f64) -> Result<Self> {
        if weights.is_empty() {
            return Err(GpError::InvalidInput(
                "a linear mean needs at least one weight".to_string(),
            ));
        }
        crate::linalg::ensure_finite("mean.weights", weights.as_slice())?;
        crate::linalg::ensure_finite("mean.bias", &[bias])?;
        Ok(Self { weights, bias })
    }

    /// All-zero linear mean over `dim` inputs
    pub fn zeros(dim: usize) -> Result<Self> {
        Self::new(DVector::zeros(dim), 0.0)
    }

    #[must_use]
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    #[must_use]
    pub fn bias(&self) -> f64 {
        self.bias
    }
}

impl Mean for LinearMean {
    fn n_parameters(&self) -> usize {
        self.weights.len() + 1
    }

    fn mean(&self, x: &DMatrix<f64>) -> DVector<f64> {
        (x * &self.weights).add_scalar(self.bias)
    }

    fn input_dim(&self) -> Option<usize> {
        Some(self.weights.len())
    }

    fn parameters(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.n_parameters(),
            self.weights.iter().copied().chain(std::iter::once(self.bias)),
        )
    }

    fn named_parameters(&self) -> Vec<(String, f64)> {
        self.weights
            .iter()
            .enumerate()
            .map(|(p, w)| (format!("mean.weight[{p}]"), *w))
            .chain(std::iter::once(("mean.bias".to_string(), self.bias)))
            .collect()
    }

    fn reparameterize(&self, params: &[f64]) -> Result<Self> {
        expect_len(params, self.n_parameters())?;
        let (weights, bias) = params.split_at(self.weights.len());
        Self::new(DVector::from_column_slice(weights), bias[0])
    }

    fn gradient(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        x.clone().insert_column(x.ncols(), 1.0)
    }

    fn input_gradient(
        &self,
        _x: &DMatrix<f64>,
        dl_dm: &DVector<f64>,
    ) -> DMatrix<f64> {
        dl_dm * self.weights.transpose()
    }
}

/// Any of the provided mean functions
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub enum MeanFunction {
    Zero(ZeroMean),
    Constant(ConstantMean),
    Linear(LinearMean),
}

macro_rules! mean_dispatch {
    ($mean: expr, $m: ident => $body: expr) => {
        match $mean {
            MeanFunction::Zero($m) => $body,
            MeanFunction::Constant($m) => $body,
            MeanFunction::Linear($m) => $body,
        }
    };
}

impl Mean for MeanFunction {
    fn n_parameters(&self) -> usize {
        mean_dispatch!(self, m => m.n_parameters())
    }

    fn mean(&self, x: &DMatrix<f64>) -> DVector<f64> {
        mean_dispatch!(self, m => m.mean(x))
    }

    fn input_dim(&self) -> Option<usize> {
        mean_dispatch!(self, m => m.input_dim())
    }

    fn parameters(&self) -> DVector<f64> {
        mean_dispatch!(self, m => m.parameters())
    }

    fn named_parameters(&self) -> Vec<(String, f64)> {
        mean_dispatch!(self, m => m.named_parameters())
    }

    fn reparameterize(&self, params: &[f64]) -> Result<Self> {
        match self {
            Self::Zero(m) => m.reparameterize(params).map(Self::Zero),
            Self::Constant(m) => m.reparameterize(params).map(Self::Constant),
            Self::Linear(m) => m.reparameterize(params).map(Self::Linear),
        }
    }

    fn gradient(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        mean_dispatch!(self, m => m.gradient(x))
    }

    fn input_gradient(
        &self,
        x: &DMatrix<f64>,
        dl_dm: &DVector<f64>,
    ) -> DMatrix<f64> {
        mean_dispatch!(self, m => m.input_gradient(x, dl_dm))
    }
}

impl From<ZeroMean> for MeanFunction {
    fn from(m: ZeroMean) -> Self {
        Self::Zero(m)
    }
}

impl From<ConstantMean> for MeanFunction {
    fn from(m: ConstantMean) -> Self {
        Self::Constant(m)
    }
}

impl From<LinearMean> for MeanFunction {
    fn from(m: LinearMean) -> Self {
        Self::Linear(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xs() -> DMatrix<f64> {
        DMatrix::from_row_slice(3, 2, &[1.0, 2.0, -1.0, 0.5, 0.0, 3.0])
    }

    #[test]
    fn constant_mean_broadcasts() -> Result<()> {
        let mean = ConstantMean::new(1.5)?;
        assert_eq!(mean.mean(&xs()), DVector::from_element(3, 1.5));
        assert_eq!(mean.gradient(&xs()), DMatrix::from_element(3, 1, 1.0));
        assert_eq!(mean.reparameterize(&[-2.0])?.value(), -2.0);
        assert!(mean.reparameterize(&[]).is_err());
        assert!(ConstantMean::new(f64::NAN).is_err());
        Ok(())
    }

    #[test]
    fn zero_mean_has_no_parameters() -> Result<()> {
        let mean = ZeroMean;
        assert_eq!(mean.n_parameters(), 0);
        assert_eq!(mean.gradient(&xs()).shape(), (3, 0));
        assert_eq!(mean.reparameterize(&[])?, ZeroMean);
        Ok(())
    }

    #[test]
    fn linear_mean_values_and_gradients() -> Result<()> {
        let mean = LinearMean::new(DVector::from_column_slice(&[2.0, -1.0]), 0.5)?;
        let x = xs();
        let m = mean.mean(&x);
        assert::close(m[0], 2.0 - 2.0 + 0.5, 1E-12);
        assert::close(m[1], -2.0 - 0.5 + 0.5, 1E-12);
        assert::close(m[2], -3.0 + 0.5, 1E-12);

        assert_eq!(mean.parameters().as_slice(), &[2.0, -1.0, 0.5]);
        let jac = mean.gradient(&x);
        assert_eq!(jac.shape(), (3, 3));
        assert_eq!(jac.row(1).iter().copied().collect::<Vec<_>>(), vec![-1.0, 0.5, 1.0]);

        let dl_dm = DVector::from_column_slice(&[1.0, 0.0, 2.0]);
        let gx = mean.input_gradient(&x, &dl_dm);
        assert_eq!(gx.row(2).iter().copied().collect::<Vec<_>>(), vec![4.0, -2.0]);

        let again = mean.reparameterize(mean.parameters().as_slice())?;
        assert_eq!(again, mean);
        Ok(())
    }

    #[test]
    fn mean_function_dispatches() -> Result<()> {
        let mean: MeanFunction = ConstantMean::new(3.0)?.into();
        assert_eq!(mean.n_parameters(), 1);
        let mean = mean.reparameterize(&[4.0])?;
        assert_eq!(mean, MeanFunction::Constant(ConstantMean::new(4.0)?));
        Ok(())
    }
}
