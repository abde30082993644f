use super::{
    check_positive, check_weight_shape, expect_n_parameters, row_difference,
    CovGrad, CovGradError, Kernel, KernelError,
};
use crate::consts::TWO_PI_SQUARED;
use itertools::iproduct;
use log::debug;
use nalgebra::base::constraint::{SameNumberOfColumns, ShapeConstraint};
use nalgebra::base::storage::Storage;
use nalgebra::{DMatrix, DVector, Dim, Matrix};
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

/// Spectral Mixture kernel (Wilson & Adams, 2013)
///
/// ```math
///     k(τ) = Σ_q w_q Π_p exp(-2π² τ_p² v_qp) cos(2π τ_p μ_qp),  τ = a - b
/// ```
///
/// Each of the `Q` components models a Gaussian bump in the spectral density
/// with weight `w_q`, mean frequency `μ_q` and variance `v_q` (one value per
/// input dimension). The loss surface of this kernel is highly multi-modal,
/// so prefer [`SpectralMixtureKernel::from_data`] over the fixed
/// [`SpectralMixtureKernel::with_components`] starting point.
///
/// Parameters are ordered `[ln w, ln μ (row-major), ln v (row-major)]`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct SpectralMixtureKernel {
    weights: DVector<f64>,
    means: DMatrix<f64>,
    variances: DMatrix<f64>,
}

/// Value of the kernel at one lag together with its derivatives
struct LagEvaluation {
    value: f64,
    d_params: Vec<f64>,
    d_tau: Vec<f64>,
}

impl SpectralMixtureKernel {
    /// Create a new spectral mixture kernel.
    ///
    /// `means` and `variances` are `Q × D`, `weights` has length `Q`.
    pub fn new(
        weights: DVector<f64>,
        means: DMatrix<f64>,
        variances: DMatrix<f64>,
    ) -> Result<Self, KernelError> {
        let q = weights.len();
        if q == 0 {
            return Err(KernelError::positive("num_mixtures", 0.0));
        }
        if means.ncols() == 0 {
            return Err(KernelError::DimensionMismatch {
                expected: 1,
                given: 0,
            });
        }
        if means.shape() != (q, means.ncols())
            || variances.shape() != means.shape()
        {
            return Err(KernelError::CovGrad(CovGradError::ShapeMismatch(
                vec![(q, 1), means.shape(), variances.shape()],
            )));
        }
        for &w in weights.iter() {
            check_positive("weight", w)?;
        }
        for &m in means.iter() {
            check_positive("mean", m)?;
        }
        for &v in variances.iter() {
            check_positive("variance", v)?;
        }
        Ok(Self {
            weights,
            means,
            variances,
        })
    }

    /// Deterministic starting point with `num_mixtures` components over
    /// `input_dim` dimensions: equal weights, mean frequencies spread over
    /// `(0, 0.5]` and unit variances.
    pub fn with_components(
        num_mixtures: usize,
        input_dim: usize,
    ) -> Result<Self, KernelError> {
        let q = num_mixtures as f64;
        let weights = DVector::from_element(num_mixtures, 1.0 / q);
        let means = DMatrix::from_fn(num_mixtures, input_dim, |c, _| {
            0.5 * (c + 1) as f64 / q
        });
        let variances = DMatrix::from_element(num_mixtures, input_dim, 1.0);
        Self::new(weights, means, variances)
    }

    /// Initialize the mixture from the training data.
    ///
    /// * weights are `std(y) / Q`
    /// * per dimension, lengthscales are drawn from `|N(0, max_dist²)|` and
    ///   the variance is the squared inverse lengthscale
    /// * mean frequencies are drawn from `U(0, nyquist)` where
    ///   `nyquist = 0.5 / min_dist`
    ///
    /// with `max_dist` the range of the inputs and `min_dist` the smallest
    /// non-zero gap between two inputs along that dimension.
    pub fn from_data<R: Rng>(
        num_mixtures: usize,
        x: &DMatrix<f64>,
        y: &DVector<f64>,
        rng: &mut R,
    ) -> Result<Self, KernelError> {
        if num_mixtures == 0 {
            return Err(KernelError::positive("num_mixtures", 0.0));
        }
        if x.ncols() == 0 || x.nrows() == 0 {
            return Err(KernelError::DimensionMismatch {
                expected: 1,
                given: 0,
            });
        }

        let q = num_mixtures as f64;
        let n = y.len();
        let y_std = if n > 1 {
            let mean = y.mean();
            (y.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                / (n - 1) as f64)
                .sqrt()
        } else {
            0.0
        };
        let weight = if y_std > 0.0 { y_std / q } else { 1.0 / q };

        let spans: Vec<(f64, f64)> = (0..x.ncols())
            .map(|p| {
                let mut col: Vec<f64> = x.column(p).iter().copied().collect();
                col.sort_by(f64::total_cmp);
                let max_dist = col[col.len() - 1] - col[0];
                let min_dist = col
                    .windows(2)
                    .map(|w| w[1] - w[0])
                    .filter(|&gap| gap > 0.0)
                    .fold(f64::INFINITY, f64::min);
                if max_dist > 0.0 && min_dist.is_finite() {
                    (max_dist, min_dist)
                } else {
                    debug!("Input dimension {p} is constant; using unit spacing");
                    (1.0, 1.0)
                }
            })
            .collect();

        let mut means = DMatrix::zeros(num_mixtures, x.ncols());
        let mut variances = DMatrix::zeros(num_mixtures, x.ncols());
        for (c, p) in iproduct!(0..num_mixtures, 0..x.ncols()) {
            let (max_dist, min_dist) = spans[p];
            let z: f64 = rng.sample(StandardNormal);
            let length_scale = (z * max_dist).abs().max(f64::MIN_POSITIVE);
            variances[(c, p)] = length_scale.powi(-2).min(f64::MAX);
            let u: f64 = rng.gen();
            means[(c, p)] = (u * 0.5 / min_dist).max(f64::MIN_POSITIVE);
        }

        Self::new(DVector::from_element(num_mixtures, weight), means, variances)
    }

    #[must_use]
    pub fn num_mixtures(&self) -> usize {
        self.weights.len()
    }

    #[must_use]
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    #[must_use]
    pub fn means(&self) -> &DMatrix<f64> {
        &self.means
    }

    #[must_use]
    pub fn variances(&self) -> &DMatrix<f64> {
        &self.variances
    }

    fn dim(&self) -> usize {
        self.means.ncols()
    }

    /// Lag restricted to the kernel's own dimensions, missing ones at zero
    fn lag(&self, tau: &[f64]) -> Vec<f64> {
        (0..self.dim())
            .map(|p| tau.get(p).copied().unwrap_or(0.0))
            .collect()
    }

    fn value(&self, tau: &[f64]) -> f64 {
        let tau = self.lag(tau);
        (0..self.num_mixtures())
            .map(|c| {
                let mut expo = 0.0;
                let mut cos_prod = 1.0;
                for (p, t) in tau.iter().enumerate() {
                    expo += t * t * self.variances[(c, p)];
                    cos_prod *= (2.0 * PI * t * self.means[(c, p)]).cos();
                }
                self.weights[c] * (-TWO_PI_SQUARED * expo).exp() * cos_prod
            })
            .sum()
    }

    fn evaluate(&self, tau: &[f64]) -> LagEvaluation {
        let tau = self.lag(tau);
        let q = self.num_mixtures();
        let d = self.dim();
        let mut value = 0.0;
        let mut d_params = vec![0.0; self.n_parameters()];
        let mut d_tau = vec![0.0; d];

        for c in 0..q {
            let w = self.weights[c];
            let expo: f64 = (0..d)
                .map(|p| tau[p] * tau[p] * self.variances[(c, p)])
                .sum();
            let e = (-TWO_PI_SQUARED * expo).exp();
            let args: Vec<f64> =
                (0..d).map(|p| 2.0 * PI * tau[p] * self.means[(c, p)]).collect();
            let cos: Vec<f64> = args.iter().map(|a| a.cos()).collect();
            let cos_prod: f64 = cos.iter().product();
            let term = w * e * cos_prod;
            value += term;
            d_params[c] = term;

            for p in 0..d {
                let cos_excl: f64 = cos
                    .iter()
                    .enumerate()
                    .filter(|&(r, _)| r != p)
                    .map(|(_, v)| v)
                    .product();
                let sin = args[p].sin();
                let mu = self.means[(c, p)];
                let v = self.variances[(c, p)];

                d_params[q + c * d + p] = -w * e * cos_excl * sin * args[p];
                d_params[q + q * d + c * d + p] =
                    -term * TWO_PI_SQUARED * tau[p] * tau[p] * v;
                d_tau[p] += w
                    * e
                    * (-2.0 * TWO_PI_SQUARED * tau[p] * v * cos_prod
                        - 2.0 * PI * mu * sin * cos_excl);
            }
        }

        LagEvaluation {
            value,
            d_params,
            d_tau,
        }
    }
}

impl Kernel for SpectralMixtureKernel {
    fn n_parameters(&self) -> usize {
        self.num_mixtures() * (1 + 2 * self.dim())
    }

    // lags are cut or zero-padded to `dim()`; mismatched inputs are caught
    // by `check_input_dim`
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
            self.value(&row_difference(x1, i, x2, j))
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
        DVector::from_element(x.nrows(), self.weights.sum())
    }

    fn input_dim(&self) -> Option<usize> {
        Some(self.dim())
    }

    fn parameters(&self) -> DVector<f64> {
        let means = self.means.transpose();
        let variances = self.variances.transpose();
        DVector::from_iterator(
            self.n_parameters(),
            self.weights
                .iter()
                .chain(means.iter())
                .chain(variances.iter())
                .map(|x| x.ln()),
        )
    }

    fn named_parameters(&self) -> Vec<(String, f64)> {
        let q = self.num_mixtures();
        let d = self.dim();
        let weights =
            (0..q).map(|c| (format!("mixture_weight[{c}]"), self.weights[c]));
        let means = iproduct!(0..q, 0..d).map(|(c, p)| {
            (format!("mixture_mean[{c}][{p}]"), self.means[(c, p)])
        });
        let variances = iproduct!(0..q, 0..d).map(|(c, p)| {
            (format!("mixture_variance[{c}][{p}]"), self.variances[(c, p)])
        });
        weights.chain(means).chain(variances).collect()
    }

    fn reparameterize(&self, params: &[f64]) -> Result<Self, KernelError> {
        expect_n_parameters(params, self.n_parameters())?;
        let q = self.num_mixtures();
        let d = self.dim();
        let (w, rest) = params.split_at(q);
        let (m, v) = rest.split_at(q * d);
        Self::new(
            DVector::from_iterator(q, w.iter().map(|x| x.exp())),
            DMatrix::from_row_iterator(q, d, m.iter().map(|x| x.exp())),
            DMatrix::from_row_iterator(q, d, v.iter().map(|x| x.exp())),
        )
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
        let mut cov = DMatrix::zeros(n, n);
        let mut grad = CovGrad::zeros(n, self.n_parameters());

        for i in 0..n {
            for j in 0..=i {
                let lag = self.evaluate(&row_difference(x, i, x, j));
                cov[(i, j)] = lag.value;
                cov[(j, i)] = lag.value;
                for (k, g) in lag.d_params.iter().enumerate() {
                    grad[(i, j, k)] = *g;
                    grad[(j, i, k)] = *g;
                }
            }
        }
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
        let n = x.nrows();
        check_weight_shape(n, dl_dk)?;
        if x.ncols() != self.dim() {
            return Err(KernelError::DimensionMismatch {
                expected: self.dim(),
                given: x.ncols(),
            });
        }

        let mut grad = DMatrix::zeros(n, x.ncols());
        for i in 0..n {
            for j in (0..n).filter(|&j| j != i) {
                let lag = self.evaluate(&row_difference(x, i, x, j));
                let w = dl_dk[(i, j)] + dl_dk[(j, i)];
                for (p, g) in lag.d_tau.iter().enumerate() {
                    grad[(i, p)] += w * g;
                }
            }
        }
        Ok(grad)
    }
}
