//! Multivariate normal distribution over function values

use std::cell::OnceCell;

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::consts::{DEFAULT_N_STD, HALF_LN_2PI};
use crate::error::{GpError, Result};
use crate::linalg::{cholesky_with_jitter, ensure_finite, ln_det, JitterPolicy};

/// Joint normal distribution of a GP at a finite set of inputs.
///
/// Returned by [`ExactGp::forward`](crate::model::ExactGp::forward) as the
/// prior in training mode and as the posterior predictive in evaluation
/// mode. The Cholesky factor of the covariance is computed (with jitter if
/// needed) the first time it is required and reused afterwards.
///
/// # Example
///
/// ```
/// use exact_gp::mvn::MultivariateNormal;
/// use nalgebra::{DMatrix, DVector};
///
/// let mvn = MultivariateNormal::new(
///     DVector::from_column_slice(&[0.0, 1.0]),
///     DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 1.0]),
/// ).unwrap();
///
/// let (lower, upper) = mvn.confidence_region();
/// assert!((lower[0] + 4.0).abs() < 1E-12);
/// assert!((upper[1] - 3.0).abs() < 1E-12);
/// ```
#[derive(Clone, Debug)]
pub struct MultivariateNormal {
    mean: DVector<f64>,
    cov: DMatrix<f64>,
    jitter: JitterPolicy,
    chol: OnceCell<Cholesky<f64, Dyn>>,
}

impl PartialEq for MultivariateNormal {
    fn eq(&self, other: &Self) -> bool {
        self.mean == other.mean && self.cov == other.cov
    }
}

impl MultivariateNormal {
    /// Create a new distribution; `cov` must be square and match `mean`.
    pub fn new(mean: DVector<f64>, cov: DMatrix<f64>) -> Result<Self> {
        if cov.nrows() != cov.ncols() {
            return Err(GpError::shape(
                "square covariance",
                cov.nrows(),
                cov.ncols(),
            ));
        }
        if cov.nrows() != mean.len() {
            return Err(GpError::shape("covariance", mean.len(), cov.nrows()));
        }
        ensure_finite("mean", mean.as_slice())?;
        ensure_finite("covariance", cov.as_slice())?;
        Ok(Self::new_unchecked(mean, cov))
    }

    pub(crate) fn new_unchecked(mean: DVector<f64>, cov: DMatrix<f64>) -> Self {
        Self {
            mean,
            cov,
            jitter: JitterPolicy::default(),
            chol: OnceCell::new(),
        }
    }

    /// Use `jitter` when factoring the covariance
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterPolicy) -> Self {
        self.jitter = jitter;
        self.chol = OnceCell::new();
        self
    }

    /// Same distribution with `diag` added to the covariance diagonal, e.g.
    /// observation noise to go from latent values to targets
    pub fn with_added_diagonal(&self, diag: &DVector<f64>) -> Result<Self> {
        if diag.len() != self.dim() {
            return Err(GpError::shape("added diagonal", self.dim(), diag.len()));
        }
        ensure_finite("added diagonal", diag.as_slice())?;
        let mut cov = self.cov.clone();
        cov.set_diagonal(&(self.cov.diagonal() + diag));
        Ok(Self {
            mean: self.mean.clone(),
            cov,
            jitter: self.jitter,
            chol: OnceCell::new(),
        })
    }

    /// Number of jointly distributed values
    #[must_use]
    pub fn dim(&self) -> usize {
        self.mean.len()
    }

    #[must_use]
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    #[must_use]
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.cov
    }

    /// Marginal variances, clamped at zero against round-off
    #[must_use]
    pub fn variance(&self) -> DVector<f64> {
        self.cov.diagonal().map(|v| v.max(0.0))
    }

    #[must_use]
    pub fn stddev(&self) -> DVector<f64> {
        self.variance().map(f64::sqrt)
    }

    /// `mean ± 2σ`
    #[must_use]
    pub fn confidence_region(&self) -> (DVector<f64>, DVector<f64>) {
        self.region(DEFAULT_N_STD)
    }

    /// `mean ± n_std σ`
    pub fn confidence_region_with(
        &self,
        n_std: f64,
    ) -> Result<(DVector<f64>, DVector<f64>)> {
        if n_std >= 0.0 && n_std.is_finite() {
            Ok(self.region(n_std))
        } else {
            Err(GpError::invalid_parameter("n_std", n_std))
        }
    }

    fn region(&self, n_std: f64) -> (DVector<f64>, DVector<f64>) {
        let half_width = self.stddev() * n_std;
        (&self.mean - &half_width, &self.mean + half_width)
    }

    /// Lower Cholesky factor of the covariance
    pub fn cholesky(&self) -> Result<&Cholesky<f64, Dyn>> {
        if let Some(chol) = self.chol.get() {
            return Ok(chol);
        }
        let (chol, _) = cholesky_with_jitter(&self.cov, &self.jitter)?;
        Ok(self.chol.get_or_init(|| chol))
    }

    /// Log density of `y`
    pub fn log_prob(&self, y: &DVector<f64>) -> Result<f64> {
        if y.len() != self.dim() {
            return Err(GpError::shape("log_prob argument", self.dim(), y.len()));
        }
        let chol = self.cholesky()?;
        let diff = y - &self.mean;
        let alpha = chol.solve(&diff);
        Ok(-0.5 * diff.dot(&alpha)
            - 0.5 * ln_det(chol)
            - HALF_LN_2PI * self.dim() as f64)
    }

    /// One correlated draw `mean + L z`, `z ~ N(0, I)`
    pub fn draw<R: Rng>(&self, rng: &mut R) -> Result<DVector<f64>> {
        let l = self.cholesky()?.l();
        Ok(draw_with(&self.mean, &l, rng))
    }

    /// `n` independent draws
    pub fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> Result<Vec<DVector<f64>>> {
        let l = self.cholesky()?.l();
        Ok((0..n).map(|_| draw_with(&self.mean, &l, rng)).collect())
    }

    /// Endless stream of draws. Each call starts a fresh stream sharing the
    /// factorization.
    pub fn sample_stream<'r, R: Rng>(
        &self,
        rng: &'r mut R,
    ) -> Result<impl Iterator<Item = DVector<f64>> + 'r> {
        let l = self.cholesky()?.l();
        let mean = self.mean.clone();
        Ok(std::iter::repeat_with(move || draw_with(&mean, &l, rng)))
    }
}

fn draw_with<R: Rng>(
    mean: &DVector<f64>,
    l: &DMatrix<f64>,
    rng: &mut R,
) -> DVector<f64> {
    let z = DVector::from_fn(mean.len(), |_, _| rng.sample(StandardNormal));
    mean + l * z
}
