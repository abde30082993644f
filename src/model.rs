//! Exact Gaussian process regression
//!
//! The model has two explicit modes. In [`Mode::Training`] the forward pass
//! returns the prior over the given inputs and the hyper-parameters may be
//! fit by maximizing [`ExactGp::ln_m`]. In [`Mode::Evaluation`] the forward
//! pass conditions on the training data and returns the posterior
//! predictive.

use std::cell::OnceCell;

use log::debug;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

use crate::consts::HALF_LN_2PI;
use crate::error::{GpError, Result};
use crate::kernel::Kernel;
use crate::linalg::{
    cholesky_with_jitter, ensure_finite, ln_det, outer_product_self,
    JitterPolicy,
};
use crate::mean::{ConstantMean, Mean};
use crate::mvn::MultivariateNormal;
use crate::noise_model::NoiseModel;
use crate::transform::{FeatureMap, Identity, InputTransform};

/// Whether a model is being fit or queried
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub enum Mode {
    Training,
    Evaluation,
}

/// A model that places a joint normal prior over function values
pub trait Prior {
    /// Prior mean and covariance of the function at the rows of `x`
    fn prior(&self, x: &DMatrix<f64>) -> Result<MultivariateNormal>;
}

/// Parameters for an [`ExactGp`] that are not kernel or mean parameters
#[derive(Clone, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct ExactGpParams {
    noise_model: NoiseModel,
    jitter: JitterPolicy,
}

impl ExactGpParams {
    /// Set the noise model
    #[must_use]
    pub fn with_noise_model(self, noise_model: NoiseModel) -> Self {
        Self {
            noise_model,
            ..self
        }
    }

    /// Set the jitter retried when the covariance fails to factor
    #[must_use]
    pub fn with_jitter(self, jitter: JitterPolicy) -> Self {
        Self { jitter, ..self }
    }
}

/// Options for a single posterior query
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct PredictOptions {
    fast_variance: bool,
    observation_noise: bool,
}

impl PredictOptions {
    /// Reuse the factorization of the training covariance across queries.
    ///
    /// The factor is computed on the first fast query after entering
    /// evaluation mode and dropped by [`ExactGp::train`] or any parameter
    /// change.
    #[must_use]
    pub fn with_fast_variance(self, fast_variance: bool) -> Self {
        Self {
            fast_variance,
            ..self
        }
    }

    /// Add the (homoscedastic) observation noise to the predictive
    /// covariance, giving the distribution of new targets rather than of the
    /// latent function
    #[must_use]
    pub fn with_observation_noise(self, observation_noise: bool) -> Self {
        Self {
            observation_noise,
            ..self
        }
    }

    #[must_use]
    pub fn fast_variance(&self) -> bool {
        self.fast_variance
    }

    #[must_use]
    pub fn observation_noise(&self) -> bool {
        self.observation_noise
    }
}

/// Factorization of the noisy training covariance, reused across queries
#[derive(Clone, Debug)]
struct PosteriorCache {
    features: DMatrix<f64>,
    chol: Cholesky<f64, Dyn>,
    alpha: DVector<f64>,
}

/// Exact Gaussian process regressor
///
/// # Example
///
/// ```
/// use exact_gp::kernel::KernelExpr;
/// use exact_gp::mean::ConstantMean;
/// use exact_gp::model::{ExactGp, ExactGpParams, PredictOptions};
/// use exact_gp::noise_model::NoiseModel;
/// use nalgebra::{DMatrix, DVector};
///
/// let x: DMatrix<f64> = DMatrix::from_column_slice(5, 1, &[0.0, 0.25, 0.5, 0.75, 1.0]);
/// let y = x.column(0).map(|v| (6.0 * v).sin());
///
/// let kernel = KernelExpr::scaled_rbf(1.0, 0.3).unwrap();
/// let params = ExactGpParams::default()
///     .with_noise_model(NoiseModel::uniform(1E-4).unwrap());
/// let mut gp = ExactGp::new(x, y, kernel, ConstantMean::default(), params)
///     .unwrap();
///
/// gp.eval();
/// let x_star = DMatrix::from_column_slice(2, 1, &[0.25, 0.6]);
/// let pred = gp.predict(&x_star, PredictOptions::default()).unwrap();
/// assert!((pred.mean()[0] - 1.5_f64.sin()).abs() < 1E-2);
/// ```
#[derive(Clone, Debug)]
pub struct ExactGp<K, M = ConstantMean, F = Identity> {
    x_train: DMatrix<f64>,
    y_train: DVector<f64>,
    kernel: K,
    mean: M,
    noise_model: NoiseModel,
    transform: InputTransform<F>,
    jitter: JitterPolicy,
    mode: Mode,
    cache: OnceCell<PosteriorCache>,
}

impl<K, M> ExactGp<K, M, Identity>
where
    K: Kernel,
    M: Mean,
{
    /// Create a new GP over the training set `(x, y)`; the rows of `x` are
    /// the inputs. The model starts in training mode.
    pub fn new(
        x: DMatrix<f64>,
        y: DVector<f64>,
        kernel: K,
        mean: M,
        params: ExactGpParams,
    ) -> Result<Self> {
        Self::new_with_transform(
            x,
            y,
            kernel,
            mean,
            InputTransform::default(),
            params,
        )
    }
}

impl<K, M, F> ExactGp<K, M, F>
where
    K: Kernel,
    M: Mean,
    F: FeatureMap,
{
    /// Create a new GP whose mean and kernel see `transform(x)` rather than
    /// the raw inputs
    pub fn new_with_transform(
        x: DMatrix<f64>,
        y: DVector<f64>,
        kernel: K,
        mean: M,
        mut transform: InputTransform<F>,
        params: ExactGpParams,
    ) -> Result<Self> {
        transform.unfreeze();
        let gp = Self {
            x_train: x,
            y_train: y,
            kernel,
            mean,
            noise_model: params.noise_model,
            transform,
            jitter: params.jitter,
            mode: Mode::Training,
            cache: OnceCell::new(),
        };
        gp.validate(&gp.x_train, &gp.y_train)?;
        Ok(gp)
    }

    /// Apply `transform` to every input before the mean and kernel
    pub fn with_transform<G: FeatureMap>(
        self,
        transform: InputTransform<G>,
    ) -> Result<ExactGp<K, M, G>> {
        let mut gp = ExactGp {
            x_train: self.x_train,
            y_train: self.y_train,
            kernel: self.kernel,
            mean: self.mean,
            noise_model: self.noise_model,
            transform,
            jitter: self.jitter,
            mode: Mode::Training,
            cache: OnceCell::new(),
        };
        gp.transform.unfreeze();
        gp.validate(&gp.x_train, &gp.y_train)?;
        Ok(gp)
    }

    fn validate(&self, x: &DMatrix<f64>, y: &DVector<f64>) -> Result<()> {
        if x.nrows() == 0 {
            return Err(GpError::InvalidInput(
                "at least one training point is required".to_string(),
            ));
        }
        if x.ncols() == 0 {
            return Err(GpError::InvalidInput(
                "inputs must have at least one dimension".to_string(),
            ));
        }
        if y.len() != x.nrows() {
            return Err(GpError::shape("training targets", x.nrows(), y.len()));
        }
        ensure_finite("training inputs", x.as_slice())?;
        ensure_finite("training targets", y.as_slice())?;
        self.noise_model.check_size(x.nrows())?;

        if let Some(d) = self.transform.map().input_dim() {
            if d != x.ncols() {
                return Err(GpError::shape("feature map input", d, x.ncols()));
            }
        }
        let feature_dim = self.transform.output_dim(x.ncols());
        self.kernel.check_input_dim(feature_dim)?;
        if let Some(d) = self.mean.input_dim() {
            if d != feature_dim {
                return Err(GpError::shape("mean input", d, feature_dim));
            }
        }
        Ok(())
    }

    fn check_query(&self, x: &DMatrix<f64>) -> Result<()> {
        if x.ncols() != self.x_train.ncols() {
            return Err(GpError::shape(
                "query input dimension",
                self.x_train.ncols(),
                x.ncols(),
            ));
        }
        ensure_finite("query inputs", x.as_slice())
    }

    /// Replace the training data, keeping every parameter
    pub fn set_train_data(
        &mut self,
        x: DMatrix<f64>,
        y: DVector<f64>,
    ) -> Result<()> {
        self.validate(&x, &y)?;
        self.x_train = x;
        self.y_train = y;
        self.invalidate();
        Ok(())
    }

    #[must_use]
    pub fn x_train(&self) -> &DMatrix<f64> {
        &self.x_train
    }

    #[must_use]
    pub fn y_train(&self) -> &DVector<f64> {
        &self.y_train
    }

    #[must_use]
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    #[must_use]
    pub fn mean_function(&self) -> &M {
        &self.mean
    }

    #[must_use]
    pub fn noise_model(&self) -> &NoiseModel {
        &self.noise_model
    }

    #[must_use]
    pub fn transform(&self) -> &InputTransform<F> {
        &self.transform
    }

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Enter training mode. Drops any cached posterior factorization and any
    /// frozen feature bounds.
    pub fn train(&mut self) {
        self.mode = Mode::Training;
        self.transform.unfreeze();
        self.cache = OnceCell::new();
    }

    /// Enter evaluation mode. Feature bounds are frozen from the training
    /// inputs and a new fast-variance session starts.
    pub fn eval(&mut self) {
        self.mode = Mode::Evaluation;
        self.transform.freeze(&self.x_train);
        self.cache = OnceCell::new();
    }

    fn invalidate(&mut self) {
        self.cache = OnceCell::new();
        if self.mode == Mode::Evaluation {
            self.transform.freeze(&self.x_train);
        } else {
            self.transform.unfreeze();
        }
    }

    /// Whether a fast-variance factorization is currently cached
    #[must_use]
    pub fn has_cached_posterior(&self) -> bool {
        self.cache.get().is_some()
    }

    /// Number of free parameters
    #[must_use]
    pub fn n_parameters(&self) -> usize {
        self.kernel.n_parameters()
            + self.mean.n_parameters()
            + self.noise_model.n_parameters()
            + self.transform.n_parameters()
    }

    /// All free parameters in unconstrained space, ordered
    /// `[kernel | mean | noise | transform]`
    #[must_use]
    pub fn parameters(&self) -> DVector<f64> {
        let params: Vec<f64> = self
            .kernel
            .parameters()
            .iter()
            .chain(self.mean.parameters().iter())
            .chain(self.noise_model.parameters().iter())
            .chain(self.transform.parameters().iter())
            .copied()
            .collect();
        DVector::from_vec(params)
    }

    /// Kernel, mean and noise hyper-parameters in natural scale
    #[must_use]
    pub fn named_parameters(&self) -> Vec<(String, f64)> {
        let mut named = self.kernel.named_parameters();
        named.extend(self.mean.named_parameters());
        named.extend(self.noise_model.named_parameters());
        named
    }

    /// A copy of this model with parameters `theta`
    pub fn with_parameters(&self, theta: &[f64]) -> Result<Self> {
        if theta.len() != self.n_parameters() {
            return Err(GpError::shape(
                "parameter vector",
                self.n_parameters(),
                theta.len(),
            ));
        }
        ensure_finite("parameters", theta)?;

        let (kernel, rest) = self.kernel.consume_parameters(theta)?;
        let (mean_params, rest) = rest.split_at(self.mean.n_parameters());
        let (noise_params, transform_params) =
            rest.split_at(self.noise_model.n_parameters());

        let mut gp = Self {
            x_train: self.x_train.clone(),
            y_train: self.y_train.clone(),
            kernel,
            mean: self.mean.reparameterize(mean_params)?,
            noise_model: self.noise_model.reparameterize(noise_params)?,
            transform: self.transform.reparameterize(transform_params)?,
            jitter: self.jitter,
            mode: self.mode,
            cache: OnceCell::new(),
        };
        gp.invalidate();
        Ok(gp)
    }

    /// Replace every free parameter. Invalidates cached factorizations.
    pub fn set_parameters(&mut self, theta: &[f64]) -> Result<()> {
        *self = self.with_parameters(theta)?;
        Ok(())
    }

    /// Features the mean and kernel see for inputs `x`
    fn features(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        self.transform.apply_with_reference(x, &self.x_train)
    }

    /// Mode-dependent forward pass: the prior at `x` in training mode, the
    /// posterior predictive at `x` in evaluation mode
    pub fn forward(&self, x: &DMatrix<f64>) -> Result<MultivariateNormal> {
        match self.mode {
            Mode::Training => self.prior(x),
            Mode::Evaluation => self.predict(x, PredictOptions::default()),
        }
    }

    fn build_cache(&self) -> Result<PosteriorCache> {
        let features = self.features(&self.x_train);
        let cov = self
            .noise_model
            .add_noise_to_kernel(&self.kernel.covariance(&features, &features))?;
        let (chol, jitter) = cholesky_with_jitter(&cov, &self.jitter)?;
        let alpha = chol.solve(&(&self.y_train - self.mean.mean(&features)));
        debug!(
            "Factored training covariance of size {} (jitter {:e})",
            cov.nrows(),
            jitter
        );
        Ok(PosteriorCache {
            features,
            chol,
            alpha,
        })
    }

    fn posterior_cache(&self) -> Result<&PosteriorCache> {
        if let Some(cache) = self.cache.get() {
            return Ok(cache);
        }
        let cache = self.build_cache()?;
        Ok(self.cache.get_or_init(|| cache))
    }

    /// Posterior predictive distribution at the rows of `x`.
    ///
    /// Only available in evaluation mode.
    pub fn predict(
        &self,
        x: &DMatrix<f64>,
        options: PredictOptions,
    ) -> Result<MultivariateNormal> {
        if self.mode != Mode::Evaluation {
            return Err(GpError::ModeMismatch {
                expected: Mode::Evaluation,
                actual: self.mode,
            });
        }
        self.check_query(x)?;

        let z = self.features(x);
        let prior_mean = self.mean.mean(&z);
        let k_ss = self.kernel.covariance(&z, &z);

        let (mean, cov) = if options.fast_variance {
            let cache = self.posterior_cache()?;
            let k_s = self.kernel.covariance(&z, &cache.features);
            let mean = prior_mean + &k_s * &cache.alpha;
            let v = cache
                .chol
                .l_dirty()
                .solve_lower_triangular(&k_s.transpose())
                .ok_or(GpError::NumericalInstability {
                    tries: 0,
                    max_jitter: 0.0,
                })?;
            (mean, k_ss - v.transpose() * v)
        } else {
            let features = self.features(&self.x_train);
            let cov = self.noise_model.add_noise_to_kernel(
                &self.kernel.covariance(&features, &features),
            )?;
            let (chol, _) = cholesky_with_jitter(&cov, &self.jitter)?;
            let k_s = self.kernel.covariance(&z, &features);
            let alpha =
                chol.solve(&(&self.y_train - self.mean.mean(&features)));
            let mean = prior_mean + &k_s * alpha;
            let k_inv_ks = chol.solve(&k_s.transpose());
            (mean, k_ss - &k_s * k_inv_ks)
        };

        let mut cov = (&cov + cov.transpose()) * 0.5;
        if options.observation_noise {
            let noise = self.noise_model.variance().ok_or_else(|| {
                GpError::InvalidInput(
                    "observation noise at new inputs is unknown for per point noise"
                        .to_string(),
                )
            })?;
            for i in 0..cov.nrows() {
                cov[(i, i)] += noise;
            }
        }

        Ok(MultivariateNormal::new_unchecked(mean, cov).with_jitter(self.jitter))
    }

    /// Log marginal likelihood of the training targets and its gradient
    /// with respect to [`ExactGp::parameters`]
    pub fn ln_m(&self) -> Result<(f64, DVector<f64>)> {
        let x = &self.x_train;
        let n = x.nrows();
        let z = self.transform.apply(x);

        let (cov, cov_grad) = self.kernel.covariance_with_gradient(&z)?;
        let noisy = self.noise_model.add_noise_to_kernel(&cov)?;
        let (chol, _) = cholesky_with_jitter(&noisy, &self.jitter)?;

        let resid = &self.y_train - self.mean.mean(&z);
        let alpha = chol.solve(&resid);
        let ln_m = -0.5 * resid.dot(&alpha)
            - 0.5 * ln_det(&chol)
            - HALF_LN_2PI * n as f64;

        // ∂ln_m/∂K
        let w = (outer_product_self(&alpha) - chol.inverse()) * 0.5;

        let kernel_grad = cov_grad.contract(&w)?;
        let mean_grad = self.mean.gradient(&z).transpose() * &alpha;
        let noise_grad = self.noise_model.gradient(&w);
        let transform_grad = if self.transform.n_parameters() > 0 {
            let dl_dz = self.kernel.input_gradient(&z, &w)?
                + self.mean.input_gradient(&z, &alpha);
            self.transform.backward(x, &dl_dz)
        } else {
            DVector::zeros(0)
        };

        let grad: Vec<f64> = kernel_grad
            .iter()
            .chain(mean_grad.iter())
            .chain(noise_grad.iter())
            .chain(transform_grad.iter())
            .copied()
            .collect();
        Ok((ln_m, DVector::from_vec(grad)))
    }

    /// [`ExactGp::ln_m`] evaluated at parameters `theta`
    pub fn ln_m_with_parameters(
        &self,
        theta: &[f64],
    ) -> Result<(f64, DVector<f64>)> {
        self.with_parameters(theta)?.ln_m()
    }
}

impl<K, M, F> Prior for ExactGp<K, M, F>
where
    K: Kernel,
    M: Mean,
    F: FeatureMap,
{
    fn prior(&self, x: &DMatrix<f64>) -> Result<MultivariateNormal> {
        self.check_query(x)?;
        let z = self.features(x);
        Ok(MultivariateNormal::new_unchecked(
            self.mean.mean(&z),
            self.kernel.covariance(&z, &z),
        )
        .with_jitter(self.jitter))
    }
}
