//! Declarative description of a GP regression experiment
//!
//! A [`GpConfig`] names the kernel family and its initial hyper-parameters
//! (or asks for them to be initialised from the data), the mean, the
//! observation noise, an optional feature extractor, and how to train and
//! query the model. With the `serde1` feature it can be read from any serde
//! format.

use nalgebra::{DMatrix, DVector};
use rand::Rng;

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

use crate::consts::DEFAULT_N_STD;
use crate::error::{GpError, Result};
use crate::kernel::{KernelExpr, SpectralMixtureKernel, WhiteKernel};
use crate::mean::{ConstantMean, LinearMean, MeanFunction, ZeroMean};
use crate::model::{ExactGp, ExactGpParams, PredictOptions};
use crate::noise_model::NoiseModel;
use crate::train::{OptimizerKind, Trainer, TrainingConfig};
use crate::transform::{Activation, FeatureMap, InputTransform, Mlp};

/// Model produced by [`GpConfig::build`]
pub type ConfiguredGp = ExactGp<KernelExpr, MeanFunction, Mlp>;

/// Covariance family and its starting point
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub enum KernelFamily {
    /// `outputscale · RBF(length_scale)`
    Rbf { outputscale: f64, length_scale: f64 },
    /// Spectral mixture with `num_mixtures` components
    SpectralMixture {
        num_mixtures: usize,
        /// Initialise weights, frequencies and variances from the training
        /// data rather than the fixed default
        from_data: bool,
    },
}

impl Default for KernelFamily {
    fn default() -> Self {
        Self::Rbf {
            outputscale: 1.0,
            length_scale: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub enum MeanFamily {
    Zero,
    Constant(f64),
    /// Linear in the features, starting at zero
    Linear,
}

/// Feed-forward network applied to the inputs before the kernel
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct FeatureExtractorConfig {
    /// Widths of the hidden layers
    pub hidden: Vec<usize>,
    /// Number of features handed to the kernel
    pub output_dim: usize,
    pub activation: Activation,
}

/// Everything needed to build, train and query a model
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case", default))]
pub struct GpConfig {
    pub kernel: KernelFamily,
    /// Add a learned white noise kernel with this starting level
    pub white_noise: Option<f64>,
    pub mean: MeanFamily,
    /// Initial observation noise variance
    pub noise: f64,
    pub feature_extractor: Option<FeatureExtractorConfig>,
    pub optimizer: OptimizerKind,
    pub iterations: usize,
    /// Half width of confidence regions in standard deviations
    pub n_std: f64,
    pub fast_variance: bool,
}

impl Default for GpConfig {
    fn default() -> Self {
        Self {
            kernel: KernelFamily::default(),
            white_noise: None,
            mean: MeanFamily::Constant(0.0),
            noise: 0.1,
            feature_extractor: None,
            optimizer: OptimizerKind::default(),
            iterations: 50,
            n_std: DEFAULT_N_STD,
            fast_variance: false,
        }
    }
}

impl GpConfig {
    /// Check settings that do not depend on the data
    pub fn validate(&self) -> Result<()> {
        if !(self.n_std >= 0.0 && self.n_std.is_finite()) {
            return Err(GpError::invalid_parameter("n_std", self.n_std));
        }
        if let Some(fe) = &self.feature_extractor {
            if fe.output_dim == 0 || fe.hidden.contains(&0) {
                return Err(GpError::InvalidInput(
                    "feature extractor layers must have at least one unit"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Build a model over the training set `(x, y)`. The random source is
    /// used for the feature extractor weights and for data-driven spectral
    /// mixture initialisation.
    pub fn build<R: Rng>(
        &self,
        x: DMatrix<f64>,
        y: DVector<f64>,
        rng: &mut R,
    ) -> Result<ConfiguredGp> {
        self.validate()?;
        if x.ncols() == 0 || x.nrows() == 0 {
            return Err(GpError::InvalidInput(
                "training inputs must be non-empty".to_string(),
            ));
        }

        let transform = match &self.feature_extractor {
            Some(fe) => InputTransform::with_rescaling(Mlp::new(
                x.ncols(),
                &fe.hidden,
                fe.output_dim,
                fe.activation,
                rng,
            )?),
            None => InputTransform::new(Mlp::from_layers(Vec::new())?),
        };
        // the kernel and mean see the initial features, not the raw inputs
        let features = transform.apply(&x);
        let feature_dim = transform.map().output_dim(x.ncols());

        let kernel = self.kernel(&features, &y, rng)?;
        let mean: MeanFunction = match self.mean {
            MeanFamily::Zero => ZeroMean.into(),
            MeanFamily::Constant(value) => ConstantMean::new(value)?.into(),
            MeanFamily::Linear => LinearMean::zeros(feature_dim)?.into(),
        };
        let params = ExactGpParams::default()
            .with_noise_model(NoiseModel::uniform(self.noise)?);

        ExactGp::new_with_transform(x, y, kernel, mean, transform, params)
    }

    fn kernel<R: Rng>(
        &self,
        features: &DMatrix<f64>,
        y: &DVector<f64>,
        rng: &mut R,
    ) -> Result<KernelExpr> {
        let base = match self.kernel {
            KernelFamily::Rbf {
                outputscale,
                length_scale,
            } => KernelExpr::scaled_rbf(outputscale, length_scale)?,
            KernelFamily::SpectralMixture {
                num_mixtures,
                from_data: true,
            } => {
                SpectralMixtureKernel::from_data(num_mixtures, features, y, rng)?
                    .into()
            }
            KernelFamily::SpectralMixture {
                num_mixtures,
                from_data: false,
            } => SpectralMixtureKernel::with_components(
                num_mixtures,
                features.ncols(),
            )?
            .into(),
        };
        Ok(match self.white_noise {
            Some(level) => base + WhiteKernel::new(level)?,
            None => base,
        })
    }

    /// Trainer running the configured optimizer for the configured number
    /// of iterations
    #[must_use]
    pub fn trainer<'a>(&self) -> Trainer<'a> {
        Trainer::new(
            TrainingConfig::default()
                .with_optimizer(self.optimizer)
                .with_iterations(self.iterations),
        )
    }

    #[must_use]
    pub fn predict_options(&self) -> PredictOptions {
        PredictOptions::default().with_fast_variance(self.fast_variance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Kernel, LeafKernel};
    use crate::mean::Mean;
    use crate::model::Mode;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256Plus;

    fn data() -> (DMatrix<f64>, DVector<f64>) {
        let x = DMatrix::from_fn(12, 1, |i, _| i as f64 / 11.0);
        let y = x.column(0).map(|v| (4.0 * v).sin());
        (x, y)
    }

    #[test]
    fn default_config_builds_a_scaled_rbf() -> Result<()> {
        let (x, y) = data();
        let mut rng = Xoshiro256Plus::seed_from_u64(1);
        let gp = GpConfig::default().build(x, y, &mut rng)?;
        assert_eq!(gp.mode(), Mode::Training);
        assert_eq!(gp.kernel().n_parameters(), 2);
        assert_eq!(gp.mean_function().n_parameters(), 1);
        assert_eq!(gp.transform().n_parameters(), 0);
        assert!(!gp.transform().rescales());
        Ok(())
    }

    #[test]
    fn spectral_mixture_from_data_differs_from_default() -> Result<()> {
        let (x, y) = data();
        let mut rng = Xoshiro256Plus::seed_from_u64(2);
        let mut config = GpConfig {
            kernel: KernelFamily::SpectralMixture {
                num_mixtures: 3,
                from_data: true,
            },
            ..GpConfig::default()
        };
        let fitted = config.build(x.clone(), y.clone(), &mut rng)?;
        config.kernel = KernelFamily::SpectralMixture {
            num_mixtures: 3,
            from_data: false,
        };
        let fixed = config.build(x, y, &mut rng)?;

        assert_eq!(fitted.kernel().n_parameters(), 9);
        assert_ne!(fitted.kernel(), fixed.kernel());
        assert!(matches!(
            fixed.kernel().leaves()[0],
            LeafKernel::SpectralMixture(_)
        ));
        Ok(())
    }

    #[test]
    fn feature_extractor_feeds_the_kernel() -> Result<()> {
        let x = DMatrix::from_fn(10, 3, |i, j| (i * (j + 1)) as f64 / 7.0);
        let y = DVector::from_fn(10, |i, _| (i as f64).cos());
        let mut rng = Xoshiro256Plus::seed_from_u64(3);
        let config = GpConfig {
            mean: MeanFamily::Linear,
            white_noise: Some(0.01),
            feature_extractor: Some(FeatureExtractorConfig {
                hidden: vec![8, 4],
                output_dim: 2,
                activation: Activation::Relu,
            }),
            ..GpConfig::default()
        };
        let gp = config.build(x, y, &mut rng)?;
        assert!(gp.transform().rescales());
        // 3·8+8 + 8·4+4 + 4·2+2
        assert_eq!(gp.transform().n_parameters(), 78);
        assert_eq!(gp.mean_function().input_dim(), Some(2));
        assert_eq!(gp.kernel().leaves().len(), 3);
        Ok(())
    }

    #[test]
    fn options_follow_the_config() {
        let config = GpConfig {
            fast_variance: true,
            iterations: 7,
            ..GpConfig::default()
        };
        assert!(config.predict_options().fast_variance());
        assert_eq!(config.trainer().config().iterations(), 7);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let (x, y) = data();
        let mut rng = Xoshiro256Plus::seed_from_u64(4);
        let bad_n_std = GpConfig {
            n_std: -1.0,
            ..GpConfig::default()
        };
        assert!(bad_n_std.build(x.clone(), y.clone(), &mut rng).is_err());

        let bad_noise = GpConfig {
            noise: 0.0,
            ..GpConfig::default()
        };
        assert!(bad_noise.build(x, y, &mut rng).is_err());
    }

    #[cfg(feature = "serde1")]
    #[test]
    fn partial_json_config_fills_in_defaults() {
        let json = r#"{
            "kernel": {"spectral_mixture": {"num_mixtures": 4, "from_data": true}},
            "optimizer": {"lbfgs": {"memory": 5}},
            "fast_variance": true
        }"#;
        let config: GpConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.kernel,
            KernelFamily::SpectralMixture {
                num_mixtures: 4,
                from_data: true
            }
        );
        assert_eq!(config.optimizer, OptimizerKind::Lbfgs { memory: 5 });
        assert_eq!(config.mean, MeanFamily::Constant(0.0));
        assert_eq!(config.iterations, 50);
        assert!(config.fast_variance);
    }
}
