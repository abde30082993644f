//! Exact Gaussian process regression
//!
//! Build an [`ExactGp`](model::ExactGp) from a kernel, a mean and a noise
//! model, fit its hyper-parameters with a [`Trainer`](train::Trainer), then
//! switch it to evaluation mode and query the posterior predictive.
//!
//! ```
//! use exact_gp::kernel::KernelExpr;
//! use exact_gp::mean::ConstantMean;
//! use exact_gp::model::{ExactGp, ExactGpParams, PredictOptions};
//! use exact_gp::train::{Trainer, TrainingConfig};
//! use nalgebra::{DMatrix, DVector};
//!
//! let x = DMatrix::from_fn(11, 1, |i, _| i as f64 / 10.0);
//! let y: DVector<f64> = x.column(0).map(|v| (6.0 * v).sin());
//!
//! let kernel = KernelExpr::scaled_rbf(1.0, 1.0).unwrap();
//! let mut gp = ExactGp::new(
//!     x,
//!     y,
//!     kernel,
//!     ConstantMean::default(),
//!     ExactGpParams::default(),
//! )
//! .unwrap();
//!
//! let report = Trainer::new(TrainingConfig::default().with_iterations(20))
//!     .fit(&mut gp)
//!     .unwrap();
//! assert!(report.final_loss() < report.initial_loss());
//!
//! gp.eval();
//! let x_star = DMatrix::from_column_slice(3, 1, &[0.05, 0.5, 0.95]);
//! let pred = gp.predict(&x_star, PredictOptions::default()).unwrap();
//! let (lower, upper) = pred.confidence_region();
//! assert!(lower.iter().zip(upper.iter()).all(|(l, u)| l < u));
//! ```
#![warn(unused_extern_crates)]

pub mod config;
pub mod consts;
pub mod error;
pub mod kernel;
pub mod linalg;
pub mod mean;
pub mod model;
pub mod mvn;
pub mod noise_model;
pub mod optim;
pub mod train;
pub mod transform;

pub use error::{GpError, Result};
