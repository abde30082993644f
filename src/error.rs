use nalgebra::DVector;
use std::fmt;

use crate::kernel::{CovGradError, KernelError};
use crate::model::Mode;
use crate::train::TrainingReport;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, GpError>;

/// Errors from building, training, or querying a Gaussian process
#[derive(Debug, Clone, PartialEq)]
pub enum GpError {
    /// Two collections that must agree in size do not
    ShapeMismatch {
        /// What was being compared
        context: &'static str,
        /// The size required
        expected: usize,
        /// The size given
        given: usize,
    },
    /// The input data is empty or not finite
    InvalidInput(String),
    /// A directly supplied parameter is outside its domain
    InvalidParameter {
        /// Name of parameter
        name: String,
        /// Value given
        given: f64,
    },
    /// The covariance matrix could not be factored even with jitter
    NumericalInstability {
        /// Number of jittered attempts made
        tries: usize,
        /// Largest jitter that was added to the diagonal
        max_jitter: f64,
    },
    /// The training loss became non-finite
    DivergedTraining(Box<DivergedTraining>),
    /// The operation requires the model to be in another mode
    ModeMismatch {
        /// Mode the operation requires
        expected: Mode,
        /// Mode the model is in
        actual: Mode,
    },
    /// An error from a kernel
    Kernel(KernelError),
    /// An error reported by the external optimizer
    Optimizer(String),
}

/// State of a training run that was stopped because its loss diverged
#[derive(Debug, Clone, PartialEq)]
pub struct DivergedTraining {
    /// Iteration at which the non-finite value was observed
    pub iteration: usize,
    /// The offending loss value
    pub loss: f64,
    /// The last parameters that produced a finite loss
    pub last_valid_parameters: DVector<f64>,
    /// Iterations completed before divergence
    pub report: TrainingReport,
}

impl GpError {
    pub(crate) fn shape(
        context: &'static str,
        expected: usize,
        given: usize,
    ) -> Self {
        Self::ShapeMismatch {
            context,
            expected,
            given,
        }
    }

    pub(crate) fn invalid_parameter(name: &str, given: f64) -> Self {
        Self::InvalidParameter {
            name: name.to_string(),
            given,
        }
    }

    /// Whether the caller may reasonably retry with a smaller learning rate
    pub fn is_diverged(&self) -> bool {
        matches!(self, Self::DivergedTraining(_))
    }
}

impl std::error::Error for GpError {}

impl fmt::Display for GpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShapeMismatch {
                context,
                expected,
                given,
            } => write!(
                f,
                "Shape mismatch in {context}: expected {expected}, given {given}"
            ),
            Self::InvalidInput(msg) => write!(f, "Invalid input: {msg}"),
            Self::InvalidParameter { name, given } => {
                write!(f, "Parameter {name} is out of its domain, given: {given}")
            }
            Self::NumericalInstability { tries, max_jitter } => write!(
                f,
                "Covariance matrix is not positive definite after {tries} \
                 jitter attempts (max jitter {max_jitter:e})"
            ),
            Self::DivergedTraining(d) => write!(
                f,
                "Training diverged at iteration {} (loss = {})",
                d.iteration, d.loss
            ),
            Self::ModeMismatch { expected, actual } => write!(
                f,
                "Operation requires {expected:?} mode but the model is in \
                 {actual:?} mode"
            ),
            Self::Kernel(e) => write!(f, "Kernel error: {e}"),
            Self::Optimizer(msg) => write!(f, "Optimizer failed: {msg}"),
        }
    }
}

impl From<KernelError> for GpError {
    fn from(e: KernelError) -> Self {
        Self::Kernel(e)
    }
}

impl From<CovGradError> for GpError {
    fn from(e: CovGradError) -> Self {
        Self::Kernel(KernelError::CovGrad(e))
    }
}
