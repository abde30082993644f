//! First-order optimizers for minimizing a differentiable loss
//!
//! These keep their own state between steps, so one optimizer instance
//! drives one training run.

use nalgebra::DVector;

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

use crate::error::{GpError, Result};

/// Takes descent steps given the gradient of the loss
pub trait GradientOptimizer {
    /// Forget the running state (moments, velocity, step count). A training
    /// run calls this once before its first step.
    fn zero_grad(&mut self);

    /// Move `params` downhill along `grad`, the gradient of the loss to be
    /// minimized
    fn step(&mut self, params: &mut DVector<f64>, grad: &DVector<f64>);
}

fn check_learning_rate(lr: f64) -> Result<f64> {
    if lr > 0.0 && lr.is_finite() {
        Ok(lr)
    } else {
        Err(GpError::invalid_parameter("learning_rate", lr))
    }
}

/// Parameters for the [`Adam`] optimizer
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct AdamParams {
    /// Step size
    pub learning_rate: f64,
    /// Decay of the first moment estimate
    pub beta1: f64,
    /// Decay of the second moment estimate
    pub beta2: f64,
    /// Added to the root second moment
    pub eps: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1E-8,
        }
    }
}

impl AdamParams {
    #[must_use]
    pub fn with_learning_rate(self, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            ..self
        }
    }

    #[must_use]
    pub fn with_betas(self, beta1: f64, beta2: f64) -> Self {
        Self {
            beta1,
            beta2,
            ..self
        }
    }
}

/// Adaptive moment estimation
#[derive(Clone, Debug, PartialEq)]
pub struct Adam {
    params: AdamParams,
    m: DVector<f64>,
    v: DVector<f64>,
    t: i32,
}

impl Adam {
    pub fn new(params: AdamParams) -> Result<Self> {
        check_learning_rate(params.learning_rate)?;
        for (name, beta) in [("beta1", params.beta1), ("beta2", params.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(GpError::invalid_parameter(name, beta));
            }
        }
        if !(params.eps > 0.0) {
            return Err(GpError::invalid_parameter("eps", params.eps));
        }
        Ok(Self {
            params,
            m: DVector::zeros(0),
            v: DVector::zeros(0),
            t: 0,
        })
    }

    /// Adam with the usual defaults and learning rate `lr`
    pub fn with_learning_rate(lr: f64) -> Result<Self> {
        Self::new(AdamParams::default().with_learning_rate(lr))
    }

    #[must_use]
    pub fn params(&self) -> &AdamParams {
        &self.params
    }
}

impl GradientOptimizer for Adam {
    fn zero_grad(&mut self) {
        self.m = DVector::zeros(0);
        self.v = DVector::zeros(0);
        self.t = 0;
    }

    fn step(&mut self, params: &mut DVector<f64>, grad: &DVector<f64>) {
        if self.m.len() != grad.len() {
            self.m = DVector::zeros(grad.len());
            self.v = DVector::zeros(grad.len());
            self.t = 0;
        }
        let AdamParams {
            learning_rate,
            beta1,
            beta2,
            eps,
        } = self.params;

        self.t += 1;
        self.m = &self.m * beta1 + grad * (1.0 - beta1);
        self.v = &self.v * beta2 + grad.component_mul(grad) * (1.0 - beta2);

        let m_corr = 1.0 - beta1.powi(self.t);
        let v_corr = 1.0 - beta2.powi(self.t);
        params
            .iter_mut()
            .zip(self.m.iter().zip(self.v.iter()))
            .for_each(|(p, (m, v))| {
                let m_hat = m / m_corr;
                let v_hat = v / v_corr;
                *p -= learning_rate * m_hat / (v_hat.sqrt() + eps);
            });
    }
}

/// Gradient descent with optional heavy-ball momentum
#[derive(Clone, Debug, PartialEq)]
pub struct Sgd {
    learning_rate: f64,
    momentum: f64,
    velocity: DVector<f64>,
}

impl Sgd {
    pub fn new(learning_rate: f64, momentum: f64) -> Result<Self> {
        check_learning_rate(learning_rate)?;
        if !(0.0..1.0).contains(&momentum) {
            return Err(GpError::invalid_parameter("momentum", momentum));
        }
        Ok(Self {
            learning_rate,
            momentum,
            velocity: DVector::zeros(0),
        })
    }

    #[must_use]
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    #[must_use]
    pub fn momentum(&self) -> f64 {
        self.momentum
    }
}

impl GradientOptimizer for Sgd {
    fn zero_grad(&mut self) {
        self.velocity = DVector::zeros(0);
    }

    fn step(&mut self, params: &mut DVector<f64>, grad: &DVector<f64>) {
        if self.velocity.len() != grad.len() {
            self.velocity = DVector::zeros(grad.len());
        }
        self.velocity = &self.velocity * self.momentum + grad;
        params.axpy(-self.learning_rate, &self.velocity, 1.0);
    }
}
