//! Type-II maximum likelihood fitting of GP hyper-parameters
//!
//! The loss is the negative log marginal likelihood of the training
//! targets. Gradient methods step every free parameter of the model in its
//! unconstrained space; L-BFGS hands the same objective to `argmin`.

use std::sync::{Arc, Mutex};

use argmin::core::observers::{Observe, ObserverMode};
use argmin::core::{
    CostFunction, Error as ArgminError, Executor, Gradient, State, KV,
};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use log::{debug, error, info, warn};
use nalgebra::DVector;

#[cfg(feature = "serde1")]
use serde::{Deserialize, Serialize};

use crate::error::{DivergedTraining, GpError, Result};
use crate::kernel::Kernel;
use crate::mean::Mean;
use crate::model::{ExactGp, Mode};
use crate::optim::{Adam, GradientOptimizer, Sgd};
use crate::transform::FeatureMap;

/// Which optimizer drives training
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub enum OptimizerKind {
    Adam { learning_rate: f64 },
    Sgd { learning_rate: f64, momentum: f64 },
    /// Limited memory BFGS with a Moré-Thuente line search
    Lbfgs { memory: usize },
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::Adam { learning_rate: 0.1 }
    }
}

/// What to do when the loss or its gradient stops being finite
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub enum DivergencePolicy {
    /// Restore the last valid parameters and return
    /// [`GpError::DivergedTraining`]
    #[default]
    Fail,
    /// Restore the last valid parameters and return the report so far
    Stop,
}

/// Settings for a [`Trainer`]
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct TrainingConfig {
    optimizer: OptimizerKind,
    iterations: usize,
    on_divergence: DivergencePolicy,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerKind::default(),
            iterations: 50,
            on_divergence: DivergencePolicy::default(),
        }
    }
}

impl TrainingConfig {
    #[must_use]
    pub fn with_optimizer(self, optimizer: OptimizerKind) -> Self {
        Self { optimizer, ..self }
    }

    #[must_use]
    pub fn with_iterations(self, iterations: usize) -> Self {
        Self { iterations, ..self }
    }

    #[must_use]
    pub fn with_divergence_policy(self, on_divergence: DivergencePolicy) -> Self {
        Self {
            on_divergence,
            ..self
        }
    }

    #[must_use]
    pub fn optimizer(&self) -> OptimizerKind {
        self.optimizer
    }

    #[must_use]
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    #[must_use]
    pub fn divergence_policy(&self) -> DivergencePolicy {
        self.on_divergence
    }
}

/// Loss and hyper-parameters observed at one training iteration
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct IterationRecord {
    pub iteration: usize,
    /// Negative log marginal likelihood
    pub loss: f64,
    /// Kernel, mean and noise parameters in natural scale
    pub hyperparameters: Vec<(String, f64)>,
}

/// Why a training run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub enum StopReason {
    /// The iteration budget was used up (or the solver converged)
    Completed,
    /// The stop callback asked to stop
    Requested,
    /// The loss diverged under [`DivergencePolicy::Stop`]
    Diverged,
}

/// History of a training run
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde1", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde1", serde(rename_all = "snake_case"))]
pub struct TrainingReport {
    pub records: Vec<IterationRecord>,
    pub stop_reason: StopReason,
}

impl TrainingReport {
    fn new() -> Self {
        Self {
            records: Vec::new(),
            stop_reason: StopReason::Completed,
        }
    }

    /// Loss before the first step
    #[must_use]
    pub fn initial_loss(&self) -> Option<f64> {
        self.records.first().map(|r| r.loss)
    }

    /// Loss of the last recorded iteration
    #[must_use]
    pub fn final_loss(&self) -> Option<f64> {
        self.records.last().map(|r| r.loss)
    }

    #[must_use]
    pub fn n_iterations(&self) -> usize {
        self.records.len()
    }
}

type StopCondition<'a> = Box<dyn FnMut(&IterationRecord) -> bool + 'a>;

/// Fits the hyper-parameters of an [`ExactGp`]
pub struct Trainer<'a> {
    config: TrainingConfig,
    should_stop: Option<StopCondition<'a>>,
}

impl<'a> Trainer<'a> {
    #[must_use]
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            should_stop: None,
        }
    }

    /// Checked after every recorded iteration; returning `true` ends the run
    #[must_use]
    pub fn with_stop_condition<S>(self, should_stop: S) -> Self
    where
        S: FnMut(&IterationRecord) -> bool + 'a,
    {
        Self {
            should_stop: Some(Box::new(should_stop)),
            ..self
        }
    }

    #[must_use]
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Run the configured optimizer on `gp`, which must be in training mode.
    ///
    /// On success `gp` holds the fitted parameters. On failure it holds the
    /// last parameters that produced a finite loss.
    pub fn fit<K, M, F>(&mut self, gp: &mut ExactGp<K, M, F>) -> Result<TrainingReport>
    where
        K: Kernel,
        M: Mean,
        F: FeatureMap,
    {
        if gp.mode() != Mode::Training {
            return Err(GpError::ModeMismatch {
                expected: Mode::Training,
                actual: gp.mode(),
            });
        }
        info!(
            "Fitting {} parameters with {:?} for {} iterations",
            gp.n_parameters(),
            self.config.optimizer,
            self.config.iterations
        );

        let report = match self.config.optimizer {
            OptimizerKind::Adam { learning_rate } => {
                let mut adam = Adam::with_learning_rate(learning_rate)?;
                self.descend(gp, &mut adam)
            }
            OptimizerKind::Sgd {
                learning_rate,
                momentum,
            } => {
                let mut sgd = Sgd::new(learning_rate, momentum)?;
                self.descend(gp, &mut sgd)
            }
            OptimizerKind::Lbfgs { memory } => self.lbfgs(gp, memory),
        }?;

        info!(
            "Finished training after {} iterations ({:?}): loss {:?} -> {:?}",
            report.n_iterations(),
            report.stop_reason,
            report.initial_loss(),
            report.final_loss()
        );
        Ok(report)
    }

    fn stop_requested(&mut self, record: &IterationRecord) -> bool {
        self.should_stop
            .as_mut()
            .map_or(false, |should_stop| should_stop(record))
    }

    fn descend<K, M, F, O>(
        &mut self,
        gp: &mut ExactGp<K, M, F>,
        optimizer: &mut O,
    ) -> Result<TrainingReport>
    where
        K: Kernel,
        M: Mean,
        F: FeatureMap,
        O: GradientOptimizer,
    {
        let mut report = TrainingReport::new();
        let mut theta = gp.parameters();
        let mut last_valid = theta.clone();
        optimizer.zero_grad();

        for iteration in 0..self.config.iterations {
            // prior at the training inputs, its loss and gradient in one go
            let (ln_m, grad) = match gp.ln_m() {
                Ok(res) => res,
                Err(err) => {
                    error!("Training failed at iteration {iteration}: {err}");
                    gp.set_parameters(last_valid.as_slice())?;
                    return Err(err);
                }
            };
            let loss = -ln_m;

            if !loss.is_finite() || grad.iter().any(|g| !g.is_finite()) {
                return self.diverged(gp, iteration, loss, last_valid, report);
            }

            let record = IterationRecord {
                iteration,
                loss,
                hyperparameters: gp.named_parameters(),
            };
            debug!(
                "iter {iteration}: loss = {loss:.6}, {}",
                format_hyperparameters(&record.hyperparameters)
            );
            last_valid = theta.clone();
            let stop = self.stop_requested(&record);
            report.records.push(record);
            if stop {
                report.stop_reason = StopReason::Requested;
                return Ok(report);
            }

            // gradient of the loss is the negated gradient of ln_m
            optimizer.step(&mut theta, &(-grad));
            if let Err(err) = gp.set_parameters(theta.as_slice()) {
                warn!("Step {iteration} left the parameter domain: {err}");
                return self.diverged(gp, iteration + 1, f64::NAN, last_valid, report);
            }
        }
        Ok(report)
    }

    fn diverged<K, M, F>(
        &self,
        gp: &mut ExactGp<K, M, F>,
        iteration: usize,
        loss: f64,
        last_valid: DVector<f64>,
        mut report: TrainingReport,
    ) -> Result<TrainingReport>
    where
        K: Kernel,
        M: Mean,
        F: FeatureMap,
    {
        error!(
            "Training diverged at iteration {iteration} (loss = {loss}); \
             restoring the last valid parameters"
        );
        gp.set_parameters(last_valid.as_slice())?;
        match self.config.on_divergence {
            DivergencePolicy::Stop => {
                report.stop_reason = StopReason::Diverged;
                Ok(report)
            }
            DivergencePolicy::Fail => {
                report.stop_reason = StopReason::Diverged;
                Err(GpError::DivergedTraining(Box::new(DivergedTraining {
                    iteration,
                    loss,
                    last_valid_parameters: last_valid,
                    report,
                })))
            }
        }
    }

    fn lbfgs<K, M, F>(
        &mut self,
        gp: &mut ExactGp<K, M, F>,
        memory: usize,
    ) -> Result<TrainingReport>
    where
        K: Kernel,
        M: Mean,
        F: FeatureMap,
    {
        if memory == 0 {
            return Err(GpError::invalid_parameter("memory", 0.0));
        }
        let mut report = TrainingReport::new();
        let init = gp.parameters();
        let (ln_m, _) = gp.ln_m()?;
        let initial = IterationRecord {
            iteration: 0,
            loss: -ln_m,
            hyperparameters: gp.named_parameters(),
        };
        let stop = self.stop_requested(&initial);
        report.records.push(initial);
        if stop || self.config.iterations == 0 {
            if stop {
                report.stop_reason = StopReason::Requested;
            }
            return Ok(report);
        }

        let history = Arc::new(Mutex::new(Vec::new()));
        let observer = HistoryObserver {
            history: Arc::clone(&history),
        };
        let linesearch: MoreThuenteLineSearch<DVector<f64>, DVector<f64>, f64> =
            MoreThuenteLineSearch::new();
        let solver: LBFGS<_, DVector<f64>, DVector<f64>, f64> =
            LBFGS::new(linesearch, memory);

        let best = Executor::new(NegLnM { gp: &*gp }, solver)
            .configure(|state| state.param(init).max_iters(self.config.iterations as u64))
            .add_observer(observer, ObserverMode::Always)
            .run()
            .map_err(from_argmin)?
            .state()
            .get_best_param()
            .cloned()
            .ok_or_else(|| {
                GpError::Optimizer("solver returned no parameters".to_string())
            })?;

        let history = history
            .lock()
            .map_err(|_| GpError::Optimizer("history lock poisoned".to_string()))?
            .clone();
        for (loss, theta) in history {
            let hyperparameters =
                gp.with_parameters(theta.as_slice())?.named_parameters();
            let record = IterationRecord {
                iteration: report.records.len(),
                loss,
                hyperparameters,
            };
            debug!(
                "iter {}: loss = {:.6}, {}",
                record.iteration,
                loss,
                format_hyperparameters(&record.hyperparameters)
            );
            let stop = self.stop_requested(&record);
            report.records.push(record);
            if stop {
                report.stop_reason = StopReason::Requested;
                break;
            }
        }

        gp.set_parameters(best.as_slice())?;
        Ok(report)
    }
}

fn format_hyperparameters(params: &[(String, f64)]) -> String {
    params
        .iter()
        .map(|(name, value)| format!("{name} = {value:.4}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn from_argmin(err: ArgminError) -> GpError {
    err.downcast::<GpError>()
        .unwrap_or_else(|err| GpError::Optimizer(err.to_string()))
}

/// Negative log marginal likelihood as an argmin problem
struct NegLnM<'a, K, M, F> {
    gp: &'a ExactGp<K, M, F>,
}

impl<'a, K, M, F> CostFunction for NegLnM<'a, K, M, F>
where
    K: Kernel,
    M: Mean,
    F: FeatureMap,
{
    type Param = DVector<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> std::result::Result<f64, ArgminError> {
        let (ln_m, _) = self.gp.ln_m_with_parameters(param.as_slice())?;
        Ok(-ln_m)
    }
}

impl<'a, K, M, F> Gradient for NegLnM<'a, K, M, F>
where
    K: Kernel,
    M: Mean,
    F: FeatureMap,
{
    type Param = DVector<f64>;
    type Gradient = DVector<f64>;

    fn gradient(
        &self,
        param: &Self::Param,
    ) -> std::result::Result<DVector<f64>, ArgminError> {
        let (_, grad) = self.gp.ln_m_with_parameters(param.as_slice())?;
        Ok(-grad)
    }
}

/// Collects the cost and parameters after every solver iteration
struct HistoryObserver {
    history: Arc<Mutex<Vec<(f64, DVector<f64>)>>>,
}

impl<I> Observe<I> for HistoryObserver
where
    I: State<Param = DVector<f64>, Float = f64>,
{
    fn observe_iter(
        &mut self,
        state: &I,
        _kv: &KV,
    ) -> std::result::Result<(), ArgminError> {
        if let Some(param) = state.get_param() {
            self.history
                .lock()
                .map_err(|_| ArgminError::msg("history lock poisoned"))?
                .push((state.get_cost(), param.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelExpr;
    use crate::mean::ConstantMean;
    use crate::model::ExactGpParams;
    use crate::noise_model::NoiseModel;
    use nalgebra::DMatrix;

    fn sin_gp() -> ExactGp<KernelExpr> {
        let x = DMatrix::from_fn(11, 1, |i, _| i as f64 / 10.0);
        // deterministic jitter keeps the optimal noise away from zero
        let y = DVector::from_fn(11, |i, _| {
            let wiggle = ((i * 7919) % 13) as f64 / 13.0 - 0.5;
            (2.0 * std::f64::consts::PI * x[i]).sin() + 0.2 * wiggle
        });
        let kernel = KernelExpr::scaled_rbf(1.0, 1.0).expect("valid");
        let params = ExactGpParams::default()
            .with_noise_model(NoiseModel::uniform(0.5).expect("valid"));
        ExactGp::new(x, y, kernel, ConstantMean::default(), params)
            .expect("valid")
    }

    #[test]
    fn adam_lowers_the_loss() -> Result<()> {
        let mut gp = sin_gp();
        let config = TrainingConfig::default().with_iterations(30);
        let report = Trainer::new(config).fit(&mut gp)?;
        assert_eq!(report.n_iterations(), 30);
        assert_eq!(report.stop_reason, StopReason::Completed);
        assert!(report.final_loss() < report.initial_loss());
        Ok(())
    }

    #[test]
    fn records_carry_named_hyperparameters() -> Result<()> {
        let mut gp = sin_gp();
        let config = TrainingConfig::default().with_iterations(2);
        let report = Trainer::new(config).fit(&mut gp)?;
        let names: Vec<&str> = report.records[0]
            .hyperparameters
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["0.outputscale", "1.length_scale", "mean.constant", "noise"]
        );
        assert::close(report.records[0].hyperparameters[3].1, 0.5, 1E-12);
        Ok(())
    }

    #[test]
    fn recorded_loss_is_that_of_the_training_prior() -> Result<()> {
        let start = sin_gp();
        let prior = start
            .forward(start.x_train())?
            .with_added_diagonal(&DVector::from_element(11, 0.5))?;
        let expected = -prior.log_prob(start.y_train())?;

        let mut gp = sin_gp();
        let report = Trainer::new(TrainingConfig::default().with_iterations(3))
            .fit(&mut gp)?;
        assert::close(report.records[0].loss, expected, 1E-10);
        Ok(())
    }

    #[test]
    fn fit_requires_training_mode() {
        let mut gp = sin_gp();
        gp.eval();
        let res = Trainer::new(TrainingConfig::default()).fit(&mut gp);
        assert_eq!(
            res.err(),
            Some(GpError::ModeMismatch {
                expected: Mode::Training,
                actual: Mode::Evaluation,
            })
        );
    }

    #[test]
    fn stop_condition_ends_the_run() -> Result<()> {
        let mut gp = sin_gp();
        let config = TrainingConfig::default().with_iterations(100);
        let report = Trainer::new(config)
            .with_stop_condition(|record| record.iteration == 4)
            .fit(&mut gp)?;
        assert_eq!(report.n_iterations(), 5);
        assert_eq!(report.stop_reason, StopReason::Requested);
        Ok(())
    }

    #[test]
    fn huge_learning_rate_diverges_and_restores() {
        let mut gp = sin_gp();
        let config = TrainingConfig::default()
            .with_optimizer(OptimizerKind::Sgd {
                learning_rate: 1E8,
                momentum: 0.0,
            })
            .with_iterations(20);
        let err = Trainer::new(config).fit(&mut gp).unwrap_err();
        let GpError::DivergedTraining(diverged) = err else {
            panic!("expected divergence, got {err:?}");
        };
        assert!(gp
            .parameters()
            .relative_eq(&diverged.last_valid_parameters, 1E-12, 1E-12));
        assert!(gp.ln_m().expect("valid").0.is_finite());
        assert_eq!(diverged.report.stop_reason, StopReason::Diverged);
    }

    #[test]
    fn stop_policy_keeps_the_report() -> Result<()> {
        let mut gp = sin_gp();
        let config = TrainingConfig::default()
            .with_optimizer(OptimizerKind::Sgd {
                learning_rate: 1E8,
                momentum: 0.0,
            })
            .with_iterations(20)
            .with_divergence_policy(DivergencePolicy::Stop);
        let report = Trainer::new(config).fit(&mut gp)?;
        assert_eq!(report.stop_reason, StopReason::Diverged);
        assert!(report.n_iterations() < 20);
        Ok(())
    }

    #[test]
    fn lbfgs_lowers_the_loss() -> Result<()> {
        let mut gp = sin_gp();
        let (before, _) = gp.ln_m()?;
        let config = TrainingConfig::default()
            .with_optimizer(OptimizerKind::Lbfgs { memory: 5 })
            .with_iterations(20);
        let report = Trainer::new(config).fit(&mut gp)?;
        let (after, _) = gp.ln_m()?;
        assert!(after > before);
        assert::close(report.initial_loss().expect("recorded"), -before, 1E-12);
        Ok(())
    }

    #[test]
    fn invalid_learning_rate_is_rejected_before_training() {
        let mut gp = sin_gp();
        let theta = gp.parameters();
        let config = TrainingConfig::default()
            .with_optimizer(OptimizerKind::Adam { learning_rate: -1.0 });
        assert!(Trainer::new(config).fit(&mut gp).is_err());
        assert_eq!(gp.parameters(), theta);
    }
}
