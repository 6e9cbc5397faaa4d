//! Least-squares curve fitting.
//!
//! Polynomials are solved in closed form, and that solution is committed as is: it is the
//! least-squares minimum, so comparing it against the starting deviation would only
//! compare rounding. User functions go through a Newton stage and, if that made the fit
//! worse, a Levenberg-Marquardt stage started from the same parameters. Their parameters
//! are only replaced by a vector whose deviation is no worse than the one they started
//! with.

mod function;
mod minimize;
mod polynomial;

pub use function::{FitModel, UserFunction};
pub use minimize::{LevenbergMarquardtSettings, MinimizerSettings};
pub use polynomial::{PolynomialFunction, MAX_DEGREE};

use anyhow::{anyhow, bail, Result};
use minimize::sum_of_squares;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FitSettings {
    pub minimizer: MinimizerSettings,
    pub levenberg_marquardt: LevenbergMarquardtSettings,
}

impl FitSettings {
    fn validate(&self) -> Result<()> {
        if self.minimizer.max_iterations == 0 {
            bail!("max_iterations must be greater than zero.");
        }
        if self.minimizer.tolerance.is_nan() || self.minimizer.tolerance <= 0.0 {
            bail!("tolerance must be positive.");
        }
        let lm = &self.levenberg_marquardt;
        if lm.initial_lambda.is_nan() || lm.initial_lambda <= 0.0 {
            bail!("initial_lambda must be positive.");
        }
        if lm.lambda_factor.is_nan() || lm.lambda_factor <= 1.0 {
            bail!("lambda_factor must be greater than one.");
        }
        if lm.max_lambda.is_nan() || lm.max_lambda < lm.initial_lambda {
            bail!("max_lambda must not be below initial_lambda.");
        }
        Ok(())
    }
}

/// Cooperative cancellation for a running fit, checked between minimizer iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitOutcome {
    /// No optimization was requested; the deviation of the current parameters is reported.
    Reported,
    /// The model now holds improved (or equally good) parameters.
    Committed,
    /// Every stage made the fit worse; the prior parameters were kept and autofit is off.
    Reverted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStage {
    ClosedForm,
    Newton,
    LevenbergMarquardt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    /// The model's parameters after the fit.
    pub parameters: Vec<f64>,
    pub rms_deviation: f64,
    pub prior_rms_deviation: f64,
    pub outcome: FitOutcome,
    /// Whether the caller should keep fitting automatically; cleared on revert.
    pub autofit: bool,
    pub valid_points: usize,
    /// The stage whose parameters were committed.
    pub stage: Option<FitStage>,
}

impl FitReport {
    pub fn improved(&self) -> bool {
        self.outcome == FitOutcome::Committed
    }
}

/// The points where both coordinates are finite.
#[derive(Debug, Clone, Default)]
pub(crate) struct Sample {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl Sample {
    pub(crate) fn new(xs: &[f64], ys: &[f64]) -> Result<Self> {
        if xs.len() != ys.len() {
            bail!(
                "Sample length mismatch: {} x values, {} y values.",
                xs.len(),
                ys.len()
            );
        }
        let (xs, ys) = xs
            .iter()
            .zip(ys)
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .map(|(&x, &y)| (x, y))
            .unzip();
        Ok(Self { xs, ys })
    }

    pub(crate) fn len(&self) -> usize {
        self.xs.len()
    }

    pub(crate) fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.xs.iter().copied().zip(self.ys.iter().copied())
    }
}

fn rms(sum_of_squares: f64, points: usize) -> f64 {
    if points == 0 {
        f64::NAN
    } else {
        (sum_of_squares / points as f64).sqrt()
    }
}

/// NaN is always worse; anything is better than a NaN prior.
fn is_worse(deviation: f64, prior: f64) -> bool {
    deviation.is_nan() || (!prior.is_nan() && deviation > prior)
}

/// One fit invocation over a model and a data sample.
pub struct FitSession<'a> {
    model: &'a mut FitModel,
    sample: Sample,
    settings: FitSettings,
    cancel: Option<CancelToken>,
}

impl<'a> FitSession<'a> {
    /// Pairs `xs` with `ys`, dropping rows where either is NaN or infinite.
    pub fn new(model: &'a mut FitModel, xs: &[f64], ys: &[f64]) -> Result<Self> {
        Ok(Self {
            model,
            sample: Sample::new(xs, ys)?,
            settings: FitSettings::default(),
            cancel: None,
        })
    }

    pub fn with_settings(mut self, settings: FitSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn valid_points(&self) -> usize {
        self.sample.len()
    }

    /// Reports the current deviation and, with `autofit`, tries to improve it.
    pub fn run(self, autofit: bool) -> Result<FitReport> {
        self.settings.validate()?;

        let prior_parameters = self.model.parameters().to_vec();
        let points = self.sample.len();
        let prior = sum_of_squares(&*self.model, &self.sample, &prior_parameters);
        let mut report = FitReport {
            parameters: prior_parameters.clone(),
            rms_deviation: rms(prior, points),
            prior_rms_deviation: rms(prior, points),
            outcome: FitOutcome::Reported,
            autofit,
            valid_points: points,
            stage: None,
        };
        debug!(
            points,
            parameters = prior_parameters.len(),
            prior_rms = report.prior_rms_deviation,
            autofit,
            "fit started"
        );

        if !autofit || prior_parameters.is_empty() || points == 0 {
            return Ok(report);
        }

        let stages: &[FitStage] = match &*self.model {
            FitModel::Polynomial(_) => &[FitStage::ClosedForm],
            FitModel::User(_) => &[FitStage::Newton, FitStage::LevenbergMarquardt],
        };
        for &stage in stages {
            let Some((parameters, deviation)) = self.run_stage(stage, &prior_parameters) else {
                continue;
            };
            let regressed = match stage {
                FitStage::ClosedForm => deviation.is_nan(),
                FitStage::Newton | FitStage::LevenbergMarquardt => is_worse(deviation, prior),
            };
            if regressed {
                debug!(?stage, deviation, prior, "stage made the fit worse");
                continue;
            }
            self.model.set_parameters(&parameters);
            report.parameters = parameters;
            report.rms_deviation = rms(deviation, points);
            report.outcome = FitOutcome::Committed;
            report.stage = Some(stage);
            debug!(?stage, rms = report.rms_deviation, "fit committed");
            return Ok(report);
        }

        warn!(
            prior_rms = report.prior_rms_deviation,
            "fit did not improve; parameters restored and autofit disabled"
        );
        report.outcome = FitOutcome::Reverted;
        report.autofit = false;
        Ok(report)
    }

    /// Runs one stage from `start`. A stage that fails numerically yields `None`.
    fn run_stage(&self, stage: FitStage, start: &[f64]) -> Option<(Vec<f64>, f64)> {
        let model: &FitModel = &*self.model;
        let cancel = self.cancel.as_ref();
        let mut parameters = start.to_vec();
        let result = match stage {
            FitStage::ClosedForm => match model {
                FitModel::Polynomial(p) => {
                    PolynomialFunction::least_squares(p.degree(), &self.sample.xs, &self.sample.ys)
                        .map(|coefficients| {
                            parameters = coefficients;
                            1
                        })
                }
                FitModel::User(_) => Err(anyhow!("Closed-form solve needs a polynomial.")),
            },
            FitStage::Newton => minimize::newton(
                model,
                &self.sample,
                &mut parameters,
                &self.settings.minimizer,
                cancel,
            ),
            FitStage::LevenbergMarquardt => minimize::levenberg_marquardt(
                model,
                &self.sample,
                &mut parameters,
                &self.settings.minimizer,
                &self.settings.levenberg_marquardt,
                cancel,
            ),
        };

        match result {
            Ok(iterations) => {
                let deviation = sum_of_squares(model, &self.sample, &parameters);
                debug!(?stage, iterations, deviation, "stage finished");
                Some((parameters, deviation))
            }
            Err(err) => {
                warn!(?stage, error = %err, "minimizer stage failed");
                None
            }
        }
    }
}

/// Fits `model` to the sample. See [`FitSession::run`].
pub fn fit(
    model: &mut FitModel,
    xs: &[f64],
    ys: &[f64],
    autofit: bool,
    settings: &FitSettings,
) -> Result<FitReport> {
    FitSession::new(model, xs, ys)?
        .with_settings(*settings)
        .run(autofit)
}
