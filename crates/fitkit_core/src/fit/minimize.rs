use super::{CancelToken, Sample};
use crate::autodiff::Dual;
use crate::traits::ParametricModel;
use anyhow::{anyhow, bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinimizerSettings {
    pub max_iterations: usize,
    /// Stop once the parameter step is shorter than this.
    pub tolerance: f64,
}

impl Default for MinimizerSettings {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevenbergMarquardtSettings {
    pub initial_lambda: f64,
    /// Damping is divided by this after an accepted step and multiplied after a rejected one.
    pub lambda_factor: f64,
    /// The stage ends once damping grows past this.
    pub max_lambda: f64,
}

impl Default for LevenbergMarquardtSettings {
    fn default() -> Self {
        Self {
            initial_lambda: 1e-3,
            lambda_factor: 10.0,
            max_lambda: 1e10,
        }
    }
}

/// `Σ (f(x_i; p) − y_i)²` over the valid points.
pub(crate) fn sum_of_squares<M>(model: &M, sample: &Sample, params: &[f64]) -> f64
where
    M: ParametricModel<f64> + ?Sized,
{
    sample
        .points()
        .map(|(x, y)| {
            let r = model.apply(x, params) - y;
            r * r
        })
        .sum()
}

/// Residuals and their Jacobian with respect to the parameters (one row per point).
fn linearize<M>(model: &M, sample: &Sample, params: &[f64]) -> (DVector<f64>, DMatrix<f64>)
where
    M: ParametricModel<Dual> + ?Sized,
{
    let mut residuals = DVector::zeros(sample.len());
    let mut jacobian = DMatrix::zeros(sample.len(), params.len());
    for j in 0..params.len() {
        let seeded = Dual::seed(params, j);
        for (i, (x, y)) in sample.points().enumerate() {
            let r = model.apply(Dual::constant(x), &seeded) - Dual::constant(y);
            residuals[i] = r.val;
            jacobian[(i, j)] = r.eps;
        }
    }
    (residuals, jacobian)
}

fn gradient<M>(model: &M, sample: &Sample, params: &[f64]) -> DVector<f64>
where
    M: ParametricModel<Dual> + ?Sized,
{
    let (residuals, jacobian) = linearize(model, sample, params);
    jacobian.transpose() * residuals * 2.0
}

/// Central differences of the exact gradient, symmetrized.
fn hessian<M>(model: &M, sample: &Sample, params: &[f64]) -> DMatrix<f64>
where
    M: ParametricModel<Dual> + ?Sized,
{
    let m = params.len();
    let mut hessian = DMatrix::zeros(m, m);
    let mut probe = params.to_vec();
    for j in 0..m {
        let step = 1e-5 * params[j].abs().max(1.0);
        probe[j] = params[j] + step;
        let forward = gradient(model, sample, &probe);
        probe[j] = params[j] - step;
        let backward = gradient(model, sample, &probe);
        probe[j] = params[j];
        hessian.set_column(j, &((forward - backward) / (2.0 * step)));
    }
    (&hessian + hessian.transpose()) * 0.5
}

fn cancelled(cancel: Option<&CancelToken>) -> bool {
    cancel.is_some_and(CancelToken::is_cancelled)
}

/// Newton iteration on the sum of squares: solves `H δ = −∇S` each step.
///
/// Steps are taken unconditionally; the caller decides whether the result is an
/// improvement. Returns the number of iterations run.
pub(crate) fn newton<M>(
    model: &M,
    sample: &Sample,
    params: &mut [f64],
    settings: &MinimizerSettings,
    cancel: Option<&CancelToken>,
) -> Result<usize>
where
    M: ParametricModel<Dual> + ?Sized,
{
    for iteration in 0..settings.max_iterations {
        if cancelled(cancel) {
            debug!(iteration, "newton cancelled");
            return Ok(iteration);
        }

        let g = gradient(model, sample, params);
        let h = hessian(model, sample, params);
        let delta = h
            .lu()
            .solve(&(-&g))
            .ok_or_else(|| anyhow!("Hessian is singular."))?;
        if delta.iter().any(|d| !d.is_finite()) {
            bail!("Newton step is not finite (‖∇S‖ = {}).", g.norm());
        }

        for (p, d) in params.iter_mut().zip(delta.iter()) {
            *p += d;
        }
        let step = delta.norm();
        debug!(iteration, step, "newton iteration");
        if step < settings.tolerance {
            return Ok(iteration + 1);
        }
    }
    Ok(settings.max_iterations)
}

/// Levenberg-Marquardt: solves `(JᵀJ + λ·diag(JᵀJ)) δ = −Jᵀr` and only accepts steps
/// that lower the sum of squares. Returns the number of iterations run.
pub(crate) fn levenberg_marquardt<M>(
    model: &M,
    sample: &Sample,
    params: &mut [f64],
    settings: &MinimizerSettings,
    damping: &LevenbergMarquardtSettings,
    cancel: Option<&CancelToken>,
) -> Result<usize>
where
    M: ParametricModel<f64> + ParametricModel<Dual> + ?Sized,
{
    let mut lambda = damping.initial_lambda;
    let mut current = sum_of_squares(model, sample, params);

    for iteration in 0..settings.max_iterations {
        if cancelled(cancel) {
            debug!(iteration, "levenberg-marquardt cancelled");
            return Ok(iteration);
        }

        let (residuals, jacobian) = linearize(model, sample, params);
        let jt = jacobian.transpose();
        let normal = &jt * &jacobian;
        let rhs = -(&jt * residuals);
        // Marquardt scaling, floored so a parameter the residuals are momentarily
        // insensitive to (a zero Jacobian column) still gets a regular pivot.
        let largest = normal.diagonal().max();
        if largest.is_nan() || largest <= 0.0 {
            bail!("Residuals do not depend on any parameter.");
        }
        let floor = largest * f64::EPSILON.sqrt();

        loop {
            let mut damped = normal.clone();
            for k in 0..damped.nrows() {
                damped[(k, k)] += lambda * normal[(k, k)].max(floor);
            }
            let delta = damped
                .lu()
                .solve(&rhs)
                .ok_or_else(|| anyhow!("Damped normal equations are singular (λ = {lambda})."))?;
            let trial: Vec<f64> = params.iter().zip(delta.iter()).map(|(p, d)| p + d).collect();
            let deviation = sum_of_squares(model, sample, &trial);

            if deviation.is_finite() && deviation < current {
                params.copy_from_slice(&trial);
                current = deviation;
                lambda = (lambda / damping.lambda_factor).max(f64::MIN_POSITIVE);
                let step = delta.norm();
                debug!(iteration, step, lambda, deviation, "levenberg-marquardt step accepted");
                if step < settings.tolerance {
                    return Ok(iteration + 1);
                }
                break;
            }

            lambda *= damping.lambda_factor;
            if lambda > damping.max_lambda {
                debug!(iteration, "levenberg-marquardt damping exhausted");
                return Ok(iteration + 1);
            }
        }
    }
    Ok(settings.max_iterations)
}
