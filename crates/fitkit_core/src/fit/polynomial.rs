use crate::traits::{ParametricModel, Scalar};
use anyhow::{anyhow, bail, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// `c0 + c1·x + … + cn·xⁿ`, coefficients in ascending powers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolynomialFunction {
    pub coefficients: Vec<f64>,
}

/// Highest degree a polynomial fit accepts.
pub const MAX_DEGREE: usize = 32;

fn coefficient_count(degree: usize) -> Result<usize> {
    if degree > MAX_DEGREE {
        bail!("Polynomial degree {degree} exceeds the maximum of {MAX_DEGREE}.");
    }
    Ok(degree + 1)
}

impl PolynomialFunction {
    /// The zero polynomial of the given degree.
    pub fn new(degree: usize) -> Result<Self> {
        Ok(Self {
            coefficients: vec![0.0; coefficient_count(degree)?],
        })
    }

    pub fn from_coefficients(coefficients: Vec<f64>) -> Self {
        Self { coefficients }
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        horner(x, &self.coefficients)
    }

    /// Renders the polynomial in the evaluator's syntax, e.g. `1 - 0.5*x + 2*x^2`.
    pub fn to_expression(&self, variable: &str) -> String {
        let mut out = String::new();
        for (power, &c) in self.coefficients.iter().enumerate() {
            let magnitude = c.abs();
            let term = match power {
                0 => format!("{magnitude}"),
                1 => format!("{magnitude}*{variable}"),
                _ => format!("{magnitude}*{variable}^{power}"),
            };
            if out.is_empty() {
                if c < 0.0 {
                    out.push('-');
                }
            } else {
                out.push_str(if c < 0.0 { " - " } else { " + " });
            }
            out.push_str(&term);
        }
        if out.is_empty() {
            out.push('0');
        }
        out
    }

    /// Least-squares coefficients of a degree-`degree` polynomial through the points.
    ///
    /// Solved through the SVD of the Vandermonde matrix; underdetermined systems get the
    /// minimum-norm solution.
    pub fn least_squares(degree: usize, xs: &[f64], ys: &[f64]) -> Result<Vec<f64>> {
        if xs.len() != ys.len() {
            bail!(
                "Sample length mismatch: {} x values, {} y values.",
                xs.len(),
                ys.len()
            );
        }
        if xs.is_empty() {
            bail!("No points to fit.");
        }

        let columns = coefficient_count(degree)?;
        let vandermonde = DMatrix::from_fn(xs.len(), columns, |i, j| xs[i].powi(j as i32));
        let rhs = DVector::from_column_slice(ys);
        let svd = vandermonde.svd(true, true);
        let cutoff = f64::EPSILON * svd.singular_values.max() * xs.len().max(columns) as f64;
        let solution = svd
            .solve(&rhs, cutoff)
            .map_err(|e| anyhow!("Least-squares solve failed: {e}"))?;

        let coefficients: Vec<f64> = solution.iter().copied().collect();
        if coefficients.iter().any(|c| !c.is_finite()) {
            bail!("Least-squares solution is not finite.");
        }
        Ok(coefficients)
    }
}

fn horner<T: Scalar>(x: T, coefficients: &[T]) -> T {
    coefficients
        .iter()
        .rev()
        .fold(T::zero(), |acc, &c| acc * x + c)
}

impl<T: Scalar> ParametricModel<T> for PolynomialFunction {
    fn parameter_count(&self) -> usize {
        self.coefficients.len()
    }

    fn apply(&self, x: T, params: &[T]) -> T {
        horner(x, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::{compile, VM};

    #[test]
    fn horner_evaluation() {
        let p = PolynomialFunction::from_coefficients(vec![1.0, -0.5, 2.0]);
        assert_eq!(p.degree(), 2);
        assert_eq!(p.evaluate(3.0), 17.5);
        assert_eq!(PolynomialFunction::new(3).unwrap().evaluate(7.0), 0.0);
    }

    #[test]
    fn expression_round_trips_through_the_evaluator() {
        let p = PolynomialFunction::from_coefficients(vec![1.0, -0.5, 2.0]);
        let expression = p.to_expression("x");
        assert_eq!(expression, "1 - 0.5*x + 2*x^2");
        let code = compile(&expression, &["x"], &[]).unwrap();
        assert_eq!(VM::execute(&code, &[3.0], &[], &mut Vec::new()), 17.5);

        let negative = PolynomialFunction::from_coefficients(vec![-3.0, 0.0, -1.0]);
        assert_eq!(negative.to_expression("t"), "-3 + 0*t - 1*t^2");
        assert_eq!(PolynomialFunction::from_coefficients(vec![]).to_expression("x"), "0");
    }

    #[test]
    fn least_squares_recovers_exact_quadratic() {
        let xs = [-2.0, -1.0, 0.0, 1.0, 2.0, 3.0];
        let ys: Vec<f64> = xs.iter().map(|x| 0.5 - 2.0 * x + 3.0 * x * x).collect();
        let c = PolynomialFunction::least_squares(2, &xs, &ys).unwrap();
        assert!((c[0] - 0.5).abs() < 1e-9);
        assert!((c[1] + 2.0).abs() < 1e-9);
        assert!((c[2] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn least_squares_rejects_bad_input() {
        assert!(PolynomialFunction::least_squares(1, &[1.0], &[1.0, 2.0]).is_err());
        assert!(PolynomialFunction::least_squares(1, &[], &[]).is_err());
    }

    #[test]
    fn degree_is_capped() {
        assert_eq!(PolynomialFunction::new(MAX_DEGREE).unwrap().degree(), MAX_DEGREE);
        assert!(PolynomialFunction::new(MAX_DEGREE + 1).is_err());
        assert!(PolynomialFunction::new(usize::MAX).is_err());
        assert!(PolynomialFunction::least_squares(usize::MAX, &[1.0], &[1.0]).is_err());
    }
}
