use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars by the evaluator and the fit engine.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Lifts an `f64` constant into any scalar type. Conversion never fails for the
/// scalar types used in this crate; NaN is returned if it ever does.
pub fn lift<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap_or_else(T::nan)
}

/// A model `y = f(x; p)` with a fixed number of adjustable parameters.
///
/// Implemented for both `f64` and `Dual` so the minimizers can differentiate the
/// model with respect to its parameters.
pub trait ParametricModel<T: Scalar> {
    /// Number of adjustable parameters.
    fn parameter_count(&self) -> usize;

    /// Evaluates the model at `x` using `params` instead of the stored parameters.
    fn apply(&self, x: T, params: &[T]) -> T;
}
