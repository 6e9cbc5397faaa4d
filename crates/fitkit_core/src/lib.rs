//! The `fitkit_core` crate is the engine behind Fitkit's function-builder panels.
//! It keeps a registry of named expressions consistent while they are edited, and fits
//! parameters of those expressions to measured data.
//!
//! Key components:
//! - **Registry**: named parameters and functions, reference analysis, circularity flags,
//!   and an evaluation plan that is recomputed on every edit.
//! - **Edit Log**: reversible edit commands with linear undo/redo.
//! - **Equation Engine**: a bytecode VM for the expressions, generic over `Scalar`.
//! - **Fit**: closed-form polynomial fits and a Newton / Levenberg-Marquardt pipeline for
//!   user functions, guarded against regressions.
//! - **Autodiff**: dual numbers for exact parameter derivatives.
pub mod autodiff;
pub mod edit_log;
pub mod editor;
pub mod entity;
pub mod equation_engine;
pub mod error;
pub mod evaluation;
pub mod fit;
pub mod naming;
pub mod ordering;
pub mod references;
pub mod registry;
pub mod traits;
