use super::polynomial::PolynomialFunction;
use crate::entity::{Entity, EntityId, FitKind};
use crate::equation_engine::{Program, ProgramBuilder};
use crate::registry::Registry;
use crate::traits::{ParametricModel, Scalar};
use anyhow::{bail, Context, Result};

/// A user expression `f(x; p)` compiled with its free parameters as inputs.
#[derive(Debug, Clone)]
pub struct UserFunction {
    program: Program,
    parameter_names: Vec<String>,
    values: Vec<f64>,
}

impl UserFunction {
    /// Compiles a stand-alone expression in `variable` and the named parameters.
    pub fn new(
        expression: &str,
        variable: &str,
        parameter_names: &[&str],
        values: &[f64],
    ) -> Result<Self> {
        if parameter_names.len() != values.len() {
            bail!(
                "Parameter count mismatch: {} names, {} values.",
                parameter_names.len(),
                values.len()
            );
        }
        let mut builder = ProgramBuilder::new(&[variable.to_string()]);
        for name in parameter_names {
            builder.input(name);
        }
        builder
            .define("value", expression)
            .with_context(|| format!("Failed to compile fit expression '{expression}'."))?;
        Ok(Self {
            program: builder.build(),
            parameter_names: parameter_names.iter().map(|s| s.to_string()).collect(),
            values: values.to_vec(),
        })
    }

    /// Compiles registry entity `id` together with everything it references.
    ///
    /// `free_parameters` become the fitted inputs, starting from their last evaluated
    /// values. Every other referenced entity is recomputed from them in plan order, so a
    /// fit of `f = b*x` with `b = 2*a` adjusts `a`.
    pub fn from_registry(
        registry: &Registry,
        id: EntityId,
        variable: &str,
        free_parameters: &[&str],
    ) -> Result<Self> {
        let entity = registry
            .entity(id)
            .with_context(|| format!("No entity with id {id:?}."))?;
        let name = entity.name();
        if let Some(status) = registry.status(id).filter(|s| !s.is_ok()) {
            bail!("'{name}' cannot be fitted while its status is {status:?}.");
        }

        let references = registry.references(name);
        let mut values = Vec::with_capacity(free_parameters.len());
        for &free in free_parameters {
            let parameter = registry
                .find(free)
                .with_context(|| format!("Free parameter '{free}' is not in the registry."))?;
            if !references.contains(free) {
                bail!("'{name}' does not depend on '{free}'.");
            }
            values.push(
                registry
                    .value(parameter)
                    .with_context(|| format!("Free parameter '{free}' has not been evaluated."))?,
            );
        }

        let mut builder = ProgramBuilder::new(&[variable.to_string()]);
        for free in free_parameters {
            builder.input(free);
        }
        for &planned in registry.evaluation_plan() {
            let Some(dependency) = registry.entity(planned) else {
                continue;
            };
            let dependency_name = dependency.name();
            if planned == id
                || !references.contains(dependency_name)
                || free_parameters.contains(&dependency_name)
            {
                continue;
            }
            builder
                .define(dependency_name, dependency.expression())
                .with_context(|| format!("Failed to compile '{dependency_name}'."))?;
        }
        builder
            .define(name, entity.expression())
            .with_context(|| format!("Failed to compile '{name}'."))?;

        Ok(Self {
            program: builder.build(),
            parameter_names: free_parameters.iter().map(|s| s.to_string()).collect(),
            values,
        })
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    pub fn parameters(&self) -> &[f64] {
        &self.values
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        self.program.run(&[x], &self.values, &mut Vec::new())
    }
}

impl<T: Scalar> ParametricModel<T> for UserFunction {
    fn parameter_count(&self) -> usize {
        self.values.len()
    }

    fn apply(&self, x: T, params: &[T]) -> T {
        self.program.run(&[x], params, &mut Vec::new())
    }
}

/// Anything the fit engine can adjust.
#[derive(Debug, Clone)]
pub enum FitModel {
    Polynomial(PolynomialFunction),
    User(UserFunction),
}

impl FitModel {
    pub fn parameters(&self) -> &[f64] {
        match self {
            FitModel::Polynomial(p) => &p.coefficients,
            FitModel::User(u) => &u.values,
        }
    }

    pub(crate) fn set_parameters(&mut self, values: &[f64]) {
        match self {
            FitModel::Polynomial(p) => p.coefficients = values.to_vec(),
            FitModel::User(u) => u.values = values.to_vec(),
        }
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        match self {
            FitModel::Polynomial(p) => p.evaluate(x),
            FitModel::User(u) => u.evaluate(x),
        }
    }
}

impl<T: Scalar> ParametricModel<T> for FitModel {
    fn parameter_count(&self) -> usize {
        self.parameters().len()
    }

    fn apply(&self, x: T, params: &[T]) -> T {
        match self {
            FitModel::Polynomial(p) => p.apply(x, params),
            FitModel::User(u) => u.apply(x, params),
        }
    }
}

impl Registry {
    /// The user fit function for entity `id`, adjusting `free`.
    ///
    /// Evaluates the registry first so the free parameters have current values. The
    /// first declared variable is the independent one.
    pub fn fit_function(&mut self, id: EntityId, free: &[&str]) -> Result<UserFunction> {
        let variable = self
            .settings()
            .variables
            .first()
            .cloned()
            .context("The registry declares no independent variable.")?;
        self.evaluate(&[]);
        UserFunction::from_registry(self, id, &variable, free)
    }

    /// The model bound to a fit-function entity.
    pub fn fit_model(&mut self, id: EntityId) -> Result<FitModel> {
        let kind = match self.entity(id) {
            Some(Entity::FitFunction(fit)) => fit.kind.clone(),
            Some(other) => bail!("'{}' is not a fit function.", other.name()),
            None => bail!("No entity with id {id:?}."),
        };
        match kind {
            FitKind::Polynomial { degree } => {
                PolynomialFunction::new(degree).map(FitModel::Polynomial)
            }
            FitKind::User { free_parameters } => {
                let free: Vec<&str> = free_parameters.iter().map(String::as_str).collect();
                self.fit_function(id, &free).map(FitModel::User)
            }
        }
    }
}
