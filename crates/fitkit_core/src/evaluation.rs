use crate::entity::EntityId;
use crate::equation_engine::VM;
use crate::registry::Registry;
use tracing::debug;

/// What one [`Registry::evaluate`] pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationReport {
    /// Entities that received a new value, in plan order.
    pub evaluated: Vec<EntityId>,
    /// Planned entities whose expression does not compile; they keep their last value.
    pub invalid: Vec<EntityId>,
    /// Circular or errored entities left out of the plan.
    pub skipped: Vec<EntityId>,
}

impl Registry {
    /// Evaluates the plan with the given independent-variable values, in the order of
    /// [`crate::registry::RegistrySettings::variables`]. Missing variables read as NaN.
    ///
    /// Each entity sees the values of the entities planned before it. An invalid entity
    /// still exposes its last value to its dependents.
    pub fn evaluate(&mut self, variable_values: &[f64]) -> EvaluationReport {
        let mut vars = variable_values.to_vec();
        vars.resize(self.settings.variables.len(), f64::NAN);

        let mut report = EvaluationReport::default();
        let mut bound: Vec<f64> = Vec::with_capacity(self.evaluation_plan().len());
        let mut stack = Vec::new();

        for (id, compiled) in self.compile_plan() {
            let value = match compiled {
                Ok(code) => {
                    let value = VM::execute(&code, &vars, &bound, &mut stack);
                    if let Some(slot) = self.slots.iter_mut().find(|s| s.id == id) {
                        slot.value = Some(value);
                    }
                    report.evaluated.push(id);
                    value
                }
                Err(_) => {
                    report.invalid.push(id);
                    self.value(id).unwrap_or(f64::NAN)
                }
            };
            bound.push(value);
        }

        let plan = self.evaluation_plan();
        report.skipped = self.ids().filter(|id| !plan.contains(id)).collect();

        debug!(
            evaluated = report.evaluated.len(),
            invalid = report.invalid.len(),
            skipped = report.skipped.len(),
            "registry evaluated"
        );
        report
    }

    /// Last-known values in row order.
    pub fn values(&self) -> Vec<(&str, Option<f64>)> {
        self.slots
            .iter()
            .map(|s| (s.entity.name(), s.value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityStatus};
    use crate::naming::NamingPolicy;
    use crate::registry::RegistrySettings;

    fn with_x() -> Registry {
        Registry::new(
            NamingPolicy::default(),
            RegistrySettings {
                variables: vec!["x".into()],
                ..RegistrySettings::default()
            },
        )
    }

    #[test]
    fn values_follow_the_plan() {
        let mut registry = with_x();
        let f = registry.add(Entity::function("f", "k * x + c"), None).unwrap();
        let k = registry.add(Entity::parameter("k", "2 * c"), None).unwrap();
        let c = registry.add(Entity::parameter("c", "1.5"), None).unwrap();

        let report = registry.evaluate(&[4.0]);
        assert_eq!(report.evaluated, vec![c, k, f]);
        assert_eq!(registry.value(c), Some(1.5));
        assert_eq!(registry.value(k), Some(3.0));
        assert_eq!(registry.value(f), Some(13.5));
        assert_eq!(
            registry.values(),
            vec![("f", Some(13.5)), ("k", Some(3.0)), ("c", Some(1.5))]
        );
    }

    #[test]
    fn circular_entities_keep_their_last_value() {
        let mut registry = Registry::default();
        let a = registry.add(Entity::parameter("a", "2"), None).unwrap();
        let b = registry.add(Entity::parameter("b", "a + 1"), None).unwrap();
        registry.evaluate(&[]);
        assert_eq!(registry.value(b), Some(3.0));

        registry.propose_expression(a, "b * 2").unwrap();
        let report = registry.evaluate(&[]);
        assert!(report.evaluated.is_empty());
        assert_eq!(report.skipped, vec![a, b]);
        assert_eq!(registry.status(a), Some(&EntityStatus::Circular));
        assert_eq!(registry.value(a), Some(2.0));
        assert_eq!(registry.value(b), Some(3.0));
    }

    #[test]
    fn invalid_entity_keeps_value_and_still_feeds_dependents() {
        let mut registry = Registry::default();
        let a = registry.add(Entity::parameter("a", "2"), None).unwrap();
        let b = registry.add(Entity::parameter("b", "a * 10"), None).unwrap();
        registry.evaluate(&[]);

        registry.propose_expression(a, "2 +").unwrap();
        let report = registry.evaluate(&[]);
        assert_eq!(report.invalid, vec![a]);
        assert_eq!(report.evaluated, vec![b]);
        assert_eq!(registry.value(a), Some(2.0));
        assert_eq!(registry.value(b), Some(20.0));
    }

    #[test]
    fn non_finite_results_are_values() {
        let mut registry = with_x();
        let r = registry.add(Entity::function("r", "1 / x"), None).unwrap();
        let s = registry.add(Entity::function("s", "r - r"), None).unwrap();
        let report = registry.evaluate(&[0.0]);
        assert!(report.invalid.is_empty());
        assert_eq!(registry.value(r), Some(f64::INFINITY));
        assert!(registry.value(s).is_some_and(f64::is_nan));
        assert_eq!(registry.status(r), Some(&EntityStatus::Ok));

        // Missing variables read as NaN.
        registry.evaluate(&[]);
        assert!(registry.value(r).is_some_and(f64::is_nan));
    }
}
