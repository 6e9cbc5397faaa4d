use crate::edit_log::{EditLog, Restored};
use crate::entity::{Entity, EntityId};
use crate::error::EditError;
use crate::evaluation::EvaluationReport;
use crate::fit::FitModel;
use crate::naming::NameResolution;
use crate::registry::Registry;
use parking_lot::Mutex;
use std::sync::Arc;

/// One function-builder panel: a registry plus its undo history.
///
/// Every successful `propose_*` call is recorded in the log; refused edits leave both
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct FunctionEditor {
    registry: Registry,
    log: EditLog,
}

/// An editor shared between threads. All mutation goes through the one lock.
pub type SharedEditor = Arc<Mutex<FunctionEditor>>;

impl FunctionEditor {
    pub fn new(registry: Registry) -> Self {
        Self::with_log(registry, EditLog::new())
    }

    pub fn with_log(registry: Registry, log: EditLog) -> Self {
        Self { registry, log }
    }

    pub fn shared(self) -> SharedEditor {
        Arc::new(Mutex::new(self))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn log(&self) -> &EditLog {
        &self.log
    }

    pub fn propose_add(
        &mut self,
        entity: Entity,
        row: Option<usize>,
        resolution: NameResolution<'_>,
    ) -> Result<EntityId, EditError> {
        let command = self.registry.propose_add(entity, row, resolution)?;
        let id = command.id;
        self.log.record(command);
        Ok(id)
    }

    pub fn propose_remove(&mut self, id: EntityId) -> Result<(), EditError> {
        let command = self.registry.propose_remove(id)?;
        self.log.record(command);
        Ok(())
    }

    /// Returns the name actually given, which may carry a disambiguating suffix.
    pub fn propose_rename(
        &mut self,
        id: EntityId,
        name: &str,
        resolution: NameResolution<'_>,
    ) -> Result<String, EditError> {
        let command = self.registry.propose_rename(id, name, resolution)?;
        self.log.record(command);
        Ok(self
            .registry
            .entity(id)
            .map(|e| e.name().to_string())
            .unwrap_or_default())
    }

    pub fn propose_expression(&mut self, id: EntityId, expression: &str) -> Result<(), EditError> {
        let command = self.registry.propose_expression(id, expression)?;
        self.log.record(command);
        Ok(())
    }

    pub fn undo(&mut self) -> Result<Option<Restored>, EditError> {
        self.log.undo(&mut self.registry)
    }

    pub fn redo(&mut self) -> Result<Option<Restored>, EditError> {
        self.log.redo(&mut self.registry)
    }

    pub fn evaluate(&mut self, variable_values: &[f64]) -> EvaluationReport {
        self.registry.evaluate(variable_values)
    }

    /// Writes fitted parameters back as expression edits, one undoable command each.
    ///
    /// A polynomial replaces the expression of `target`; a user function updates each of
    /// its free parameters. Parameters that already hold the fitted value are skipped.
    /// Returns the number of edits recorded. Every target is checked before the first edit,
    /// so a refused write-back leaves the registry and the log untouched.
    pub fn apply_fit(&mut self, target: EntityId, model: &FitModel) -> Result<usize, EditError> {
        let assignments: Vec<(EntityId, String)> = match model {
            FitModel::Polynomial(polynomial) => {
                let variable = self
                    .registry
                    .settings()
                    .variables
                    .first()
                    .map_or("x", String::as_str);
                vec![(target, polynomial.to_expression(variable))]
            }
            FitModel::User(function) => function
                .parameter_names()
                .iter()
                .zip(function.parameters())
                .map(|(name, value)| {
                    self.registry
                        .find(name)
                        .map(|id| (id, value.to_string()))
                        .ok_or_else(|| EditError::UnknownName(name.clone()))
                })
                .collect::<Result<_, _>>()?,
        };

        for (id, _) in &assignments {
            let entity = self
                .registry
                .entity(*id)
                .ok_or(EditError::UnknownEntity(*id))?;
            if !entity.core().expression_editable {
                return Err(EditError::ExpressionNotEditable(entity.name().to_string()));
            }
        }

        let mut recorded = 0;
        for (id, expression) in assignments {
            match self.propose_expression(id, &expression) {
                Ok(()) => recorded += 1,
                Err(EditError::Unchanged(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(recorded)
    }
}
