//! The ordered collection of named entities behind one function-builder panel.
//!
//! Every successful mutation recomputes the reference analysis, the evaluation plan and
//! the entity statuses before returning, so queries never observe a stale plan.

use crate::edit_log::{Edit, EditCommand, Selection, EXPRESSION_COLUMN, NAME_COLUMN};
use crate::entity::{Entity, EntityId, EntityStatus};
use crate::equation_engine::{compile, Bytecode, ExpressionError};
use crate::error::EditError;
use crate::naming::{resolve_name, NameResolution, NamingPolicy};
use crate::ordering::evaluation_order;
use crate::references::ReferenceAnalysis;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Keep removable entities above the non-removable ("important") ones.
    pub removables_at_top: bool,
    /// Independent variable names (e.g. `x`, `t`). They are reserved and may appear in
    /// expressions without being entities.
    pub variables: Vec<String>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            removables_at_top: true,
            variables: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub(crate) id: EntityId,
    pub(crate) entity: Entity,
    pub(crate) value: Option<f64>,
    pub(crate) status: EntityStatus,
}

/// The ordered list of entities of one panel, with its derived analysis and plan.
///
/// Every change is validated by a `propose_*` method; the raw command replay stays private
/// to the crate, so a command can never smuggle in a duplicate name:
///
/// ```compile_fail
/// use fitkit_core::edit_log::EditCommand;
/// use fitkit_core::registry::Registry;
///
/// fn replay(registry: &mut Registry, command: &EditCommand) {
///     registry.apply(command).ok();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Registry {
    pub(crate) slots: Vec<Slot>,
    policy: NamingPolicy,
    pub(crate) settings: RegistrySettings,
    next_id: u64,
    analysis: ReferenceAnalysis,
    plan: Vec<EntityId>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(NamingPolicy::default(), RegistrySettings::default())
    }
}

impl Registry {
    pub fn new(mut policy: NamingPolicy, settings: RegistrySettings) -> Self {
        for variable in &settings.variables {
            policy.reserve(variable);
        }
        Self {
            slots: Vec::new(),
            policy,
            settings,
            next_id: 0,
            analysis: ReferenceAnalysis::default(),
            plan: Vec::new(),
        }
    }

    // --- Queries ---

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn policy(&self) -> &NamingPolicy {
        &self.policy
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    /// Names in row order.
    pub fn names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.entity.name()).collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.slots.iter().map(|s| s.id)
    }

    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &Entity)> + '_ {
        self.slots.iter().map(|s| (s.id, &s.entity))
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.slot(id).map(|s| &s.entity)
    }

    pub fn row_of(&self, id: EntityId) -> Option<usize> {
        self.slots.iter().position(|s| s.id == id)
    }

    pub fn id_at(&self, row: usize) -> Option<EntityId> {
        self.slots.get(row).map(|s| s.id)
    }

    pub fn find(&self, name: &str) -> Option<EntityId> {
        self.slots
            .iter()
            .find(|s| s.entity.name() == name)
            .map(|s| s.id)
    }

    /// Non-errored entities in dependency order.
    pub fn evaluation_plan(&self) -> &[EntityId] {
        &self.plan
    }

    pub fn evaluation_plan_names(&self) -> Vec<&str> {
        self.plan
            .iter()
            .filter_map(|id| self.entity(*id).map(Entity::name))
            .collect()
    }

    pub fn is_circular(&self, id: EntityId) -> bool {
        self.entity(id)
            .is_some_and(|e| self.analysis.is_circular(e.name()))
    }

    pub fn is_errored(&self, id: EntityId) -> bool {
        self.entity(id)
            .is_some_and(|e| self.analysis.is_errored(e.name()))
    }

    pub fn status(&self, id: EntityId) -> Option<&EntityStatus> {
        self.slot(id).map(|s| &s.status)
    }

    /// Names `name` references directly or transitively; empty for unknown names.
    pub fn references(&self, name: &str) -> BTreeSet<String> {
        self.analysis.references(name).cloned().unwrap_or_default()
    }

    pub fn analysis(&self) -> &ReferenceAnalysis {
        &self.analysis
    }

    /// Last evaluated value, kept while the entity is circular, errored or invalid.
    pub fn value(&self, id: EntityId) -> Option<f64> {
        self.slot(id).and_then(|s| s.value)
    }

    pub(crate) fn slot(&self, id: EntityId) -> Option<&Slot> {
        self.slots.iter().find(|s| s.id == id)
    }

    fn slot_mut(&mut self, id: EntityId) -> Result<&mut Slot, EditError> {
        self.slots
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(EditError::UnknownEntity(id))
    }

    fn other_names(&self, except: Option<EntityId>) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|s| Some(s.id) != except)
            .map(|s| s.entity.name())
            .collect()
    }

    // --- Row policy ---

    /// Rows a new entity may occupy, keeping removable and important entities grouped.
    fn insertion_range(&self, removable: bool) -> (usize, usize) {
        let len = self.slots.len();
        let removables = self.slots.iter().filter(|s| s.entity.is_removable()).count();
        match (self.settings.removables_at_top, removable) {
            (true, true) => (0, removables),
            (true, false) => (removables, len),
            (false, true) => (len - removables, len),
            (false, false) => (0, len - removables),
        }
    }

    /// The requested row clamped into the entity's group, or the group boundary.
    fn insertion_row(&self, removable: bool, requested: Option<usize>) -> usize {
        let (start, end) = self.insertion_range(removable);
        match requested {
            Some(row) => row.clamp(start, end),
            None if self.settings.removables_at_top == removable => end,
            None => start,
        }
    }

    // --- Edit submission ---

    /// Validates the name, inserts the entity and returns the command that records it.
    pub fn propose_add(
        &mut self,
        mut entity: Entity,
        row: Option<usize>,
        resolution: NameResolution<'_>,
    ) -> Result<EditCommand, EditError> {
        let name = resolve_name(entity.name(), self.other_names(None), &self.policy, resolution)?;
        entity.core_mut().name = name;

        let row = self.insertion_row(entity.is_removable(), row);
        let id = EntityId(self.next_id);
        let command = EditCommand {
            id,
            edit: Edit::Add { entity, row },
            prior_selection: None,
            next_selection: Some(Selection::new(row, NAME_COLUMN)),
        };
        self.apply(&command)?;
        Ok(command)
    }

    pub fn propose_remove(&mut self, id: EntityId) -> Result<EditCommand, EditError> {
        let row = self.row_of(id).ok_or(EditError::UnknownEntity(id))?;
        let entity = self.slots[row].entity.clone();
        if !entity.is_removable() {
            return Err(EditError::NotRemovable(entity.name().to_string()));
        }
        let remaining = self.slots.len() - 1;
        let command = EditCommand {
            id,
            edit: Edit::Remove { entity, row },
            prior_selection: Some(Selection::new(row, NAME_COLUMN)),
            next_selection: (remaining > 0)
                .then(|| Selection::new(row.min(remaining - 1), NAME_COLUMN)),
        };
        self.apply(&command)?;
        Ok(command)
    }

    pub fn propose_rename(
        &mut self,
        id: EntityId,
        name: &str,
        resolution: NameResolution<'_>,
    ) -> Result<EditCommand, EditError> {
        let row = self.row_of(id).ok_or(EditError::UnknownEntity(id))?;
        let current = self.slots[row].entity.core();
        if !current.name_editable {
            return Err(EditError::NameNotEditable(current.name.clone()));
        }
        let old = current.name.clone();
        let new = resolve_name(name, self.other_names(Some(id)), &self.policy, resolution)?;
        if new == old {
            return Err(EditError::Unchanged(old));
        }
        let selection = Some(Selection::new(row, NAME_COLUMN));
        let command = EditCommand {
            id,
            edit: Edit::Rename { old, new },
            prior_selection: selection,
            next_selection: selection,
        };
        self.apply(&command)?;
        Ok(command)
    }

    pub fn propose_expression(
        &mut self,
        id: EntityId,
        expression: &str,
    ) -> Result<EditCommand, EditError> {
        let row = self.row_of(id).ok_or(EditError::UnknownEntity(id))?;
        let current = self.slots[row].entity.core();
        if !current.expression_editable {
            return Err(EditError::ExpressionNotEditable(current.name.clone()));
        }
        if current.expression == expression {
            return Err(EditError::Unchanged(current.name.clone()));
        }
        let selection = Some(Selection::new(row, EXPRESSION_COLUMN));
        let command = EditCommand {
            id,
            edit: Edit::Reexpress {
                old: current.expression.clone(),
                new: expression.to_string(),
            },
            prior_selection: selection,
            next_selection: selection,
        };
        self.apply(&command)?;
        Ok(command)
    }

    /// Adds with automatic name resolution; `None` if the name cannot be made valid.
    pub fn add(&mut self, entity: Entity, row: Option<usize>) -> Option<EntityId> {
        self.propose_add(entity, row, NameResolution::Automatic)
            .ok()
            .map(|command| command.id)
    }

    /// Removes a removable entity; `None` (and no change) otherwise.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        match self.propose_remove(id).ok()?.edit {
            Edit::Remove { entity, .. } => Some(entity),
            _ => None,
        }
    }

    /// Applies a command's forward change without re-validating names or flags,
    /// then recomputes. Used for submission and for undo/redo replay; callers outside the
    /// crate go through the `propose_*` methods.
    pub(crate) fn apply(&mut self, command: &EditCommand) -> Result<(), EditError> {
        match &command.edit {
            Edit::Add { entity, row } => {
                if self.slot(command.id).is_some() {
                    return Err(EditError::Unchanged(entity.name().to_string()));
                }
                let row = (*row).min(self.slots.len());
                self.slots.insert(
                    row,
                    Slot {
                        id: command.id,
                        entity: entity.clone(),
                        value: None,
                        status: EntityStatus::Ok,
                    },
                );
                self.next_id = self.next_id.max(command.id.0 + 1);
            }
            Edit::Remove { .. } => {
                let row = self
                    .row_of(command.id)
                    .ok_or(EditError::UnknownEntity(command.id))?;
                self.slots.remove(row);
            }
            Edit::Rename { new, .. } => {
                self.slot_mut(command.id)?.entity.core_mut().name = new.clone();
            }
            Edit::Reexpress { new, .. } => {
                self.slot_mut(command.id)?.entity.core_mut().expression = new.clone();
            }
        }
        self.recompute();
        Ok(())
    }

    // --- Recomputation ---

    /// Rebuilds the reference analysis, the plan and every status from scratch.
    pub(crate) fn recompute(&mut self) {
        let pairs: Vec<(&str, &str)> = self
            .slots
            .iter()
            .map(|s| (s.entity.name(), s.entity.expression()))
            .collect();
        let analysis = ReferenceAnalysis::analyze(&pairs);
        let order = evaluation_order(pairs.iter().map(|(name, _)| *name), &analysis);

        let ids_by_name: HashMap<&str, EntityId> =
            self.slots.iter().map(|s| (s.entity.name(), s.id)).collect();
        let plan: Vec<EntityId> = order
            .iter()
            .filter_map(|name| ids_by_name.get(name.as_str()).copied())
            .collect();

        self.analysis = analysis;
        self.plan = plan;

        let compiled: HashMap<EntityId, Result<Bytecode, ExpressionError>> =
            self.compile_plan().into_iter().collect();
        for slot in &mut self.slots {
            let name = slot.entity.name();
            slot.status = if self.analysis.is_circular(name) {
                EntityStatus::Circular
            } else if self.analysis.is_errored(name) {
                EntityStatus::Errored
            } else {
                match compiled.get(&slot.id) {
                    Some(Err(err)) => EntityStatus::InvalidExpression(err.to_string()),
                    _ => EntityStatus::Ok,
                }
            };
        }

        debug!(
            entities = self.slots.len(),
            planned = self.plan.len(),
            circular = self.analysis.circular().len(),
            errored = self.analysis.errored().len(),
            "registry recomputed"
        );
    }

    /// Compiles every planned entity against the variables and the names planned
    /// before it.
    pub(crate) fn compile_plan(&self) -> Vec<(EntityId, Result<Bytecode, ExpressionError>)> {
        let mut known: Vec<&str> = Vec::with_capacity(self.plan.len());
        let variables: Vec<&str> = self.settings.variables.iter().map(String::as_str).collect();
        let mut out = Vec::with_capacity(self.plan.len());
        for &id in &self.plan {
            let Some(entity) = self.entity(id) else {
                continue;
            };
            out.push((id, compile(entity.expression(), &variables, &known)));
            known.push(entity.name());
        }
        out
    }
}
