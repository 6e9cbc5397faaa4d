//! Reversible edit commands and the linear undo/redo log.

use crate::entity::{Entity, EntityId};
use crate::error::EditError;
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Table column holding entity names.
pub const NAME_COLUMN: usize = 0;
/// Table column holding entity expressions.
pub const EXPRESSION_COLUMN: usize = 1;

/// Cursor position a collaborator should restore after undo/redo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub row: usize,
    pub column: usize,
}

impl Selection {
    pub fn new(row: usize, column: usize) -> Self {
        Self { row, column }
    }
}

/// The registry change itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Edit {
    Add { entity: Entity, row: usize },
    Remove { entity: Entity, row: usize },
    Rename { old: String, new: String },
    Reexpress { old: String, new: String },
}

/// One successful user-level mutation, with everything needed to invert it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditCommand {
    pub id: EntityId,
    pub edit: Edit,
    /// Selection before the edit; restored by undo.
    pub prior_selection: Option<Selection>,
    /// Selection after the edit; restored by redo.
    pub next_selection: Option<Selection>,
}

impl EditCommand {
    /// Overrides the selection undo should restore.
    pub fn with_prior_selection(mut self, selection: Option<Selection>) -> Self {
        self.prior_selection = selection;
        self
    }

    /// The command that undoes this one.
    pub fn invert(&self) -> EditCommand {
        let edit = match &self.edit {
            Edit::Add { entity, row } => Edit::Remove {
                entity: entity.clone(),
                row: *row,
            },
            Edit::Remove { entity, row } => Edit::Add {
                entity: entity.clone(),
                row: *row,
            },
            Edit::Rename { old, new } => Edit::Rename {
                old: new.clone(),
                new: old.clone(),
            },
            Edit::Reexpress { old, new } => Edit::Reexpress {
                old: new.clone(),
                new: old.clone(),
            },
        };
        EditCommand {
            id: self.id,
            edit,
            prior_selection: self.next_selection,
            next_selection: self.prior_selection,
        }
    }

    pub fn label(&self) -> &'static str {
        match self.edit {
            Edit::Add { .. } => "add",
            Edit::Remove { .. } => "remove",
            Edit::Rename { .. } => "rename",
            Edit::Reexpress { .. } => "edit expression",
        }
    }
}

/// Outcome of a successful undo or redo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restored {
    pub label: &'static str,
    /// Where the collaborator should put its cursor.
    pub selection: Option<Selection>,
}

/// Linear undo/redo history. A new record after an undo discards the redo branch.
#[derive(Debug, Clone, Default)]
pub struct EditLog {
    done: Vec<EditCommand>,
    undone: Vec<EditCommand>,
    limit: Option<usize>,
}

impl EditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `limit` undoable commands; the oldest are dropped first.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn record(&mut self, command: EditCommand) {
        debug!(edit = command.label(), id = command.id.0, "recorded edit");
        self.undone.clear();
        self.done.push(command);
        if let Some(limit) = self.limit {
            if self.done.len() > limit {
                let excess = self.done.len() - limit;
                self.done.drain(..excess);
            }
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.done.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.undone.is_empty()
    }

    pub fn undo_label(&self) -> Option<&'static str> {
        self.done.last().map(EditCommand::label)
    }

    pub fn redo_label(&self) -> Option<&'static str> {
        self.undone.last().map(EditCommand::label)
    }

    /// Reverts the latest command. Returns `Ok(None)` when there is nothing to undo.
    pub fn undo(&mut self, registry: &mut Registry) -> Result<Option<Restored>, EditError> {
        let Some(command) = self.done.pop() else {
            return Ok(None);
        };
        let inverse = command.invert();
        if let Err(err) = registry.apply(&inverse) {
            self.done.push(command);
            return Err(err);
        }
        let restored = Restored {
            label: command.label(),
            selection: inverse.next_selection,
        };
        self.undone.push(command);
        Ok(Some(restored))
    }

    /// Re-applies the latest undone command.
    pub fn redo(&mut self, registry: &mut Registry) -> Result<Option<Restored>, EditError> {
        let Some(command) = self.undone.pop() else {
            return Ok(None);
        };
        if let Err(err) = registry.apply(&command) {
            self.undone.push(command);
            return Err(err);
        }
        let restored = Restored {
            label: command.label(),
            selection: command.next_selection,
        };
        self.done.push(command);
        Ok(Some(restored))
    }

    pub fn clear(&mut self) {
        self.done.clear();
        self.undone.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::NameResolution;

    fn registry_with(entries: &[(&str, &str)]) -> (Registry, Vec<EntityId>) {
        let mut registry = Registry::default();
        let ids = entries
            .iter()
            .map(|(n, e)| registry.add(Entity::parameter(n, e), None).unwrap())
            .collect();
        (registry, ids)
    }

    #[test]
    fn invert_swaps_payload_and_selection() {
        let command = EditCommand {
            id: EntityId(3),
            edit: Edit::Rename {
                old: "a".into(),
                new: "b".into(),
            },
            prior_selection: Some(Selection::new(1, 0)),
            next_selection: Some(Selection::new(2, 0)),
        };
        let inverse = command.invert();
        assert_eq!(
            inverse.edit,
            Edit::Rename {
                old: "b".into(),
                new: "a".into()
            }
        );
        assert_eq!(inverse.prior_selection, Some(Selection::new(2, 0)));
        assert_eq!(inverse.invert(), command);
    }

    #[test]
    fn undo_redo_of_expression_edit_restores_state_exactly() {
        let (mut registry, ids) = registry_with(&[("a", "1"), ("b", "2"), ("c", "b + 1")]);
        let mut log = EditLog::new();
        let before_plan = registry.evaluation_plan().to_vec();

        let command = registry.propose_expression(ids[1], "c * 2").unwrap();
        log.record(command);
        let after_plan = registry.evaluation_plan().to_vec();
        assert!(registry.is_circular(ids[1]));
        assert_ne!(before_plan, after_plan);

        let restored = log.undo(&mut registry).unwrap().unwrap();
        assert_eq!(restored.selection, Some(Selection::new(1, EXPRESSION_COLUMN)));
        assert_eq!(restored.label, "edit expression");
        assert_eq!(registry.entity(ids[1]).unwrap().expression(), "2");
        assert_eq!(registry.evaluation_plan(), before_plan.as_slice());

        log.redo(&mut registry).unwrap();
        assert_eq!(registry.entity(ids[1]).unwrap().expression(), "c * 2");
        assert_eq!(registry.evaluation_plan(), after_plan.as_slice());
    }

    #[test]
    fn undo_of_remove_reinserts_at_the_same_row_with_the_same_id() {
        let (mut registry, ids) = registry_with(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let mut log = EditLog::new();
        log.record(registry.propose_remove(ids[1]).unwrap());
        assert_eq!(registry.names(), vec!["a", "c"]);

        let restored = log.undo(&mut registry).unwrap().unwrap();
        assert_eq!(registry.names(), vec!["a", "b", "c"]);
        assert_eq!(registry.row_of(ids[1]), Some(1));
        assert_eq!(restored.selection, Some(Selection::new(1, NAME_COLUMN)));

        log.redo(&mut registry).unwrap();
        assert_eq!(registry.names(), vec!["a", "c"]);
    }

    #[test]
    fn undo_of_add_and_rename() {
        let (mut registry, ids) = registry_with(&[("a", "1")]);
        let mut log = EditLog::new();
        let add = registry
            .propose_add(Entity::parameter("b", "a"), None, NameResolution::Automatic)
            .unwrap();
        let added = add.id;
        log.record(add);
        log.record(
            registry
                .propose_rename(ids[0], "alpha", NameResolution::Automatic)
                .unwrap(),
        );
        assert_eq!(registry.names(), vec!["alpha", "b"]);

        log.undo(&mut registry).unwrap();
        assert_eq!(registry.names(), vec!["a", "b"]);
        log.undo(&mut registry).unwrap();
        assert_eq!(registry.names(), vec!["a"]);
        assert!(registry.entity(added).is_none());
        assert_eq!(log.undo(&mut registry).unwrap(), None);

        log.redo(&mut registry).unwrap();
        assert_eq!(registry.row_of(added), Some(1));
    }

    #[test]
    fn new_edit_after_undo_discards_redo_history() {
        let (mut registry, ids) = registry_with(&[("a", "1")]);
        let mut log = EditLog::new();
        log.record(registry.propose_expression(ids[0], "2").unwrap());
        log.undo(&mut registry).unwrap();
        assert!(log.can_redo());

        log.record(registry.propose_expression(ids[0], "3").unwrap());
        assert!(!log.can_redo());
        assert_eq!(log.redo(&mut registry).unwrap(), None);
        assert_eq!(log.undo_label(), Some("edit expression"));
    }

    #[test]
    fn limit_drops_oldest_commands() {
        let (mut registry, ids) = registry_with(&[("a", "1")]);
        let mut log = EditLog::with_limit(2);
        for expr in ["2", "3", "4"] {
            log.record(registry.propose_expression(ids[0], expr).unwrap());
        }
        log.undo(&mut registry).unwrap();
        log.undo(&mut registry).unwrap();
        assert!(!log.can_undo());
        assert_eq!(registry.entity(ids[0]).unwrap().expression(), "2");
    }
}
