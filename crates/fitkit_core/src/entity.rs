use serde::{Deserialize, Serialize};

/// Stable identity of a registry entity. Survives renames and undo/redo of removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

/// Fields shared by every entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCore {
    pub name: String,
    pub expression: String,
    #[serde(default)]
    pub description: String,
    pub removable: bool,
    pub name_editable: bool,
    pub expression_editable: bool,
}

impl EntityCore {
    pub fn new(name: &str, expression: &str) -> Self {
        Self {
            name: name.to_string(),
            expression: expression.to_string(),
            description: String::new(),
            removable: true,
            name_editable: true,
            expression_editable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FitKind {
    /// Closed-form polynomial of the given degree.
    Polynomial { degree: usize },
    /// User expression; the listed names are adjusted by the fit.
    User { free_parameters: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitFunctionEntity {
    pub core: EntityCore,
    pub kind: FitKind,
}

/// A named, expression-bearing item of a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Entity {
    /// Evaluates to a single number.
    Parameter(EntityCore),
    /// Free-form expression, usually of the independent variables.
    Function(EntityCore),
    /// Function bound to a fit model.
    FitFunction(FitFunctionEntity),
}

impl Entity {
    pub fn parameter(name: &str, expression: &str) -> Self {
        Entity::Parameter(EntityCore::new(name, expression))
    }

    pub fn function(name: &str, expression: &str) -> Self {
        Entity::Function(EntityCore::new(name, expression))
    }

    pub fn fit_function(name: &str, expression: &str, kind: FitKind) -> Self {
        Entity::FitFunction(FitFunctionEntity {
            core: EntityCore::new(name, expression),
            kind,
        })
    }

    pub fn core(&self) -> &EntityCore {
        match self {
            Entity::Parameter(core) | Entity::Function(core) => core,
            Entity::FitFunction(fit) => &fit.core,
        }
    }

    pub fn core_mut(&mut self) -> &mut EntityCore {
        match self {
            Entity::Parameter(core) | Entity::Function(core) => core,
            Entity::FitFunction(fit) => &mut fit.core,
        }
    }

    pub fn name(&self) -> &str {
        &self.core().name
    }

    pub fn expression(&self) -> &str {
        &self.core().expression
    }

    pub fn is_removable(&self) -> bool {
        self.core().removable
    }

    /// Marks the entity as built-in: it cannot be removed.
    pub fn important(mut self) -> Self {
        self.core_mut().removable = false;
        self
    }

    /// Marks the entity as display-only: neither name nor expression can be edited.
    pub fn display_only(mut self) -> Self {
        let core = self.core_mut();
        core.name_editable = false;
        core.expression_editable = false;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.core_mut().description = description.to_string();
        self
    }
}

/// Evaluation status reported to collaborators for highlighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityStatus {
    Ok,
    /// The entity's reference chain returns to itself.
    Circular,
    /// The entity depends on a circular entity.
    Errored,
    /// The evaluator rejected the expression.
    InvalidExpression(String),
}

impl EntityStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, EntityStatus::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_set_flags_on_the_shared_core() {
        let e = Entity::parameter("g", "9.81")
            .important()
            .display_only()
            .with_description("gravity");
        assert_eq!(e.name(), "g");
        assert_eq!(e.expression(), "9.81");
        assert!(!e.is_removable());
        assert!(!e.core().name_editable);
        assert!(!e.core().expression_editable);
        assert_eq!(e.core().description, "gravity");

        let fit = Entity::fit_function("f", "a*x", FitKind::User {
            free_parameters: vec!["a".into()],
        });
        assert!(fit.is_removable());
        assert_eq!(fit.expression(), "a*x");
    }
}
