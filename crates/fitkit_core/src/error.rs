use crate::entity::EntityId;
use crate::naming::NameError;
use thiserror::Error;

/// Why a proposed edit was refused. The registry is unchanged whenever one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditError {
    #[error("no entity with id {0:?}")]
    UnknownEntity(EntityId),
    #[error("no entity named '{0}'")]
    UnknownName(String),
    #[error("'{0}' cannot be removed")]
    NotRemovable(String),
    #[error("the name of '{0}' cannot be edited")]
    NameNotEditable(String),
    #[error("the expression of '{0}' cannot be edited")]
    ExpressionNotEditable(String),
    #[error("edit leaves '{0}' unchanged")]
    Unchanged(String),
    #[error(transparent)]
    Name(#[from] NameError),
}
