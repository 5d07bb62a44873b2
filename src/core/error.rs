use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrmError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Relation validation error: {0}")]
    RelationValidation(String),

    #[error("Entity class '{0}' not found")]
    ClassNotFound(String),

    #[error("Field '{0}' not found in entity class '{1}'")]
    FieldNotFound(String, String),

    #[error("Relation '{0}' has no definition in entity class '{1}'")]
    MissingRelationDefinition(String, String),

    #[error("No engine registered under '{0}'")]
    EngineNotFound(String),

    #[error("Entity manager is closed: {0}")]
    ClosedManager(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Table '{0}' does not exist")]
    MissingTable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OrmError>;
