use thiserror::Error;

/// Errors surfaced by a [`Database`](crate::db::Database) gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// The database could not be reached. Transient: handled by the resilience coordinator.
    #[error("Database unreachable: {0}")]
    Unreachable(String),

    #[error("Row not found: {0}")]
    NotFound(String),

    #[error("Query failed: {0}")]
    Query(String),
}

impl DbError {
    /// Distinguishes transient connectivity loss from ordinary query errors.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, DbError::Unreachable(_))
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Engine is not running")]
    NotRunning,

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

/// Failure of a job payload, or of one of the calls it makes through its context.
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Job instance {0} has been killed")]
    Killed(i64),

    #[error("Payload failed: {0}")]
    Failed(String),

    #[error("Payload could not be launched: {0}")]
    Launch(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
