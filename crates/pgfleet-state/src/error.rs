//! Error types for the pool registry.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("pool {pool_id} would hold {current} of {max} instances")]
    CapacityExceeded {
        pool_id: String,
        current: u32,
        max: u32,
    },

    #[error("invalid record: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),
}
