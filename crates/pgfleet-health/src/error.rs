//! Health monitor error types.

use thiserror::Error;

use pgfleet_state::StateError;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("pool {pool_id} is {status} and cannot be probed")]
    NotServing { pool_id: String, status: String },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type HealthResult<T> = Result<T, HealthError>;
