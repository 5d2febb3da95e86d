//! Provisioning error types.

use thiserror::Error;

use pgfleet_core::CollaboratorError;
use pgfleet_state::StateError;

/// Errors that can occur while provisioning a pool.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provisioning job not found: {0}")]
    JobNotFound(String),

    #[error("provisioning job {0} is leased by another worker")]
    Leased(String),

    #[error("provisioning timed out: {0}")]
    Timeout(String),

    #[error("provisioning job {job_id} failed: {reason}")]
    Failed { job_id: String, reason: String },

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
