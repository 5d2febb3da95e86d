//! Planner error types.
//!
//! Running out of capacity is not an error: it surfaces as
//! [`AllocationResult::Pending`](crate::AllocationResult::Pending).

use thiserror::Error;

use pgfleet_provision::ProvisionError;
use pgfleet_state::StateError;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("allocation conflict: {0}")]
    Conflict(String),

    #[error("provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("state store error: {0}")]
    State(StateError),
}

impl From<StateError> for PlannerError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::Conflict(reason) => PlannerError::Conflict(reason),
            other => PlannerError::State(other),
        }
    }
}

pub type PlannerResult<T> = Result<T, PlannerError>;
