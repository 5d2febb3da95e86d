//! Migration error types.

use thiserror::Error;

use pgfleet_core::CollaboratorError;
use pgfleet_planner::PlannerError;
use pgfleet_provision::ProvisionError;
use pgfleet_state::{MigrationPhase, StateError};

#[derive(Debug, Error)]
pub enum MigrationError {
    /// The request was refused; no job was created.
    #[error("migration rejected: {0}")]
    Validation(String),

    #[error("migration job not found: {0}")]
    NotFound(String),

    #[error("migration job {0} is leased by another worker")]
    Leased(String),

    #[error("migration failed in {phase:?} (rolled back: {rolled_back}): {reason}")]
    PhaseFailed {
        phase: MigrationPhase,
        rolled_back: bool,
        reason: String,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("verification failed: {0}")]
    Verification(String),

    /// Target credentials live only in memory between reservation and
    /// cutover; a restart in between loses them.
    #[error("target credentials for job {0} are no longer held")]
    CredentialsLost(String),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("planner error: {0}")]
    Planner(#[from] PlannerError),

    #[error("provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type MigrationResult<T> = Result<T, MigrationError>;
