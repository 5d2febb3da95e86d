//! pgfleet-core: shared types, configuration, and the interfaces of the
//! external systems pgfleet drives but does not implement.
//!
//! The collaborator traits in [`collaborators`] are the seams between the
//! fleet control plane and the infrastructure that actually creates volumes,
//! starts PostgreSQL servers, moves tenant data, and answers plan
//! entitlement questions.

pub mod collaborators;
pub mod config;
pub mod credentials;
pub mod time;
pub mod types;

pub use collaborators::*;
pub use config::FleetConfig;
pub use credentials::{CredentialHandle, Credentials, DatabaseIdentity};
pub use time::{epoch_secs, parse_duration};
pub use types::*;
