//! pgfleetd: the PostgreSQL fleet control plane daemon.
//!
//! [`fleet::Fleet`] wires the state store, planner, orchestrator, health
//! monitor, and migration coordinator onto one set of collaborators;
//! [`remote`] supplies HTTP implementations of those collaborators.

pub mod fleet;
pub mod remote;

pub use fleet::{Collaborators, Fleet};
