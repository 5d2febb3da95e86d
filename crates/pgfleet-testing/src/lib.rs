//! pgfleet-testing: in-memory doubles of the fleet's collaborators.
//!
//! Every double records the calls it receives so tests can assert on
//! side effects (how many volumes were allocated, which tenant was
//! paused, whether a credential handle was consumed). Failure injection
//! is toggled per double.

pub mod doubles;
pub mod fixtures;

pub use doubles::*;
pub use fixtures::*;
