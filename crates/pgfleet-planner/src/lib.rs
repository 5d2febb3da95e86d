//! pgfleet-planner: decides where a tenant's database lives.
//!
//! The [`AllocationPlanner`] answers allocation requests synchronously:
//!
//! - Checks the customer's plan through a [`CachedEntitlements`] cache
//! - Selects the best shared pool (priority, then load) or the tenant's
//!   own dedicated pool and reserves a slot atomically
//! - Has the workload executor create the database with a single-read
//!   credential handle
//! - Falls back to enqueueing a provisioning job and returning `Pending`

pub mod credentials;
pub mod entitlements;
pub mod error;
pub mod planner;

pub use credentials::{database_identity, generate_password};
pub use entitlements::{CachedEntitlements, permits};
pub use error::{PlannerError, PlannerResult};
pub use planner::{AllocationPlanner, AllocationRequest, AllocationResult, SlotLedger};
