//! pgfleet-migrate: moves a tenant's database to a pool of another kind.
//!
//! A migration is a persisted, phased job:
//!
//! `preparing → provisioning_target → draining → snapshotting →
//! transferring → verifying → cutover → cleanup → completed`
//!
//! The tenant mapping is swapped with a compare-and-swap at cutover, so
//! readers see either the old or the new pool. Any failure before the swap
//! is rolled back (writes resumed on the source, target slot released);
//! a failure after it leaves the job `failed` for an operator.

pub mod coordinator;
pub mod error;
pub mod worker;

pub use coordinator::MigrationCoordinator;
pub use error::{MigrationError, MigrationResult};
pub use worker::MigrationWorker;
