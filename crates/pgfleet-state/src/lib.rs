//! pgfleet-state: pool registry for the PostgreSQL fleet.
//!
//! Backed by [redb](https://docs.rs/redb), stores pools, tenant
//! allocations, provisioning jobs, and migration jobs.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns,
//! keyed by their id (tenant allocations by tenant id). Capacity changes
//! and allocation swaps are guarded updates inside a single write
//! transaction, which redb serializes, so concurrent reservations can
//! never push a pool past `max_instances`.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod capacity;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

#[cfg(test)]
mod testutil;

pub use capacity::CapacityTracker;
pub use error::{StateError, StateResult};
pub use store::{PoolUpdate, StateStore};
pub use types::*;
