//! pgfleet-provision: brings new PostgreSQL pools online.
//!
//! A [`ProvisioningJob`](pgfleet_state::ProvisioningJob) moves through
//! `allocate_storage → create_server → await_ready → register_pool →
//! completed`. Every phase records a completion marker on the job before
//! the next phase starts, and every phase looks for the effect of an
//! earlier interrupted run before creating anything, so a job can be
//! resumed from any point by any worker.
//!
//! # Architecture
//!
//! ```text
//! ProvisionQueue ── enqueue (deduplicated per kind / per tenant)
//! Orchestrator
//!   ├── StateStore (jobs, pool records, leases)
//!   ├── VolumeProvisioner
//!   └── WorkloadExecutor
//! ProvisionWorker ── claims runnable jobs on an interval
//! ```

pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod worker;

pub use error::{ProvisionError, ProvisionResult};
pub use orchestrator::Orchestrator;
pub use queue::{ProvisionQueue, ProvisionRequest};
pub use worker::ProvisionWorker;
