//! pgfleet-health: health checking for PostgreSQL pools.
//!
//! Probes every serving pool on a fixed interval and keeps the pool
//! records' health in step with the results. The planner only places
//! tenants on pools whose health is `healthy` or `unknown`, so a pool that
//! stops answering drops out of selection without any coordination.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── PoolProber (PgWireProber: TCP + SSLRequest)
//!   ├── apply_probe() → consecutive failures, health, lifecycle
//!   ├── reclaim_stale() → pools stuck before `active`
//!   └── Optional AlertCallback
//! ```
//!
//! # Thresholds
//!
//! `degraded_after` consecutive failures mark a pool `degraded`;
//! `unhealthy_after` mark it `unhealthy` and move its lifecycle to
//! `degraded`. A single successful probe restores `healthy` and the
//! `active`/`full` lifecycle.

pub mod checker;
pub mod error;
pub mod monitor;

pub use checker::{PgWireProber, ProbeResult, Thresholds, apply_probe, probe_with_timeout};
pub use error::{HealthError, HealthResult};
pub use monitor::{AlertCallback, AlertFuture, AlertKind, HealthAlert, HealthMonitor, SweepReport};
