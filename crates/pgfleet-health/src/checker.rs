//! Health check probe logic.
//!
//! Probes PostgreSQL servers at the wire protocol level and folds probe
//! results into pool records with configurable thresholds.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use pgfleet_core::config::HealthSettings;
use pgfleet_core::{CollaboratorError, CollaboratorResult, Endpoint, PoolProber};
use pgfleet_state::{HealthStatus, PoolRecord, PoolStatus};

/// `SSLRequest`: length 8, then the magic code 80877103.
const SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The server answered the protocol handshake.
    Healthy,
    /// The server answered with something unexpected.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

/// Failure counts at which health degrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub degraded_after: u32,
    pub unhealthy_after: u32,
}

impl Thresholds {
    pub fn from_settings(settings: &HealthSettings) -> Self {
        let unhealthy_after = settings.unhealthy_after.max(1);
        Self {
            degraded_after: settings.degraded_after.clamp(1, unhealthy_after),
            unhealthy_after,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            degraded_after: 2,
            unhealthy_after: 3,
        }
    }
}

/// Fold one probe result into a pool record.
///
/// Success resets the failure counter, marks the pool `healthy`, and
/// returns a `degraded` lifecycle to `active`/`full`. Failures count up
/// towards `degraded` and then `unhealthy`; at `unhealthy` a serving pool's
/// lifecycle becomes `degraded`. Returns the previous health.
pub fn apply_probe(
    pool: &mut PoolRecord,
    result: ProbeResult,
    thresholds: Thresholds,
    now: u64,
) -> HealthStatus {
    let previous = pool.health;
    pool.last_health_check = Some(now);

    match result {
        ProbeResult::Healthy => {
            pool.consecutive_failures = 0;
            pool.health = HealthStatus::Healthy;
            if pool.status == PoolStatus::Degraded {
                pool.status = PoolStatus::Active;
                pool.status = pool.capacity_status();
            }
            if previous != HealthStatus::Healthy {
                debug!(pool_id = %pool.id, "pool healthy");
            }
        }
        ProbeResult::Unhealthy | ProbeResult::Failed => {
            pool.consecutive_failures += 1;
            if pool.consecutive_failures >= thresholds.unhealthy_after {
                pool.health = HealthStatus::Unhealthy;
                if pool.status.is_serving() {
                    pool.status = PoolStatus::Degraded;
                }
            } else if pool.consecutive_failures >= thresholds.degraded_after {
                pool.health = HealthStatus::Degraded;
            }

            if pool.health != previous {
                warn!(
                    pool_id = %pool.id,
                    failures = pool.consecutive_failures,
                    health = ?pool.health,
                    "pool health dropped"
                );
            }
        }
    }

    previous
}

/// Probe with a wall-clock bound. Timeouts count as `Failed`.
pub async fn probe_with_timeout(
    prober: &dyn PoolProber,
    endpoint: &Endpoint,
    timeout: Duration,
) -> ProbeResult {
    match tokio::time::timeout(timeout, prober.probe(endpoint)).await {
        Ok(Ok(())) => ProbeResult::Healthy,
        Ok(Err(CollaboratorError::Rejected { reason, .. })) => {
            debug!(address = %endpoint.address(), %reason, "probe got an unexpected answer");
            ProbeResult::Unhealthy
        }
        Ok(Err(e)) => {
            debug!(address = %endpoint.address(), error = %e, "probe failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(address = %endpoint.address(), "probe timed out");
            ProbeResult::Failed
        }
    }
}

/// Checks liveness by starting a PostgreSQL connection.
///
/// Sends an `SSLRequest` and accepts either answer (`S` or `N`): both
/// mean the postmaster is accepting connections. No credentials are
/// needed and no backend process is started.
#[derive(Debug, Clone, Default)]
pub struct PgWireProber;

#[async_trait]
impl PoolProber for PgWireProber {
    async fn probe(&self, endpoint: &Endpoint) -> CollaboratorResult<()> {
        let unavailable = |e: std::io::Error| CollaboratorError::Unavailable {
            service: "postgres",
            reason: format!("{}: {e}", endpoint.address()),
        };

        let mut stream = TcpStream::connect(endpoint.address())
            .await
            .map_err(unavailable)?;
        stream.write_all(&SSL_REQUEST).await.map_err(unavailable)?;

        let mut answer = [0u8; 1];
        stream.read_exact(&mut answer).await.map_err(unavailable)?;
        match answer[0] {
            b'S' | b'N' => Ok(()),
            other => Err(CollaboratorError::Rejected {
                service: "postgres",
                reason: format!("unexpected SSLRequest answer 0x{other:02x}"),
            }),
        }
    }
}
