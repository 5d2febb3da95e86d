//! HTTP clients for the external collaborators.
//!
//! Every collaborator is a JSON service behind a base URL from
//! `[collaborators]`. Non-2xx answers are mapped onto
//! [`CollaboratorError`]: 404 becomes `NotFound`, other 4xx `Rejected`,
//! everything else (5xx, transport failures, bad bodies) `Unavailable`.
//!
//! | Collaborator | Method | Path |
//! |---|---|---|
//! | volumes | GET | `/v1/volumes/{name}` |
//! | volumes | POST | `/v1/volumes` |
//! | executor | GET | `/v1/servers/{name}` |
//! | executor | POST | `/v1/servers` |
//! | executor | GET | `/v1/servers/{executor_id}/ready` |
//! | executor | POST | `/v1/databases` |
//! | workload | POST | `/v1/tenants/{id}/pause` |
//! | workload | POST | `/v1/tenants/{id}/resume` |
//! | mover | POST | `/v1/exports` |
//! | mover | POST | `/v1/imports` |
//! | mover | POST | `/v1/verifications` |
//! | entitlements | GET | `/v1/customers/{id}/entitlement` |
//! | entitlements | GET | `/v1/customers/{id}/entitlement/version` |

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use pgfleet_core::config::{CollaboratorEndpoints, duration_or};
use pgfleet_core::*;
use pgfleet_health::PgWireProber;

use crate::fleet::Collaborators;

/// Build HTTP clients for every collaborator in `endpoints`.
///
/// The health prober talks to PostgreSQL directly and is not remote.
pub fn connect(endpoints: &CollaboratorEndpoints) -> anyhow::Result<Collaborators> {
    let client = Client::builder()
        .timeout(duration_or(&endpoints.request_timeout, Duration::from_secs(30)))
        .build()
        .context("building collaborator HTTP client")?;

    Ok(Collaborators {
        volumes: Arc::new(RemoteVolumes::new(client.clone(), &endpoints.volumes_url)),
        executor: Arc::new(RemoteExecutor::new(client.clone(), &endpoints.executor_url)),
        workload: Arc::new(RemoteWorkload::new(client.clone(), &endpoints.workload_url)),
        mover: Arc::new(RemoteMover::new(client.clone(), &endpoints.mover_url)),
        entitlements: Arc::new(RemoteEntitlements::new(client, &endpoints.entitlements_url)),
        prober: Arc::new(PgWireProber),
    })
}

/// One JSON service at a base URL.
#[derive(Clone)]
struct HttpService {
    client: Client,
    base_url: String,
    service: &'static str,
}

impl HttpService {
    fn new(client: Client, base_url: &str, service: &'static str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder, path: &str) -> CollaboratorResult<Response> {
        debug!(service = self.service, path, "collaborator request");
        let response = request.send().await.map_err(|e| CollaboratorError::Unavailable {
            service: self.service,
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!(service = self.service, path, %status, body = %body, "collaborator request failed");
        Err(classify(self.service, path, status, body))
    }

    async fn decode<T: DeserializeOwned>(&self, response: Response) -> CollaboratorResult<T> {
        response.json().await.map_err(|e| CollaboratorError::Unavailable {
            service: self.service,
            reason: format!("invalid response body: {e}"),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> CollaboratorResult<T> {
        let response = self.send(self.client.get(self.url(path)), path).await?;
        self.decode(response).await
    }

    /// GET that treats 404 as absence.
    async fn find_json<T: DeserializeOwned>(&self, path: &str) -> CollaboratorResult<Option<T>> {
        match self.get_json(path).await {
            Ok(found) => Ok(Some(found)),
            Err(CollaboratorError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> CollaboratorResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .send(self.client.post(self.url(path)).json(body), path)
            .await?;
        self.decode(response).await
    }

    /// POST whose response body is ignored.
    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> CollaboratorResult<()> {
        self.send(self.client.post(self.url(path)).json(body), path)
            .await
            .map(|_| ())
    }
}

fn classify(service: &'static str, path: &str, status: StatusCode, body: String) -> CollaboratorError {
    let reason = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    match status {
        StatusCode::NOT_FOUND => CollaboratorError::NotFound(format!("{service} {path}")),
        s if s.is_client_error() => CollaboratorError::Rejected { service, reason },
        _ => CollaboratorError::Unavailable { service, reason },
    }
}

// ── Wire bodies ───────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyBody {
    pub ready: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionBody {
    pub version: Option<String>,
}

/// Tenant database creation. Carries the password, so never logged.
#[derive(Serialize, Deserialize)]
pub struct CreateDatabaseBody {
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub user: String,
    pub password: String,
}

#[derive(Serialize, Deserialize)]
pub struct RepointBody {
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub user: String,
    pub password: String,
}

#[derive(Serialize, Deserialize)]
pub struct ResumeBody {
    pub repoint: Option<RepointBody>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExportBody {
    pub tenant_id: String,
    pub source: DatabaseLocation,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImportBody {
    pub snapshot: SnapshotRef,
    pub target: DatabaseLocation,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyBody {
    pub source: DatabaseLocation,
    pub target: DatabaseLocation,
}

// ── Clients ───────────────────────────────────────────────────────

pub struct RemoteVolumes {
    http: HttpService,
}

impl RemoteVolumes {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            http: HttpService::new(client, base_url, "volumes"),
        }
    }
}

#[async_trait]
impl VolumeProvisioner for RemoteVolumes {
    async fn find_volume(&self, name: &str) -> CollaboratorResult<Option<VolumeHandle>> {
        self.http.find_json(&format!("/v1/volumes/{name}")).await
    }

    async fn allocate_volume(&self, request: &VolumeRequest) -> CollaboratorResult<VolumeHandle> {
        self.http.post_json("/v1/volumes", request).await
    }
}

pub struct RemoteExecutor {
    http: HttpService,
}

impl RemoteExecutor {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            http: HttpService::new(client, base_url, "executor"),
        }
    }
}

#[async_trait]
impl WorkloadExecutor for RemoteExecutor {
    async fn find_server(&self, name: &str) -> CollaboratorResult<Option<ServerHandle>> {
        self.http.find_json(&format!("/v1/servers/{name}")).await
    }

    async fn start_server(&self, spec: &ServerSpec) -> CollaboratorResult<ServerHandle> {
        self.http.post_json("/v1/servers", spec).await
    }

    async fn is_ready(&self, executor_id: &str) -> CollaboratorResult<bool> {
        let body: ReadyBody = self
            .http
            .get_json(&format!("/v1/servers/{executor_id}/ready"))
            .await?;
        Ok(body.ready)
    }

    async fn create_database(
        &self,
        server: &Endpoint,
        identity: &DatabaseIdentity,
        credentials: CredentialHandle,
    ) -> CollaboratorResult<()> {
        let secret = credentials.take()?;
        let body = CreateDatabaseBody {
            host: server.host.clone(),
            port: server.port,
            database_name: identity.database_name.clone(),
            user: secret.user,
            password: secret.password,
        };
        self.http.post("/v1/databases", &body).await
    }
}

pub struct RemoteWorkload {
    http: HttpService,
}

impl RemoteWorkload {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            http: HttpService::new(client, base_url, "workload"),
        }
    }
}

#[async_trait]
impl TenantWorkload for RemoteWorkload {
    async fn pause_writes(&self, tenant_id: &str) -> CollaboratorResult<()> {
        self.http
            .post(&format!("/v1/tenants/{tenant_id}/pause"), &serde_json::json!({}))
            .await
    }

    async fn resume_writes(
        &self,
        tenant_id: &str,
        repoint: Option<Repoint>,
    ) -> CollaboratorResult<()> {
        let repoint = match repoint {
            Some(r) => {
                let secret = r.credentials.take()?;
                Some(RepointBody {
                    host: r.endpoint.host,
                    port: r.endpoint.port,
                    database_name: r.database_name,
                    user: secret.user,
                    password: secret.password,
                })
            }
            None => None,
        };
        self.http
            .post(&format!("/v1/tenants/{tenant_id}/resume"), &ResumeBody { repoint })
            .await
    }
}

pub struct RemoteMover {
    http: HttpService,
}

impl RemoteMover {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            http: HttpService::new(client, base_url, "mover"),
        }
    }
}

#[async_trait]
impl DataMover for RemoteMover {
    async fn export(
        &self,
        tenant_id: &str,
        source: &DatabaseLocation,
    ) -> CollaboratorResult<SnapshotRef> {
        let body = ExportBody {
            tenant_id: tenant_id.to_string(),
            source: source.clone(),
        };
        self.http.post_json("/v1/exports", &body).await
    }

    async fn import(&self, snapshot: &SnapshotRef, target: &DatabaseLocation) -> CollaboratorResult<()> {
        let body = ImportBody {
            snapshot: snapshot.clone(),
            target: target.clone(),
        };
        self.http.post("/v1/imports", &body).await
    }

    async fn verify(
        &self,
        source: &DatabaseLocation,
        target: &DatabaseLocation,
    ) -> CollaboratorResult<VerifyReport> {
        let body = VerifyBody {
            source: source.clone(),
            target: target.clone(),
        };
        self.http.post_json("/v1/verifications", &body).await
    }
}

pub struct RemoteEntitlements {
    http: HttpService,
}

impl RemoteEntitlements {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            http: HttpService::new(client, base_url, "entitlements"),
        }
    }
}

#[async_trait]
impl EntitlementSource for RemoteEntitlements {
    async fn entitlement(&self, customer_id: &str) -> CollaboratorResult<Entitlement> {
        self.http
            .get_json(&format!("/v1/customers/{customer_id}/entitlement"))
            .await
    }

    /// A billing service without the version endpoint answers 404; the
    /// cache then falls back to its TTL.
    async fn version(&self, customer_id: &str) -> CollaboratorResult<Option<String>> {
        let body: Option<VersionBody> = self
            .http
            .find_json(&format!("/v1/customers/{customer_id}/entitlement/version"))
            .await?;
        Ok(body.and_then(|b| b.version))
    }
}
