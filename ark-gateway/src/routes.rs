//! Axum route handlers for the Ark control plane.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ark_core::{LifecycleState, PortForward, Protocol, SubsystemTag, VmName, VmSpec};
use ark_executor::{
    ExecutorError, InstanceSummary, SubsystemBackend, SubsystemReport, TeardownFailure, VmOrchestrator,
};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::GatewayError;

// ── Shared state ─────────────────────────────────────────────────────────────

/// State shared by every handler.
pub struct AppState<B: SubsystemBackend> {
    pub orchestrator: Arc<VmOrchestrator<B>>,
    /// How long a lifecycle request waits before answering `202 Accepted`.
    pub request_timeout: Duration,
}

impl<B: SubsystemBackend> AppState<B> {
    #[must_use]
    pub fn new(orchestrator: Arc<VmOrchestrator<B>>, request_timeout: Duration) -> Self {
        Self { orchestrator, request_timeout }
    }
}

impl<B: SubsystemBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: Arc::clone(&self.orchestrator),
            request_timeout: self.request_timeout,
        }
    }
}

// ── Request / response types ──────────────────────────────────────────────────

/// A size given either as plain MiB or as a string with a unit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SizeField {
    Mib(u64),
    Text(String),
}

impl SizeField {
    fn as_text(&self) -> String {
        match self {
            Self::Mib(mib) => mib.to_string(),
            Self::Text(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardBody {
    pub internal_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    pub external_addr: SocketAddr,
}

fn default_protocol() -> Protocol {
    Protocol::Tcp
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateVmBody {
    pub name: String,
    pub memory: SizeField,
    pub cpus: u32,
    pub disk_size: SizeField,
    pub image_path: String,
    #[serde(default)]
    pub port_forwards: Vec<PortForwardBody>,
}

impl CreateVmBody {
    /// Validate into a [`VmSpec`].
    ///
    /// # Errors
    /// Returns [`ExecutorError::Validation`] for any invalid field.
    pub fn into_spec(self) -> Result<VmSpec, ExecutorError> {
        let forwards = self
            .port_forwards
            .into_iter()
            .map(|f| PortForward {
                internal_port: f.internal_port,
                protocol: f.protocol,
                external_addr: f.external_addr,
            })
            .collect();
        let spec = VmSpec::parse(
            &self.name,
            &self.memory.as_text(),
            self.cpus,
            &self.disk_size.as_text(),
            &self.image_path,
        )?
        .with_port_forwards(forwards)?;
        Ok(spec)
    }
}

#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub name: VmName,
    pub state: LifecycleState,
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub name: VmName,
    pub state: LifecycleState,
    pub in_progress: bool,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub name: VmName,
    pub state: LifecycleState,
    pub teardown_failures: Vec<TeardownFailure>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub name: VmName,
    pub state: LifecycleState,
    pub last_error: Option<String>,
    /// Health per subsystem kind.
    pub subsystems: IndexMap<SubsystemTag, bool>,
    pub details: Vec<SubsystemReport>,
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Build the application router.
pub fn create_router<B: SubsystemBackend>(state: AppState<B>) -> Router {
    Router::new()
        .route("/vm", get(list_vms::<B>))
        .route("/vm/create", post(create_vm::<B>))
        .route("/vm/start/{name}", post(start_vm::<B>))
        .route("/vm/stop/{name}", post(stop_vm::<B>))
        .route("/vm/retry/{name}", post(retry_vm::<B>))
        .route("/vm/status/{name}", get(vm_status::<B>))
        .route("/vm/migrate/{name}", post(migrate_vm::<B>))
        .route("/vm/{name}", delete(purge_vm::<B>))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// `GET /health`: liveness probe.
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// `POST /vm/create`: register a VM and bring it to READY.
///
/// # Errors
/// Returns 400 for an invalid body, 409 if the name exists, and the
/// transition's error if creation fails.
pub async fn create_vm<B: SubsystemBackend>(
    State(state): State<AppState<B>>,
    body: Result<Json<CreateVmBody>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let Json(body) = body.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let spec = body.into_spec()?;
    let name = spec.name.clone();

    let orchestrator = Arc::clone(&state.orchestrator);
    bounded(&state, &name, StatusCode::CREATED, orchestrator.create(spec)).await
}

/// `POST /vm/retry/{name}`: run creation again on a FAILED VM.
///
/// # Errors
/// Returns 404 for unknown names and 409 unless the VM is FAILED.
pub async fn retry_vm<B: SubsystemBackend>(
    State(state): State<AppState<B>>,
    Path(name): Path<String>,
) -> Result<Response, GatewayError> {
    let name = parse_name(name)?;
    bounded(&state, &name, StatusCode::OK, state.orchestrator.retry(&name)).await
}

/// `POST /vm/start/{name}`: resume a READY VM and attach its network.
///
/// # Errors
/// Returns 404 for unknown names, 409 unless the VM is READY, and the
/// transition's error if starting fails.
pub async fn start_vm<B: SubsystemBackend>(
    State(state): State<AppState<B>>,
    Path(name): Path<String>,
) -> Result<Response, GatewayError> {
    let name = parse_name(name)?;
    bounded(&state, &name, StatusCode::OK, state.orchestrator.start(&name)).await
}

/// `POST /vm/stop/{name}`: tear down a VM's subsystems.
///
/// # Errors
/// Returns 404 for unknown names and 409 while another transition runs.
pub async fn stop_vm<B: SubsystemBackend>(
    State(state): State<AppState<B>>,
    Path(name): Path<String>,
) -> Result<Json<StopResponse>, GatewayError> {
    let name = parse_name(name)?;
    let outcome = state.orchestrator.stop(&name).await?;
    Ok(Json(StopResponse {
        name,
        state: outcome.state,
        teardown_failures: outcome.teardown.failures,
    }))
}

/// `GET /vm/status/{name}`: point-in-time liveness snapshot.
///
/// # Errors
/// Returns 404 for unknown names.
pub async fn vm_status<B: SubsystemBackend>(
    State(state): State<AppState<B>>,
    Path(name): Path<String>,
) -> Result<Json<StatusResponse>, GatewayError> {
    let name = parse_name(name)?;
    let status = state.orchestrator.status(&name)?;
    Ok(Json(StatusResponse {
        subsystems: status.health(),
        name: status.name,
        state: status.state,
        last_error: status.last_error,
        details: status.subsystems,
    }))
}

/// `POST /vm/migrate/{name}`: not supported; always 501.
pub async fn migrate_vm<B: SubsystemBackend>(
    State(state): State<AppState<B>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    (StatusCode::NOT_IMPLEMENTED, Json(state.orchestrator.migrate(&name)))
}

/// `DELETE /vm/{name}`: forget a STOPPED or FAILED VM.
///
/// # Errors
/// Returns 404 for unknown names and 409 for VMs that are not terminal.
pub async fn purge_vm<B: SubsystemBackend>(
    State(state): State<AppState<B>>,
    Path(name): Path<String>,
) -> Result<StatusCode, GatewayError> {
    let name = parse_name(name)?;
    state.orchestrator.purge(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /vm`: every registered VM in creation order.
pub async fn list_vms<B: SubsystemBackend>(State(state): State<AppState<B>>) -> Json<Vec<InstanceSummary>> {
    Json(state.orchestrator.list())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Path names that fail validation cannot be registered, so they are
/// reported as unknown rather than as a bad request.
fn parse_name(raw: String) -> Result<VmName, GatewayError> {
    VmName::new(raw.clone()).map_err(|_| GatewayError::UnknownVm(raw))
}

/// Await a transition for at most the request timeout.
///
/// The transition runs on its own task, so when the timeout fires the
/// handler answers `202 Accepted` with the current state and the work
/// carries on.
async fn bounded<B, F>(
    state: &AppState<B>,
    name: &VmName,
    success: StatusCode,
    transition: F,
) -> Result<Response, GatewayError>
where
    B: SubsystemBackend,
    F: std::future::Future<Output = Result<LifecycleState, ExecutorError>>,
{
    match tokio::time::timeout(state.request_timeout, transition).await {
        Ok(result) => {
            let lifecycle = result?;
            Ok((success, Json(StateResponse { name: name.clone(), state: lifecycle })).into_response())
        }
        Err(_) => {
            let current = state.orchestrator.status(name)?.state;
            tracing::info!(vm = %name, state = %current, "request timed out, transition continues");
            Ok((
                StatusCode::ACCEPTED,
                Json(AcceptedResponse { name: name.clone(), state: current, in_progress: true }),
            )
                .into_response())
        }
    }
}
