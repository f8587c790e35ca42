//! API surface (C6): maps the external JSON/HTTP request-response shapes
//! onto the lifecycle controller (§6). Handlers are thin — deserialize,
//! call into `controller`, map the result through `AppError`'s
//! `IntoResponse` impl, serialize the success value.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::controller::{self, ExecutionResult, SessionInfo, SessionStatus, StartRequest, StopOutcome};
use crate::error::AppError;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/containers", get(list_containers))
        .route("/containers/start", post(start_container))
        .route("/containers/exec", post(exec_container))
        .route("/containers/stop", post(stop_container))
        .route("/containers/status", get(container_status))
        .route("/containers/cleanup", post(cleanup_containers))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/extend", post(extend_session))
        .route("/sessions/:id", delete(close_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    docker: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let docker = if state.engine.ping().await {
        "connected"
    } else {
        "unavailable"
    };
    Json(HealthResponse {
        status: "ok",
        service: "sandbox-session-manager",
        docker,
    })
}

#[derive(Serialize)]
struct ContainerListing {
    name: String,
    description: String,
    triggers: Vec<String>,
    needs_confirm: bool,
}

#[derive(Serialize)]
struct ContainersResponse {
    containers: Vec<ContainerListing>,
    count: usize,
}

async fn list_containers(State(state): State<AppState>) -> Json<ContainersResponse> {
    let containers: Vec<ContainerListing> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|p| ContainerListing {
            name: p.name,
            description: p.description,
            triggers: p.triggers,
            needs_confirm: p.security.needs_confirm,
        })
        .collect();
    Json(ContainersResponse {
        count: containers.len(),
        containers,
    })
}

#[derive(Deserialize)]
struct StartContainerRequest {
    container_name: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    keep_alive: bool,
    #[serde(default)]
    ttl_seconds: Option<u64>,
    #[serde(default)]
    enable_ttyd: bool,
}

#[derive(Serialize)]
struct ExecutionResultBody {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl From<ExecutionResult> for ExecutionResultBody {
    fn from(r: ExecutionResult) -> Self {
        Self {
            exit_code: r.exit_code,
            stdout: r.stdout,
            stderr: r.stderr,
        }
    }
}

#[derive(Serialize)]
struct SessionBody {
    session_id: String,
    persistent: bool,
    ttl_seconds: u64,
    ttyd_url: Option<String>,
    network_override: bool,
}

impl From<SessionInfo> for SessionBody {
    fn from(s: SessionInfo) -> Self {
        Self {
            session_id: s.session_id,
            persistent: s.persistent,
            ttl_seconds: s.ttl_seconds,
            ttyd_url: s.ttyd_url,
            network_override: s.network_override,
        }
    }
}

#[derive(Serialize)]
struct StartResponse {
    container_id: String,
    execution_result: Option<ExecutionResultBody>,
    session: Option<SessionBody>,
}

async fn start_container(
    State(state): State<AppState>,
    Json(req): Json<StartContainerRequest>,
) -> Result<Json<StartResponse>, AppError> {
    let outcome = controller::start(
        &state,
        StartRequest {
            container_name: req.container_name,
            code: req.code,
            command: req.command,
            timeout: req.timeout.map(Duration::from_secs),
            keep_alive: req.keep_alive,
            ttl_seconds: req.ttl_seconds,
            enable_ttyd: req.enable_ttyd,
        },
    )
    .await?;

    Ok(Json(StartResponse {
        container_id: outcome.container_id,
        execution_result: outcome.execution.map(Into::into),
        session: outcome.session.map(Into::into),
    }))
}

#[derive(Deserialize)]
struct ExecRequest {
    container_id: String,
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
}

async fn exec_container(
    State(state): State<AppState>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<ExecutionResultBody>, AppError> {
    let timeout = req.timeout.map(Duration::from_secs);
    let result = controller::exec(&state, &req.container_id, &req.command, timeout).await?;
    Ok(Json(result.into()))
}

#[derive(Deserialize)]
struct StopRequest {
    container_id: String,
}

#[derive(Serialize)]
struct StopResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

async fn stop_container(
    State(state): State<AppState>,
    Json(req): Json<StopRequest>,
) -> Json<StopResponse> {
    let outcome = controller::stop(&state, &req.container_id).await;
    let message = match &outcome {
        StopOutcome::ErrorButCleaned(msg) => Some(msg.clone()),
        _ => None,
    };
    Json(StopResponse {
        status: outcome.as_str(),
        message,
    })
}

#[derive(Serialize)]
struct ActiveContainer {
    container_id: String,
    session_id: String,
    profile_name: String,
    persistent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<SessionSummary>,
}

#[derive(Serialize)]
struct SessionSummary {
    ttl_seconds: u64,
    remaining_seconds: u64,
    ttyd_url: Option<String>,
    network_override: bool,
}

fn to_active_container(s: SessionStatus) -> ActiveContainer {
    let session = s.record.persistent.then(|| SessionSummary {
        ttl_seconds: s.record.ttl_seconds,
        remaining_seconds: s.remaining_seconds,
        ttyd_url: s.record.ttyd_url.clone(),
        network_override: s.record.network_override,
    });
    ActiveContainer {
        container_id: s.record.container_id.clone(),
        session_id: s.record.session_id.clone(),
        profile_name: s.record.profile_name.clone(),
        persistent: s.record.persistent,
        session,
    }
}

#[derive(Serialize)]
struct ContainerStatusResponse {
    active_containers: Vec<ActiveContainer>,
    count: usize,
}

async fn container_status(State(state): State<AppState>) -> Json<ContainerStatusResponse> {
    let active_containers: Vec<ActiveContainer> =
        controller::status(&state).await.into_iter().map(to_active_container).collect();
    Json(ContainerStatusResponse {
        count: active_containers.len(),
        active_containers,
    })
}

#[derive(Serialize)]
struct CleanupResponse {
    stopped: Vec<String>,
    count: usize,
}

async fn cleanup_containers(State(state): State<AppState>) -> Json<CleanupResponse> {
    let stopped = controller::cleanup_all(&state).await;
    Json(CleanupResponse {
        count: stopped.len(),
        stopped,
    })
}

#[derive(Serialize)]
struct SessionsResponse {
    sessions: Vec<ActiveContainer>,
    count: usize,
}

async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    let sessions: Vec<ActiveContainer> = controller::status(&state)
        .await
        .into_iter()
        .filter(|s| s.record.persistent)
        .map(to_active_container)
        .collect();
    Json(SessionsResponse {
        count: sessions.len(),
        sessions,
    })
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActiveContainer>, AppError> {
    let status = controller::get_session(&state, &id).await?;
    Ok(Json(to_active_container(status)))
}

#[derive(Deserialize)]
struct ExtendRequest {
    extend_seconds: u64,
}

#[derive(Serialize)]
struct ExtendResponse {
    new_ttl: u64,
}

async fn extend_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExtendRequest>,
) -> Result<Json<ExtendResponse>, AppError> {
    let new_ttl = controller::extend(&state, &id, req.extend_seconds).await?;
    Ok(Json(ExtendResponse { new_ttl }))
}

#[derive(Serialize)]
struct CloseResponse {
    status: &'static str,
}

async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CloseResponse>, AppError> {
    controller::close(&state, &id).await?;
    Ok(Json(CloseResponse { status: "closed" }))
}
