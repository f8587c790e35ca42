//! Lifecycle controller (C5): orchestrates registry, engine, and session
//! table; enforces security policy; returns normalized outcomes (§4.5).

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::engine::{ContainerState, EngineError, ExecCommand, RunOptions};
use crate::error::AppError;
use crate::registry::NetworkMode;
use crate::session::SessionRecord;
use crate::state::AppState;

const TTYD_CONTAINER_PORT: u16 = 7681;
const WORKSPACE_DIR: &str = "/workspace";
const CODE_FILE: &str = "/workspace/code.py";

#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub container_name: String,
    pub code: Option<String>,
    pub command: Option<String>,
    pub timeout: Option<Duration>,
    pub keep_alive: bool,
    pub ttl_seconds: Option<u64>,
    pub enable_ttyd: bool,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecutionResult {
    fn from_output(output: crate::engine::ExecOutput, max_len: usize) -> Self {
        Self {
            exit_code: output.exit_code,
            stdout: truncate(&String::from_utf8_lossy(&output.stdout), max_len),
            stderr: truncate(&String::from_utf8_lossy(&output.stderr), max_len),
        }
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        s.chars().take(max_len).collect()
    }
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub persistent: bool,
    pub ttl_seconds: u64,
    pub ttyd_url: Option<String>,
    pub network_override: bool,
}

impl From<&SessionRecord> for SessionInfo {
    fn from(record: &SessionRecord) -> Self {
        Self {
            session_id: record.session_id.clone(),
            persistent: record.persistent,
            ttl_seconds: record.ttl_seconds,
            ttyd_url: record.ttyd_url.clone(),
            network_override: record.network_override,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub container_id: String,
    pub execution: Option<ExecutionResult>,
    pub session: Option<SessionInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Stopped,
    AlreadyStopped,
    ErrorButCleaned(String),
    NoDocker,
}

impl StopOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::AlreadyStopped => "already_stopped",
            Self::ErrorButCleaned(_) => "error_but_cleaned",
            Self::NoDocker => "no_docker",
        }
    }
}

/// Start a sandbox session (§4.5.1).
pub async fn start(state: &AppState, req: StartRequest) -> Result<StartOutcome, AppError> {
    let Some(profile) = state.registry.get(&req.container_name).await else {
        return Err(AppError::ProfileNotAllowed(req.container_name));
    };

    if !state.engine.ping().await {
        return Err(AppError::EngineUnavailable);
    }

    state.engine.build_if_declared(&profile).await;

    let mut options = RunOptions::from_profile(&profile);
    let mut network_override = false;
    if req.enable_ttyd {
        options.publish_ports.insert(TTYD_CONTAINER_PORT, 0);
        if options.network_mode == NetworkMode::None {
            options.network_mode = NetworkMode::Default;
            network_override = true;
        }
    }

    let start_timeout = req.timeout.unwrap_or(state.config.start_timeout);
    let container_id = match tokio::time::timeout(start_timeout, state.engine.run(options)).await {
        Ok(Ok(id)) => id,
        Ok(Err(e)) => {
            return Err(match e {
                EngineError::ImageMissing(image) => AppError::ImageMissing(image),
                other => AppError::StartFailed(other.to_string()),
            });
        }
        Err(_) => {
            return Err(AppError::StartFailed(format!(
                "container start timed out after {start_timeout:?}"
            )));
        }
    };

    let ttl_seconds = state.config.clamp_ttl(req.ttl_seconds).as_secs();
    let mut record = SessionRecord {
        container_id: container_id.clone(),
        session_id: String::new(),
        profile_name: req.container_name.clone(),
        profile: profile.clone(),
        persistent: req.keep_alive,
        ttl_seconds,
        started_at: Utc::now(),
        last_activity: Utc::now(),
        ttyd_enabled: req.enable_ttyd,
        ttyd_host_port: None,
        ttyd_url: None,
        network_override,
    };

    if req.enable_ttyd {
        bring_up_ttyd(state, &container_id, &mut record).await;
    }

    let record = state.sessions.insert(record).await;

    let execution_result = if let Some(code) = &req.code {
        run_code(state, &container_id, code).await.map(Some)
    } else if let Some(command) = &req.command {
        run_command(state, &container_id, command).await.map(Some)
    } else {
        Ok(None)
    };

    // One-shot collapse (§4.5.1 step 10a): a non-persistent start is fully
    // cleaned up before the response returns, whether or not anything ran
    // and even if the execution itself failed (invariant I3 — no orphaned
    // container or record survives a non-persistent start).
    if !req.keep_alive {
        let grace = state.config.stop_grace;
        let _ = state.engine.stop(&container_id, grace).await;
        let _ = state.engine.remove(&container_id).await;
        state.sessions.remove(&container_id).await;

        return Ok(StartOutcome {
            container_id,
            execution: execution_result?,
            session: None,
        });
    }

    Ok(StartOutcome {
        container_id,
        execution: execution_result?,
        session: Some(SessionInfo::from(&record)),
    })
}

async fn bring_up_ttyd(state: &AppState, container_id: &str, record: &mut SessionRecord) {
    let argv = vec![
        "ttyd".to_string(),
        "-W".to_string(),
        "-p".to_string(),
        TTYD_CONTAINER_PORT.to_string(),
        "bash".to_string(),
    ];

    if let Err(e) = state.engine.exec_detached(container_id, &argv, "root").await {
        warn!(container = %container_id, error = %e, "ttyd bring-up: exec_detached failed");
        return;
    }
    if let Err(e) = state.engine.reload(container_id).await {
        warn!(container = %container_id, error = %e, "ttyd bring-up: reload failed");
        return;
    }
    match state.engine.host_port_of(container_id, TTYD_CONTAINER_PORT).await {
        Ok(Some(port)) => {
            record.ttyd_host_port = Some(port);
            record.ttyd_url = Some(format!("http://0.0.0.0:{port}"));
        }
        Ok(None) => warn!(container = %container_id, "ttyd bring-up: no published port found"),
        Err(e) => warn!(container = %container_id, error = %e, "ttyd bring-up: host_port_of failed"),
    }
}

async fn run_code(state: &AppState, container_id: &str, code: &str) -> Result<ExecutionResult, AppError> {
    state
        .engine
        .inject_file(container_id, CODE_FILE, code.as_bytes())
        .await
        .map_err(|e| AppError::StartFailed(e.to_string()))?;

    let output = state
        .engine
        .exec(
            container_id,
            ExecCommand::Argv(vec!["python".to_string(), CODE_FILE.to_string()]),
            WORKSPACE_DIR,
            state.config.exec_timeout,
        )
        .await
        .map_err(|e| AppError::StartFailed(e.to_string()))?;

    Ok(ExecutionResult::from_output(output, state.config.max_output_length))
}

async fn run_command(state: &AppState, container_id: &str, command: &str) -> Result<ExecutionResult, AppError> {
    let output = state
        .engine
        .exec(
            container_id,
            ExecCommand::Shell(command.to_string()),
            WORKSPACE_DIR,
            state.config.exec_timeout,
        )
        .await
        .map_err(|e| AppError::StartFailed(e.to_string()))?;

    Ok(ExecutionResult::from_output(output, state.config.max_output_length))
}

/// Exec into a tracked session (§4.5.2).
pub async fn exec(
    state: &AppState,
    container_id: &str,
    command: &str,
    timeout: Option<Duration>,
) -> Result<ExecutionResult, AppError> {
    if state.sessions.lookup(container_id).await.is_none() {
        return Err(AppError::SessionNotFound(container_id.to_string()));
    }

    // Touch first: extends liveness even if the exec itself later fails.
    state.sessions.touch(container_id).await;

    let result = state
        .engine
        .exec(
            container_id,
            ExecCommand::Shell(command.to_string()),
            WORKSPACE_DIR,
            timeout.unwrap_or(state.config.exec_timeout),
        )
        .await;

    match result {
        Ok(output) => Ok(ExecutionResult::from_output(output, state.config.max_output_length)),
        Err(EngineError::NotFound(_)) => {
            state.sessions.remove(container_id).await;
            Err(AppError::SessionGone(container_id.to_string()))
        }
        Err(e) => Err(AppError::ExecFailed(e.to_string())),
    }
}

/// Stop a tracked container (§4.5.3). Never surfaces an error solely
/// because the container is already gone.
pub async fn stop(state: &AppState, container_id: &str) -> StopOutcome {
    if !state.engine.ping().await {
        state.sessions.remove(container_id).await;
        return StopOutcome::NoDocker;
    }

    let classification = state.engine.container_state(container_id).await;
    let outcome = match classification {
        Ok(ContainerState::Running) => {
            let stop_res = state.engine.stop(container_id, state.config.stop_grace).await;
            let remove_res = state.engine.remove(container_id).await;
            match (stop_res, remove_res) {
                (Ok(()), Ok(())) => StopOutcome::Stopped,
                (Err(e), _) | (_, Err(e)) => StopOutcome::ErrorButCleaned(e.to_string()),
            }
        }
        Ok(ContainerState::Exited | ContainerState::Dead) => {
            match state.engine.remove(container_id).await {
                Ok(()) => StopOutcome::Stopped,
                Err(e) => StopOutcome::ErrorButCleaned(e.to_string()),
            }
        }
        Ok(ContainerState::NotFound) => StopOutcome::AlreadyStopped,
        Err(e) => StopOutcome::ErrorButCleaned(e.to_string()),
    };

    state.sessions.remove(container_id).await;
    info!(container = %container_id, outcome = outcome.as_str(), "stop completed");
    outcome
}

/// Extend a session's TTL (§4.5.4).
pub async fn extend(state: &AppState, session_id: &str, delta_seconds: u64) -> Result<u64, AppError> {
    state
        .sessions
        .extend(session_id, delta_seconds, state.config.max_session_ttl.as_secs())
        .await
        .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))
}

/// Close a session by its `session_id` (§4.5.5).
pub async fn close(state: &AppState, session_id: &str) -> Result<(), AppError> {
    let Some((container_id, _)) = state.sessions.by_session(session_id).await else {
        return Err(AppError::SessionNotFound(session_id.to_string()));
    };

    stop(state, &container_id).await;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub record: SessionRecord,
    pub remaining_seconds: u64,
}

/// Build the status view, purging any record whose underlying container no
/// longer exists in the same pass (§4.5.6).
pub async fn status(state: &AppState) -> Vec<SessionStatus> {
    let now = Utc::now();
    let mut out = Vec::new();
    for record in state.sessions.snapshot().await {
        match state.engine.container_state(&record.container_id).await {
            Ok(ContainerState::NotFound) => {
                state.sessions.remove(&record.container_id).await;
            }
            _ => {
                let remaining_seconds = record.remaining_seconds(now);
                out.push(SessionStatus { record, remaining_seconds });
            }
        }
    }
    out
}

pub async fn get_session(state: &AppState, session_id: &str) -> Result<SessionStatus, AppError> {
    let (container_id, record) = state
        .sessions
        .by_session(session_id)
        .await
        .ok_or_else(|| AppError::SessionNotFound(session_id.to_string()))?;

    if matches!(
        state.engine.container_state(&container_id).await,
        Ok(ContainerState::NotFound)
    ) {
        state.sessions.remove(&container_id).await;
        return Err(AppError::SessionGone(session_id.to_string()));
    }

    let remaining_seconds = record.remaining_seconds(Utc::now());
    Ok(SessionStatus { record, remaining_seconds })
}

/// Administrative sweep: stop+remove+untrack every tracked record (§4.5.7).
pub async fn cleanup_all(state: &AppState) -> Vec<String> {
    let records = state.sessions.snapshot().await;
    let mut stopped = Vec::new();
    for record in records {
        let outcome = stop(state, &record.container_id).await;
        if matches!(outcome, StopOutcome::Stopped | StopOutcome::AlreadyStopped) {
            stopped.push(record.container_id);
        }
    }
    stopped
}
