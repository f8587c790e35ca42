//! Container engine abstraction (C2).
//!
//! [`SandboxEngine`] is a capability-set trait over the host container
//! engine: run, exec, stop, remove, file-inject, port-lookup. The only
//! production implementation is [`docker::DockerEngine`]; a test double
//! implementing the same surface is enough to drive the entire lifecycle
//! controller without a real Docker socket.

pub mod docker;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::registry::{NetworkMode, SandboxProfile};

/// Options shaping a `run` call, assembled by the controller from a
/// [`SandboxProfile`] plus the per-request overrides (ttyd, etc).
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub image: String,
    pub detach: bool,
    pub tty: bool,
    pub stdin_open: bool,
    pub network_mode: NetworkMode,
    pub memory: Option<String>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<i64>,
    pub read_only: bool,
    /// container_port -> host_port (0 = let the engine pick one)
    pub publish_ports: HashMap<u16, u16>,
}

impl RunOptions {
    /// Base options for a profile, before any per-request overrides are
    /// layered on (§4.5.1 step 3).
    pub fn from_profile(profile: &SandboxProfile) -> Self {
        let cpu_period = 100_000;
        let cpu_quota = profile.resources.cpus.map(|c| (c * cpu_period as f64) as i64);
        Self {
            image: profile.image_ref(),
            detach: true,
            tty: true,
            stdin_open: true,
            network_mode: profile.security.network_mode,
            memory: profile.resources.memory.clone(),
            cpu_quota,
            cpu_period: Some(cpu_period),
            read_only: profile.security.read_only,
            publish_ports: HashMap::new(),
        }
    }
}

/// What to run inside an exec call: either an argv vector or a raw shell
/// string the engine wraps in `sh -c`.
#[derive(Debug, Clone)]
pub enum ExecCommand {
    Argv(Vec<String>),
    Shell(String),
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// The engine's own notion of a container's liveness, as observed by
/// inspecting it. This is the vocabulary `stop`'s classification (§4.5.3)
/// switches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Dead,
    NotFound,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("container engine is unavailable")]
    Unavailable,
    #[error("image not present: {0}")]
    ImageMissing(String),
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine error: {0}")]
    Other(String),
}

/// Capability-set interface over the host container engine.
///
/// All operations are async and may take seconds; callers are responsible
/// for applying their own timeouts where the spec calls for one (start,
/// exec). The engine itself enforces the `stop` grace period.
#[async_trait]
pub trait SandboxEngine: Send + Sync {
    /// Whether the engine is reachable. Never retries eagerly — a lazily
    /// initialized implementation caches "unavailable" after the first
    /// failed connect/ping.
    async fn ping(&self) -> bool;

    /// Best-effort build from `profile.build_context`, if declared and
    /// present. Failures are logged and swallowed by the implementation —
    /// the existing tagged image may still work.
    async fn build_if_declared(&self, profile: &SandboxProfile);

    async fn run(&self, options: RunOptions) -> Result<String, EngineError>;

    /// Atomic write of a file into the container's workspace via a
    /// transactional archive upload — never a shell heredoc.
    async fn inject_file(
        &self,
        container_id: &str,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), EngineError>;

    async fn exec(
        &self,
        container_id: &str,
        command: ExecCommand,
        workdir: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, EngineError>;

    /// Fire-and-forget exec, used to start in-container daemons (ttyd).
    async fn exec_detached(
        &self,
        container_id: &str,
        argv: &[String],
        as_user: &str,
    ) -> Result<(), EngineError>;

    /// Refresh published ports after a daemon launch inside the container.
    async fn reload(&self, container_id: &str) -> Result<(), EngineError>;

    async fn host_port_of(
        &self,
        container_id: &str,
        container_port: u16,
    ) -> Result<Option<u16>, EngineError>;

    /// Tolerant to "already gone" — returns `Ok(())` in that case.
    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), EngineError>;

    /// Tolerant to "already gone" — returns `Ok(())` in that case.
    async fn remove(&self, container_id: &str) -> Result<(), EngineError>;

    async fn container_state(&self, container_id: &str) -> Result<ContainerState, EngineError>;
}
