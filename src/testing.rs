//! Test-only support: a `SandboxEngine` double driven entirely in memory,
//! so the controller, reaper, and HTTP layer can be exercised without a
//! Docker daemon (design notes, §9: "a test double implementing the same
//! surface must be sufficient to drive the entire core").

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::engine::{ContainerState, EngineError, ExecCommand, ExecOutput, RunOptions, SandboxEngine};
use crate::registry::SandboxProfile;

pub fn test_profile(name: &str) -> SandboxProfile {
    SandboxProfile {
        name: name.to_string(),
        description: format!("{name} test profile"),
        triggers: vec![name.to_string()],
        image: Some(format!("sandbox-{name}:latest")),
        build_context: None,
        security: Default::default(),
        resources: Default::default(),
    }
}

#[derive(Debug, Clone)]
struct FakeContainer {
    state: ContainerState,
    stopped: bool,
    injected_files: Vec<(String, Vec<u8>)>,
    exec_calls: usize,
}

/// In-memory stand-in for a container engine. Configurable failure modes
/// let tests exercise `ImageMissing`, `EngineUnavailable`, and "container
/// vanished beneath us" paths deterministically.
pub struct FakeEngine {
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicUsize,
    pub available: std::sync::atomic::AtomicBool,
    pub fail_images: Mutex<Vec<String>>,
    /// Canned exec result returned by every `exec` call unless overridden.
    pub exec_result: Mutex<ExecOutput>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            available: std::sync::atomic::AtomicBool::new(true),
            fail_images: Mutex::new(Vec::new()),
            exec_result: Mutex::new(ExecOutput {
                exit_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            }),
        }
    }

    pub fn set_unavailable(&self) {
        self.available.store(false, Ordering::SeqCst);
    }

    pub async fn fail_image(&self, image: &str) {
        self.fail_images.lock().await.push(image.to_string());
    }

    pub async fn set_exec_result(&self, result: ExecOutput) {
        *self.exec_result.lock().await = result;
    }

    /// Register a container as already running, bypassing `run` — used by
    /// reaper tests that only care about the stop/remove path.
    pub async fn track_running(&self, container_id: &str) {
        self.containers.lock().await.insert(
            container_id.to_string(),
            FakeContainer {
                state: ContainerState::Running,
                stopped: false,
                injected_files: Vec::new(),
                exec_calls: 0,
            },
        );
    }

    pub async fn was_stopped(&self, container_id: &str) -> bool {
        self.containers
            .lock()
            .await
            .get(container_id)
            .map(|c| c.stopped)
            .unwrap_or(false)
    }

    pub async fn contains(&self, container_id: &str) -> bool {
        self.containers.lock().await.contains_key(container_id)
    }

    pub async fn injected_files(&self, container_id: &str) -> Vec<(String, Vec<u8>)> {
        self.containers
            .lock()
            .await
            .get(container_id)
            .map(|c| c.injected_files.clone())
            .unwrap_or_default()
    }

    pub async fn exec_call_count(&self, container_id: &str) -> usize {
        self.containers
            .lock()
            .await
            .get(container_id)
            .map(|c| c.exec_calls)
            .unwrap_or(0)
    }
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxEngine for FakeEngine {
    async fn ping(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn build_if_declared(&self, _profile: &SandboxProfile) {}

    async fn run(&self, options: RunOptions) -> Result<String, EngineError> {
        if !self.ping().await {
            return Err(EngineError::Unavailable);
        }
        if self.fail_images.lock().await.contains(&options.image) {
            return Err(EngineError::ImageMissing(options.image));
        }

        let id = format!("fake{:08x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().await.insert(
            id.clone(),
            FakeContainer {
                state: ContainerState::Running,
                stopped: false,
                injected_files: Vec::new(),
                exec_calls: 0,
            },
        );
        Ok(id)
    }

    async fn inject_file(
        &self,
        container_id: &str,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), EngineError> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::NotFound(container_id.to_string()))?;
        container.injected_files.push((path.to_string(), bytes.to_vec()));
        Ok(())
    }

    async fn exec(
        &self,
        container_id: &str,
        _command: ExecCommand,
        _workdir: &str,
        _timeout: Duration,
    ) -> Result<ExecOutput, EngineError> {
        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| EngineError::NotFound(container_id.to_string()))?;
        if container.state != ContainerState::Running {
            return Err(EngineError::NotFound(container_id.to_string()));
        }
        container.exec_calls += 1;
        Ok(self.exec_result.lock().await.clone())
    }

    async fn exec_detached(
        &self,
        container_id: &str,
        _argv: &[String],
        _as_user: &str,
    ) -> Result<(), EngineError> {
        if self.containers.lock().await.contains_key(container_id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(container_id.to_string()))
        }
    }

    async fn reload(&self, container_id: &str) -> Result<(), EngineError> {
        if self.containers.lock().await.contains_key(container_id) {
            Ok(())
        } else {
            Err(EngineError::NotFound(container_id.to_string()))
        }
    }

    async fn host_port_of(
        &self,
        container_id: &str,
        container_port: u16,
    ) -> Result<Option<u16>, EngineError> {
        if self.containers.lock().await.contains_key(container_id) {
            Ok(Some(30000 + container_port % 1000))
        } else {
            Err(EngineError::NotFound(container_id.to_string()))
        }
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> Result<(), EngineError> {
        let mut containers = self.containers.lock().await;
        if let Some(container) = containers.get_mut(container_id) {
            container.stopped = true;
            container.state = ContainerState::Exited;
        }
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<(), EngineError> {
        self.containers.lock().await.remove(container_id);
        Ok(())
    }

    async fn container_state(&self, container_id: &str) -> Result<ContainerState, EngineError> {
        Ok(self
            .containers
            .lock()
            .await
            .get(container_id)
            .map(|c| c.state)
            .unwrap_or(ContainerState::NotFound))
    }
}
