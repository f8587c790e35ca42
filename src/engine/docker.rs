//! Docker-backed [`SandboxEngine`] implementation.
//!
//! Wraps `bollard` behind a lazy singleton connection: the first call that
//! touches the engine connects and pings; a failure at that point is cached
//! as "unavailable" and every subsequent call short-circuits without
//! retrying. A later explicit reset is out of scope (§4.2).

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, RemoveContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};

use super::{ContainerState, EngineError, ExecCommand, ExecOutput, RunOptions, SandboxEngine};
use crate::registry::{NetworkMode, SandboxProfile};

pub struct DockerEngine {
    docker: OnceCell<Option<Docker>>,
}

impl DockerEngine {
    pub fn new() -> Self {
        Self {
            docker: OnceCell::new(),
        }
    }

    /// Connect-and-ping exactly once; cache the outcome for the process
    /// lifetime of this `DockerEngine` instance.
    async fn handle(&self) -> Option<&Docker> {
        self.docker
            .get_or_init(|| async {
                let docker = match Docker::connect_with_local_defaults() {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(error = %e, "failed to connect to container engine");
                        return None;
                    }
                };
                match docker.ping().await {
                    Ok(_) => Some(docker),
                    Err(e) => {
                        warn!(error = %e, "container engine ping failed");
                        None
                    }
                }
            })
            .await
            .as_ref()
    }

    fn short_id(full_id: &str) -> String {
        full_id.chars().take(12).collect()
    }
}

impl Default for DockerEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn tar_single_file(path: &str, bytes: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut builder = tar::Builder::new(Vec::new());
    let relative = path.trim_start_matches('/');
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, relative, bytes)
        .map_err(|e| EngineError::Other(format!("failed to build upload archive: {e}")))?;
    builder
        .into_inner()
        .map_err(|e| EngineError::Other(format!("failed to finish upload archive: {e}")))
}

fn classify_error(context: &str, e: BollardError) -> EngineError {
    match &e {
        BollardError::DockerResponseServerError { status_code, .. } if *status_code == 404 => {
            EngineError::NotFound(context.to_string())
        }
        _ => EngineError::Other(format!("{context}: {e}")),
    }
}

#[async_trait::async_trait]
impl SandboxEngine for DockerEngine {
    async fn ping(&self) -> bool {
        self.handle().await.is_some()
    }

    #[instrument(skip(self, profile), fields(profile = %profile.name))]
    async fn build_if_declared(&self, profile: &SandboxProfile) {
        let Some(docker) = self.handle().await else {
            return;
        };
        let Some(context) = &profile.build_context else {
            return;
        };
        if !context.exists() {
            debug!(path = %context.display(), "build context missing, skipping opportunistic build");
            return;
        }

        let tar_bytes = match build_context_tar(context) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to package build context");
                return;
            }
        };

        let options = BuildImageOptions {
            t: profile.image_ref(),
            rm: true,
            ..Default::default()
        };

        let mut stream = docker.build_image(options, None, Some(tar_bytes.into()));
        while let Some(chunk) = stream.next().await {
            if let Err(e) = chunk {
                warn!(error = %e, "opportunistic build failed; existing tagged image may still work");
                return;
            }
        }
    }

    #[instrument(skip(self, options), fields(image = %options.image))]
    async fn run(&self, options: RunOptions) -> Result<String, EngineError> {
        let docker = self.handle().await.ok_or(EngineError::Unavailable)?;

        let network_mode = match options.network_mode {
            NetworkMode::None => Some("none".to_string()),
            NetworkMode::Default => None,
        };

        let mut port_bindings = HashMap::new();
        let mut exposed_ports = HashMap::new();
        for (container_port, host_port) in &options.publish_ports {
            let key = format!("{container_port}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            let host_port_str = if *host_port == 0 {
                None
            } else {
                Some(host_port.to_string())
            };
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: host_port_str,
                }]),
            );
        }

        let host_config = HostConfig {
            network_mode,
            memory: options.memory.as_deref().and_then(parse_size_to_bytes),
            cpu_quota: options.cpu_quota,
            cpu_period: options.cpu_period,
            readonly_rootfs: Some(options.read_only),
            port_bindings: Some(port_bindings),
            publish_all_ports: Some(false),
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(options.image.clone()),
            tty: Some(options.tty),
            open_stdin: Some(options.stdin_open),
            attach_stdin: Some(options.stdin_open),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: format!("sandbox-{}", uuid::Uuid::new_v4()),
            platform: None,
        };

        let created = docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| match &e {
                BollardError::DockerResponseServerError { status_code, .. }
                    if *status_code == 404 =>
                {
                    EngineError::ImageMissing(options.image.clone())
                }
                _ => EngineError::Other(format!("failed to create container: {e}")),
            })?;

        docker
            .start_container::<String>(&created.id, None)
            .await
            .map_err(|e| classify_error("failed to start container", e))?;

        Ok(Self::short_id(&created.id))
    }

    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    async fn inject_file(
        &self,
        container_id: &str,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), EngineError> {
        let docker = self.handle().await.ok_or(EngineError::Unavailable)?;
        let archive = tar_single_file(path, bytes)?;

        let directory = std::path::Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());

        let options = UploadToContainerOptions {
            path: directory,
            ..Default::default()
        };

        docker
            .upload_to_container(container_id, Some(options), archive.into())
            .await
            .map_err(|e| classify_error("failed to upload file to container", e))
    }

    #[instrument(skip(self, command))]
    async fn exec(
        &self,
        container_id: &str,
        command: ExecCommand,
        workdir: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, EngineError> {
        let docker = self.handle().await.ok_or(EngineError::Unavailable)?;
        let cmd = match command {
            ExecCommand::Argv(argv) => argv,
            ExecCommand::Shell(s) => vec!["sh".to_string(), "-c".to_string(), s],
        };

        let exec = docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(cmd),
                    working_dir: Some(workdir.to_string()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify_error("failed to create exec", e))?;

        let run = async {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();

            match docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| classify_error("failed to start exec", e))?
            {
                StartExecResults::Attached { mut output, .. } => {
                    while let Some(chunk) = output.next().await {
                        match chunk {
                            Ok(bollard::container::LogOutput::StdOut { message }) => {
                                stdout.extend_from_slice(&message)
                            }
                            Ok(bollard::container::LogOutput::StdErr { message }) => {
                                stderr.extend_from_slice(&message)
                            }
                            Ok(_) => {}
                            Err(e) => return Err(classify_error("exec stream error", e)),
                        }
                    }
                }
                StartExecResults::Detached => {}
            }

            let inspect = docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| classify_error("failed to inspect exec", e))?;
            let exit_code = inspect.exit_code.unwrap_or(-1) as i32;

            Ok(ExecOutput {
                exit_code,
                stdout,
                stderr,
            })
        };

        tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| EngineError::Timeout(timeout))?
    }

    async fn exec_detached(
        &self,
        container_id: &str,
        argv: &[String],
        as_user: &str,
    ) -> Result<(), EngineError> {
        let docker = self.handle().await.ok_or(EngineError::Unavailable)?;
        let exec = docker
            .create_exec(
                container_id,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    user: Some(as_user.to_string()),
                    detach: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify_error("failed to create detached exec", e))?;

        docker
            .start_exec(&exec.id, None)
            .await
            .map(|_| ())
            .map_err(|e| classify_error("failed to start detached exec", e))
    }

    async fn reload(&self, container_id: &str) -> Result<(), EngineError> {
        let docker = self.handle().await.ok_or(EngineError::Unavailable)?;
        docker
            .inspect_container(container_id, None)
            .await
            .map(|_| ())
            .map_err(|e| classify_error("failed to reload container state", e))
    }

    async fn host_port_of(
        &self,
        container_id: &str,
        container_port: u16,
    ) -> Result<Option<u16>, EngineError> {
        let docker = self.handle().await.ok_or(EngineError::Unavailable)?;
        let info = docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| classify_error("failed to inspect container for port lookup", e))?;

        let key = format!("{container_port}/tcp");
        let port = info
            .network_settings
            .and_then(|ns| ns.ports)
            .and_then(|ports| ports.get(&key).cloned().flatten())
            .and_then(|bindings| bindings.into_iter().next())
            .and_then(|binding| binding.host_port)
            .and_then(|p| p.parse().ok());

        Ok(port)
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> Result<(), EngineError> {
        let Some(docker) = self.handle().await else {
            return Err(EngineError::Unavailable);
        };
        match docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError { status_code, .. })
                if status_code == 404 || status_code == 304 =>
            {
                Ok(())
            }
            Err(e) => Err(EngineError::Other(format!("failed to stop container: {e}"))),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), EngineError> {
        let Some(docker) = self.handle().await else {
            return Err(EngineError::Unavailable);
        };
        match docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError { status_code, .. })
                if status_code == 404 =>
            {
                Ok(())
            }
            Err(e) => Err(EngineError::Other(format!(
                "failed to remove container: {e}"
            ))),
        }
    }

    async fn container_state(&self, container_id: &str) -> Result<ContainerState, EngineError> {
        let docker = self.handle().await.ok_or(EngineError::Unavailable)?;
        match docker.inspect_container(container_id, None).await {
            Ok(info) => {
                let status = info
                    .state
                    .and_then(|s| s.status)
                    .map(|s| format!("{s:?}").to_lowercase());
                Ok(match status.as_deref() {
                    Some("running") => ContainerState::Running,
                    Some("dead") => ContainerState::Dead,
                    _ => ContainerState::Exited,
                })
            }
            Err(BollardError::DockerResponseServerError { status_code, .. })
                if status_code == 404 =>
            {
                Ok(ContainerState::NotFound)
            }
            Err(e) => Err(EngineError::Other(format!(
                "failed to inspect container: {e}"
            ))),
        }
    }
}

/// Parse a Docker-style size string (`"512m"`, `"1g"`, `"1024k"`, a bare
/// number of bytes) into a byte count.
fn parse_size_to_bytes(size: &str) -> Option<i64> {
    let size = size.trim();
    let (digits, suffix) = size.split_at(
        size.find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(size.len()),
    );
    let value: f64 = digits.parse().ok()?;
    let multiplier = match suffix.to_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" => 1024.0,
        "m" | "mb" => 1024.0 * 1024.0,
        "g" | "gb" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier) as i64)
}

/// Package a build context directory into an in-memory tar archive for
/// `build_image`.
fn build_context_tar(dir: &std::path::Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", dir)?;
    let mut out = builder.into_inner()?;
    out.flush()?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_size_strings() {
        assert_eq!(parse_size_to_bytes("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_size_to_bytes("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size_to_bytes("2048k"), Some(2048 * 1024));
        assert_eq!(parse_size_to_bytes("100"), Some(100));
        assert_eq!(parse_size_to_bytes("nonsense"), None);
    }

    #[test]
    fn builds_single_file_tar() {
        let archive = tar_single_file("/workspace/code.py", b"print(1)").unwrap();
        assert!(!archive.is_empty());
    }
}
