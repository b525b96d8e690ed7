//! Docker container-based sandboxes
//!
//! One long-lived container per session, kept alive by a no-op foreground
//! process so consecutive runs reuse it. Every run is a `docker exec`;
//! completion is observed by polling the exec until it stops running.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    demux, sanitize_relative_path, Completion, Execution, Sandbox, SandboxBackend, SandboxSpec,
    OUTPUT_CHANNEL_CAPACITY,
};
use crate::codec;
use crate::command::shell_quote;
use crate::config::{ContainerConfig, NetworkPolicy, SandboxConfig};
use crate::core::{BackendKind, StreamKind};
use crate::error::{Error, Result};

/// Label marking containers owned by this service
pub const MANAGED_LABEL: &str = "codeplay.managed";
/// Label carrying the owning session id
pub const SESSION_LABEL: &str = "codeplay.session";

/// Polls tolerated after an exec stopped running without reporting a code
const MAX_PENDING_POLLS: u32 = 20;

fn provisioning(reason: impl Into<String>) -> Error {
    Error::Provisioning {
        mode: BackendKind::Container,
        reason: reason.into(),
    }
}

fn is_gone(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

/// Classify a failure to start or observe an exec
fn exec_error(err: bollard::errors::Error) -> Error {
    if is_gone(&err) {
        Error::SandboxLost {
            mode: BackendKind::Container,
            reason: err.to_string(),
        }
    } else {
        Error::Start {
            mode: BackendKind::Container,
            reason: err.to_string(),
        }
    }
}

/// Factory for per-session containers
pub struct ContainerBackend {
    docker: Docker,
    config: ContainerConfig,
    poll_interval: Duration,
}

impl ContainerBackend {
    /// Connect to the local Docker daemon and verify it answers
    pub async fn connect(config: &SandboxConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| provisioning(format!("Failed to connect to Docker: {}", e)))?;

        docker
            .ping()
            .await
            .map_err(|e| provisioning(format!("Docker ping failed: {}", e)))?;

        info!("Container backend connected to Docker");

        Ok(ContainerBackend {
            docker,
            config: config.container.clone(),
            poll_interval: config.poll_interval(),
        })
    }

    /// Make sure `image` is present locally, pulling it if needed
    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(provisioning(format!("Failed to inspect image {}: {}", image, e))),
        }

        let timeout = Duration::from_secs(self.config.pull_timeout_secs);
        info!("Pulling image: {} (timeout: {:?})", image, timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        let pulled = tokio::time::timeout(timeout, async {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(error) = info.error {
                            return Err(provisioning(format!(
                                "Failed to pull image {}: {}",
                                image, error
                            )));
                        }
                        if let Some(status) = info.status {
                            debug!("Pull status: {}", status);
                        }
                    }
                    Err(e) => {
                        return Err(provisioning(format!("Failed to pull image {}: {}", image, e)));
                    }
                }
            }
            Ok(())
        })
        .await;

        match pulled {
            Ok(Ok(())) => {
                info!("Image pulled successfully: {}", image);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(provisioning(format!(
                "Timeout pulling image {} after {:?}",
                image, timeout
            ))),
        }
    }

    async fn remove_quietly(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(id, Some(options)).await {
            warn!("Failed to remove container {}: {}", id, e);
        }
    }
}

/// Container definition for a session sandbox
fn container_config(config: &ContainerConfig, spec: &SandboxSpec) -> Config<String> {
    let memory = config.memory_bytes();
    let env: Vec<String> = config
        .env
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();

    let labels = HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (SESSION_LABEL.to_string(), spec.session_id.clone()),
    ]);

    Config {
        image: Some(spec.runtime_image.clone()),
        cmd: Some(config.keepalive.clone()),
        env: Some(env),
        working_dir: Some(config.workdir.clone()),
        labels: Some(labels),
        network_disabled: Some(config.network == NetworkPolicy::None),
        host_config: Some(HostConfig {
            memory,
            // same as memory: no swap
            memory_swap: memory,
            cpu_period: Some(config.cpu_period),
            cpu_quota: Some(config.cpu_quota()),
            pids_limit: Some(config.pids_limit),
            network_mode: Some(config.network.network_mode().to_string()),
            auto_remove: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl SandboxBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<Arc<dyn Sandbox>> {
        if !self.config.image_allowed(&spec.runtime_image) {
            return Err(provisioning(format!(
                "Image {} is not allowed",
                spec.runtime_image
            )));
        }

        self.ensure_image(&spec.runtime_image).await?;

        let name = format!("codeplay-{}", uuid::Uuid::new_v4().simple());
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), container_config(&self.config, spec))
            .await
            .map_err(|e| provisioning(format!("Failed to create container: {}", e)))?;

        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove_quietly(&created.id).await;
            return Err(provisioning(format!("Failed to start container: {}", e)));
        }

        info!(
            "Created container {} ({}) for session {} from {}",
            name, created.id, spec.session_id, spec.runtime_image
        );

        Ok(Arc::new(ContainerSandbox {
            docker: self.docker.clone(),
            id: created.id,
            workdir: self.config.workdir.clone(),
            poll_interval: self.poll_interval,
            destroyed: AtomicBool::new(false),
        }))
    }
}

/// A running session container
pub struct ContainerSandbox {
    docker: Docker,
    id: String,
    workdir: String,
    poll_interval: Duration,
    destroyed: AtomicBool,
}

impl ContainerSandbox {
    fn target_path(&self, name: &str) -> Result<String> {
        let relative = sanitize_relative_path(name)?;
        Ok(format!("{}/{}", self.workdir.trim_end_matches('/'), relative))
    }

    /// Run a helper command to completion, returning its exit code and stderr
    async fn run_to_completion(&self, command: &str) -> Result<(i32, String)> {
        let Execution {
            mut output,
            mut completion,
        } = self.exec(command).await?;

        let mut stderr = Vec::new();
        while let Some(chunk) = output.recv().await {
            if chunk.stream == StreamKind::Stderr {
                stderr.extend_from_slice(&chunk.data);
            }
        }

        let code = completion.wait().await?;
        Ok((code, String::from_utf8_lossy(&stderr).trim().to_string()))
    }
}

/// Shell commands that recreate `target` from `contents` via base64 redirection
fn write_commands(target: &str, contents: &[u8]) -> Vec<String> {
    let quoted = shell_quote(target);
    let parent = match target.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir,
        _ => "/",
    };

    let encoded = codec::encode(contents);
    let mut commands = vec![format!("mkdir -p {} && : > {}", shell_quote(parent), quoted)];
    commands.extend(
        codec::chunks(&encoded, codec::SHELL_CHUNK_LEN)
            .into_iter()
            .map(|chunk| format!("printf '%s' '{}' | base64 -d >> {}", chunk, quoted)),
    );
    commands
}

/// Pull the first regular file out of a tar archive
fn first_file_from_tar(data: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut archive = tar::Archive::new(data);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(Some(contents));
        }
    }
    Ok(None)
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    fn workdir(&self) -> &str {
        &self.workdir
    }

    async fn write_file(&self, name: &str, contents: &[u8]) -> Result<()> {
        let target = self.target_path(name)?;
        let write_error = |reason: String| Error::Write {
            mode: BackendKind::Container,
            path: name.to_string(),
            reason,
        };

        for command in write_commands(&target, contents) {
            match self.run_to_completion(&command).await {
                Ok((0, _)) => {}
                Ok((code, stderr)) => {
                    return Err(write_error(format!("exit code {}: {}", code, stderr)));
                }
                Err(e) if e.is_unrecoverable() => return Err(e),
                Err(e) => return Err(write_error(e.to_string())),
            }
        }

        debug!("Wrote {} bytes to {}:{}", contents.len(), self.id, target);
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<Execution> {
        let options = CreateExecOptions {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some(self.workdir.clone()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&self.id, options)
            .await
            .map_err(exec_error)?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(exec_error)?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        match started {
            StartExecResults::Attached { output, .. } => {
                tokio::spawn(demux::forward_frames(output, tx));
            }
            StartExecResults::Detached => {
                return Err(Error::Start {
                    mode: BackendKind::Container,
                    reason: "Exec was detached unexpectedly".to_string(),
                });
            }
        }

        debug!("Started exec {} in container {}", exec.id, self.id);

        Ok(Execution {
            output: rx,
            completion: Box::new(PollingCompletion {
                docker: self.docker.clone(),
                exec_id: exec.id,
                interval: self.poll_interval,
            }),
        })
    }

    async fn interrupt(&self) -> Result<()> {
        // signals everything except PID 1, the keep-alive process
        let (code, _) = self.run_to_completion("kill -9 -1").await?;
        debug!("Interrupted processes in container {} (exit {})", self.id, code);
        Ok(())
    }

    async fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let target = self.target_path(name)?;
        let options = DownloadFromContainerOptions { path: target };
        let mut stream = self.docker.download_from_container(&self.id, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }

        first_file_from_tar(&data)
    }

    async fn remove_file(&self, name: &str) -> Result<()> {
        let target = self.target_path(name)?;
        let (code, stderr) = self
            .run_to_completion(&format!("rm -f {}", shell_quote(&target)))
            .await?;
        if code != 0 {
            warn!("Failed to remove {} in {}: {}", target, self.id, stderr);
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.docker.remove_container(&self.id, Some(options)).await {
            Ok(()) => {
                info!("Removed container: {}", self.id);
                Ok(())
            }
            Err(e) if is_gone(&e) => {
                debug!("Container {} already gone", self.id);
                Ok(())
            }
            Err(e) => Err(Error::Container(format!(
                "Failed to remove container {}: {}",
                self.id, e
            ))),
        }
    }

    fn is_alive(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst)
    }
}

/// Observes an exec by polling until it stops running
struct PollingCompletion {
    docker: Docker,
    exec_id: String,
    interval: Duration,
}

#[async_trait]
impl Completion for PollingCompletion {
    async fn wait(&mut self) -> Result<i32> {
        let mut pending = 0;
        loop {
            let inspect = self
                .docker
                .inspect_exec(&self.exec_id)
                .await
                .map_err(exec_error)?;

            if inspect.running != Some(true) {
                if let Some(code) = inspect.exit_code {
                    debug!("Exec {} exited with {}", self.exec_id, code);
                    return Ok(code as i32);
                }
                pending += 1;
                if pending > MAX_PENDING_POLLS {
                    return Err(Error::Start {
                        mode: BackendKind::Container,
                        reason: format!("Exec {} never reported an exit code", self.exec_id),
                    });
                }
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SandboxSpec {
        SandboxSpec::new("session-1", "python", "python:3.12-slim")
    }

    #[test]
    fn test_container_config_applies_limits() {
        let config = ContainerConfig::default();
        let built = container_config(&config, &spec());
        let host = built.host_config.unwrap();

        assert_eq!(built.image.as_deref(), Some("python:3.12-slim"));
        assert_eq!(built.cmd.unwrap(), vec!["tail", "-f", "/dev/null"]);
        assert_eq!(built.working_dir.as_deref(), Some("/workspace"));
        assert_eq!(built.network_disabled, Some(true));
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.pids_limit, Some(256));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.auto_remove, Some(true));

        let labels = built.labels.unwrap();
        assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(labels.get(SESSION_LABEL).map(String::as_str), Some("session-1"));
    }

    #[test]
    fn test_bridge_network_enables_networking() {
        let config = ContainerConfig {
            network: NetworkPolicy::Bridge,
            ..Default::default()
        };
        let built = container_config(&config, &spec());
        assert_eq!(built.network_disabled, Some(false));
        assert_eq!(
            built.host_config.unwrap().network_mode.as_deref(),
            Some("bridge")
        );
    }

    #[test]
    fn test_write_commands_truncate_then_append() {
        let commands = write_commands("/workspace/dir/main.py", b"print('hi')\n");
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0],
            "mkdir -p /workspace/dir && : > /workspace/dir/main.py"
        );
        assert!(commands[1].starts_with("printf '%s' 'cHJpbnQoJ2hpJykK'"));
        assert!(commands[1].ends_with("| base64 -d >> /workspace/dir/main.py"));

        let spaced = write_commands("/workspace/my file.txt", b"x");
        assert_eq!(spaced[0], "mkdir -p /workspace && : > '/workspace/my file.txt'");
    }

    #[test]
    fn test_write_commands_split_large_files() {
        let contents = vec![7u8; codec::SHELL_CHUNK_LEN];
        let commands = write_commands("/workspace/blob.bin", &contents);
        assert!(commands.len() > 2);
        assert!(commands
            .iter()
            .all(|c| c.len() < codec::SHELL_CHUNK_LEN + 128));
    }

    #[test]
    fn test_empty_file_only_truncates() {
        assert_eq!(write_commands("/workspace/empty.txt", b"").len(), 1);
    }

    #[test]
    fn test_first_file_from_tar() {
        let mut builder = tar::Builder::new(Vec::new());
        let payload = b"{\"ok\":true}";
        let mut header = tar::Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "output.json", &payload[..])
            .unwrap();
        let data = builder.into_inner().unwrap();

        assert_eq!(first_file_from_tar(&data).unwrap().unwrap(), payload);
        assert_eq!(first_file_from_tar(&[0u8; 1024]).unwrap(), None);
    }

    #[test]
    fn test_exec_error_classification() {
        let gone = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        assert!(exec_error(gone).is_unrecoverable());

        let busy = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "server error".into(),
        };
        assert!(matches!(exec_error(busy), Error::Start { .. }));
    }
}
