//! Sandbox module - Isolated environments that run untrusted code
//!
//! Two interchangeable strategies implement one provisioning contract:
//! - Container: long-lived Docker container per session (bollard)
//! - Local: bare host process in a per-session scratch directory
//!
//! The strategy is picked once at startup by probing the container runtime;
//! everything above this module only sees the `SandboxBackend` / `Sandbox`
//! traits.

mod container;
pub mod demux;
mod local;

pub use container::{ContainerBackend, ContainerSandbox};
pub use local::{resolve_interpreter, LocalBackend, LocalSandbox};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{BackendPreference, SandboxConfig};
use crate::core::{BackendKind, OutputChunk};
use crate::error::{Error, Result};

/// Capacity of the per-execution output channel
pub(crate) const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// What a session asks for when it initialises
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    /// Owning session
    pub session_id: String,
    /// Language id sent by the client (informational)
    pub language: String,
    /// Runtime image id, e.g. `python:3.12-slim`
    pub runtime_image: String,
}

impl SandboxSpec {
    pub fn new(
        session_id: impl Into<String>,
        language: impl Into<String>,
        runtime_image: impl Into<String>,
    ) -> Self {
        SandboxSpec {
            session_id: session_id.into(),
            language: language.into(),
            runtime_image: runtime_image.into(),
        }
    }
}

/// Factory for sandboxes of one strategy
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Strategy implemented by this backend
    fn kind(&self) -> BackendKind;

    /// Provision a new sandbox
    async fn create(&self, spec: &SandboxSpec) -> Result<Arc<dyn Sandbox>>;
}

/// A live sandbox bound to one session
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Backend-specific identifier (container id, directory name)
    fn id(&self) -> &str;

    /// Strategy that created this sandbox
    fn kind(&self) -> BackendKind;

    /// Absolute workspace path inside the sandbox
    fn workdir(&self) -> &str;

    /// Write a file relative to the workspace
    async fn write_file(&self, name: &str, contents: &[u8]) -> Result<()>;

    /// Start a shell command; output streams until the process exits
    async fn exec(&self, command: &str) -> Result<Execution>;

    /// Kill whatever user processes are running, keeping the sandbox alive
    async fn interrupt(&self) -> Result<()>;

    /// Fetch a workspace file, `None` when it does not exist
    async fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a workspace file; missing files are not an error
    async fn remove_file(&self, name: &str) -> Result<()>;

    /// Release the backing resource. Calling it twice is a no-op.
    async fn destroy(&self) -> Result<()>;

    /// Whether the backing resource is still held
    fn is_alive(&self) -> bool;

    /// Human-readable environment report for a command, if the strategy has one
    fn diagnostics(&self, _command: &str) -> Option<String> {
        None
    }
}

/// A started command: its demultiplexed output plus a way to await its exit
pub struct Execution {
    /// Output chunks in arrival order, tagged by stream; closes when both streams end
    pub output: mpsc::Receiver<OutputChunk>,
    /// Resolves with the exit code
    pub completion: Box<dyn Completion>,
}

/// Exit notification for a started command.
///
/// Dropping the future returned by `wait` abandons the wait (and, for
/// strategies that own the process, kills it).
#[async_trait]
pub trait Completion: Send {
    async fn wait(&mut self) -> Result<i32>;
}

/// Pick the backend according to the configured preference
pub async fn detect_backend(config: &SandboxConfig) -> Result<Arc<dyn SandboxBackend>> {
    match config.backend {
        BackendPreference::Container => {
            let backend = ContainerBackend::connect(config).await?;
            Ok(Arc::new(backend))
        }
        BackendPreference::Local => Ok(Arc::new(LocalBackend::new(config))),
        BackendPreference::Auto => match ContainerBackend::connect(config).await {
            Ok(backend) => {
                info!("Container runtime reachable, using container sandboxes");
                Ok(Arc::new(backend))
            }
            Err(e) => {
                warn!("{}; falling back to local process sandboxes", e);
                Ok(Arc::new(LocalBackend::new(config)))
            }
        },
    }
}

/// Normalise a client-supplied file name to a safe workspace-relative path
pub fn sanitize_relative_path(name: &str) -> Result<String> {
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(Error::InvalidInput(format!(
            "File name must be relative: {}",
            name
        )));
    }

    let mut parts = Vec::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(Error::InvalidInput(format!(
                    "File name must not leave the workspace: {}",
                    name
                )))
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return Err(Error::InvalidInput("File name is empty".to_string()));
    }
    Ok(parts.join("/"))
}
