//! Core types used across the application

use serde::{Deserialize, Serialize};

/// Identity of a connected client; one session per client
pub type ClientId = String;

/// Which sandbox strategy is serving sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Isolated container managed through the Docker API
    Container,
    /// Bare host process, used when no container runtime is reachable
    Local,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Container => write!(f, "Container"),
            BackendKind::Local => write!(f, "Local"),
        }
    }
}

/// Origin stream of a piece of program output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// A file shipped alongside the source code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedFile {
    /// Relative file name inside the sandbox workspace
    pub name: String,
    /// File contents, base64 encoded
    pub content_base64: String,
}

/// Request to run a piece of source code in a session's sandbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Source code submitted by the client
    pub source_code: String,
    /// Extension of the source file, without the dot
    pub file_extension: String,
    /// Entry command template, e.g. `python3` or `node {file}`
    pub entry_command: String,
    /// Optional dependency installation template, e.g. `pip install {deps}`
    #[serde(default)]
    pub install_command: Option<String>,
    /// Code prepended to the user's source
    #[serde(default)]
    pub setup_code: Option<String>,
    /// Extra files written before the source
    #[serde(default)]
    pub attached_files: Vec<AttachedFile>,
}

impl ExecutionRequest {
    /// Create a new execution request
    pub fn new(
        source_code: impl Into<String>,
        file_extension: impl Into<String>,
        entry_command: impl Into<String>,
    ) -> Self {
        ExecutionRequest {
            source_code: source_code.into(),
            file_extension: file_extension.into(),
            entry_command: entry_command.into(),
            install_command: None,
            setup_code: None,
            attached_files: Vec::new(),
        }
    }

    /// Set the install command template
    pub fn with_install_command(mut self, command: impl Into<String>) -> Self {
        self.install_command = Some(command.into());
        self
    }

    /// Set setup code
    pub fn with_setup_code(mut self, code: impl Into<String>) -> Self {
        self.setup_code = Some(code.into());
        self
    }

    /// Attach a file
    pub fn with_file(mut self, name: impl Into<String>, content_base64: impl Into<String>) -> Self {
        self.attached_files.push(AttachedFile {
            name: name.into(),
            content_base64: content_base64.into(),
        });
        self
    }
}

/// Raw bytes read from one of the sandbox's output streams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn new(stream: StreamKind, data: impl Into<Vec<u8>>) -> Self {
        OutputChunk {
            stream,
            data: data.into(),
        }
    }
}

/// Decoded program output forwarded to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub stream: StreamKind,
    pub payload: String,
}

/// Final status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitEvent {
    pub code: i32,
}

/// A well-known file produced by the user's program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultArtifact {
    /// File name inside the sandbox workspace
    pub filename: String,
    /// MIME type derived from the extension
    pub mime_kind: String,
    /// Delivered as a data URI when true, as raw text otherwise
    pub is_binary: bool,
    /// File contents
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_request_builder() {
        let req = ExecutionRequest::new("print('hi')", "py", "python3")
            .with_install_command("pip install {deps}")
            .with_setup_code("import os")
            .with_file("data.csv", "YSxiCg==");

        assert_eq!(req.entry_command, "python3");
        assert_eq!(req.install_command.as_deref(), Some("pip install {deps}"));
        assert_eq!(req.setup_code.as_deref(), Some("import os"));
        assert_eq!(req.attached_files.len(), 1);
        assert_eq!(req.attached_files[0].name, "data.csv");
    }

    #[test]
    fn test_request_deserializes_with_defaults() {
        let req: ExecutionRequest = serde_json::from_str(
            r#"{"source_code":"x","file_extension":"js","entry_command":"node"}"#,
        )
        .unwrap();
        assert!(req.install_command.is_none());
        assert!(req.attached_files.is_empty());
    }

    #[test]
    fn test_backend_kind_display() {
        assert_eq!(BackendKind::Container.to_string(), "Container");
        assert_eq!(BackendKind::Local.to_string(), "Local");
        assert_eq!(
            serde_json::to_string(&StreamKind::Stderr).unwrap(),
            "\"stderr\""
        );
    }
}
