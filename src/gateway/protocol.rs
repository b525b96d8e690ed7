//! Client → server messages
//!
//! Server → client events live in [`crate::core::ServerEvent`].

use serde::{Deserialize, Serialize};

use crate::core::{AttachedFile, ExecutionRequest};
use crate::error::{Error, Result};

/// Message sent by a connected client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Provision (or re-provision) the session's sandbox
    InitSession {
        language: String,
        runtime_image: String,
    },
    /// Run code in the session's sandbox
    RunCode(RunCode),
    /// Tear the sandbox down, keeping the connection
    StopSession,
}

impl ClientMessage {
    /// Parse a text frame
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::InvalidInput(format!("Unrecognised message: {}", e)))
    }
}

/// Payload of a `run-code` message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCode {
    pub source: String,
    pub extension: String,
    pub entry_command: String,
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub setup_code: Option<String>,
    #[serde(default)]
    pub files: Vec<AttachedFile>,
}

impl From<RunCode> for ExecutionRequest {
    fn from(run: RunCode) -> Self {
        ExecutionRequest {
            source_code: run.source,
            file_extension: run.extension,
            entry_command: run.entry_command,
            install_command: run.install_command.filter(|c| !c.trim().is_empty()),
            setup_code: run.setup_code.filter(|c| !c.is_empty()),
            attached_files: run.files,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init_session() {
        let msg = ClientMessage::parse(
            r#"{"type":"init-session","language":"python","runtime_image":"python:3.12-slim"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::InitSession {
                language: "python".into(),
                runtime_image: "python:3.12-slim".into(),
            }
        );
    }

    #[test]
    fn test_parse_run_code() {
        let msg = ClientMessage::parse(
            r#"{"type":"run-code","source":"print(1)","extension":"py","entry_command":"python3",
                "install_command":null,"setup_code":null,
                "files":[{"name":"data.csv","content_base64":"YSxiCg=="}]}"#,
        )
        .unwrap();

        let ClientMessage::RunCode(run) = msg else {
            panic!("expected run-code");
        };
        let request = ExecutionRequest::from(run);
        assert_eq!(request.source_code, "print(1)");
        assert_eq!(request.file_extension, "py");
        assert_eq!(request.install_command, None);
        assert_eq!(request.attached_files[0].name, "data.csv");
    }

    #[test]
    fn test_run_code_optional_fields() {
        let msg = ClientMessage::parse(
            r#"{"type":"run-code","source":"","extension":"js","entry_command":"node","install_command":"  "}"#,
        )
        .unwrap();
        let ClientMessage::RunCode(run) = msg else {
            panic!("expected run-code");
        };
        assert!(run.files.is_empty());
        assert_eq!(ExecutionRequest::from(run).install_command, None);
    }

    #[test]
    fn test_parse_stop_and_reject_garbage() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"stop-session"}"#).unwrap(),
            ClientMessage::StopSession
        );
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"reboot"}"#),
            Err(Error::InvalidInput(_))
        ));
        assert!(ClientMessage::parse("not json").is_err());
    }
}
