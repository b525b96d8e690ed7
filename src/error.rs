//! Error types for Codeplay

use thiserror::Error;

use crate::core::BackendKind;

/// Result type alias using Codeplay's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Codeplay
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The sandbox could not be created
    #[error("[{mode}] Failed to provision sandbox: {reason}")]
    Provisioning { mode: BackendKind, reason: String },

    /// A file or the source could not be deposited into the sandbox
    #[error("[{mode}] Failed to write {path} into sandbox: {reason}")]
    Write {
        mode: BackendKind,
        path: String,
        reason: String,
    },

    /// The entry command could not be launched
    #[error("[{mode}] Failed to start execution: {reason}")]
    Start { mode: BackendKind, reason: String },

    /// The sandbox disappeared underneath the session
    #[error("[{mode}] Sandbox lost: {reason}")]
    SandboxLost { mode: BackendKind, reason: String },

    /// No live sandbox is bound to the session
    #[error("Session expired: no active sandbox, initialise the session again")]
    SessionExpired,

    /// The request was cut short by a stop, a re-initialisation or a shutdown
    #[error("Stopped: the session was stopped before the request completed")]
    Stopped,

    /// Client transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Docker/container error
    #[error("Container error: {0}")]
    Container(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Backend mode carried by the error, if any
    pub fn mode(&self) -> Option<BackendKind> {
        match self {
            Error::Provisioning { mode, .. }
            | Error::Write { mode, .. }
            | Error::Start { mode, .. }
            | Error::SandboxLost { mode, .. } => Some(*mode),
            _ => None,
        }
    }

    /// Whether the sandbox behind the session can no longer be used
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Error::SandboxLost { .. })
    }

    /// Check if error is a client error (user's fault)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidInput(_) | Error::SessionExpired)
    }

    /// Message sent to the client: always names the backend mode.
    pub fn client_message(&self, mode: BackendKind) -> String {
        match self.mode() {
            Some(_) => self.to_string(),
            None => format!("[{}] {}", mode, self),
        }
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::Container(err.to_string())
    }
}
