//! Result artifact extraction
//!
//! After a run the program may have left well-known result files in its
//! workspace (a plot, a rendered page, some JSON). They are fetched
//! out-of-band through the sandbox, turned into output events and deleted so
//! the next run starts clean.

use tracing::{debug, warn};

use crate::codec;
use crate::core::{OutputEvent, ResultArtifact, StreamKind};
use crate::sandbox::Sandbox;

/// MIME type and binary flag for an artifact file name
pub fn classify(filename: &str) -> (&'static str, bool) {
    let ext = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => ("image/png", true),
        "jpg" | "jpeg" => ("image/jpeg", true),
        "gif" => ("image/gif", true),
        "webp" => ("image/webp", true),
        "svg" => ("image/svg+xml", true),
        "pdf" => ("application/pdf", true),
        "html" | "htm" => ("text/html", false),
        "json" => ("application/json", false),
        "csv" => ("text/csv", false),
        "md" => ("text/markdown", false),
        "txt" => ("text/plain", false),
        _ => ("application/octet-stream", true),
    }
}

/// Turn an artifact into the output event delivered to the client
pub fn to_event(artifact: &ResultArtifact) -> OutputEvent {
    let payload = if artifact.is_binary {
        codec::data_uri(&artifact.mime_kind, &artifact.payload)
    } else {
        String::from_utf8_lossy(&artifact.payload).into_owned()
    };

    OutputEvent {
        stream: StreamKind::Stdout,
        payload,
    }
}

/// Collects the configured artifact files from a sandbox
#[derive(Debug, Clone)]
pub struct OutputExtractor {
    names: Vec<String>,
}

impl OutputExtractor {
    pub fn new(names: Vec<String>) -> Self {
        OutputExtractor { names }
    }

    /// Fetch and delete every artifact present, in configured order.
    ///
    /// Retrieval failures are logged and skipped; they never fail the run.
    pub async fn collect(&self, sandbox: &dyn Sandbox) -> Vec<ResultArtifact> {
        let mut artifacts = Vec::new();

        for name in &self.names {
            let payload = match sandbox.read_file(name).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to read artifact {} from {}: {}", name, sandbox.id(), e);
                    continue;
                }
            };

            if let Err(e) = sandbox.remove_file(name).await {
                warn!("Failed to delete artifact {} in {}: {}", name, sandbox.id(), e);
            }

            let (mime, is_binary) = classify(name);
            debug!("Extracted artifact {} ({}, {} bytes)", name, mime, payload.len());
            artifacts.push(ResultArtifact {
                filename: name.clone(),
                mime_kind: mime.to_string(),
                is_binary,
                payload,
            });
        }

        artifacts
    }
}
