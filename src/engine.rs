//! Execution engine
//!
//! Drives one run inside an already provisioned sandbox:
//! `Writing → Running → Draining → Completed | Failed`.
//!
//! Program failures are not errors here: a non-zero exit is reported as
//! output plus an `exit` event. Errors returned from [`ExecutionEngine::run`]
//! are infrastructure failures (write, start, lost sandbox) that the session
//! manager turns into `error` events.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec;
use crate::command;
use crate::config::SandboxConfig;
use crate::core::{BackendKind, EventSink, ExecutionRequest, OutputChunk, StreamKind};
use crate::error::{Error, Result};
use crate::extract::{self, OutputExtractor};
use crate::sandbox::demux::Utf8Decoder;
use crate::sandbox::Sandbox;

/// Exit code reported when the wall-clock limit ends a run
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Shell exit code for a missing program
pub const NOT_FOUND_EXIT_CODE: i32 = 127;
/// SIGKILL, usually the kernel OOM killer
pub const KILLED_EXIT_CODE: i32 = 137;

/// Phase of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Writing,
    Running,
    Draining,
    Completed,
    Failed,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The program exited; its code was sent to the client
    Exited(i32),
    /// The wall-clock limit fired; `exit(124)` was sent
    TimedOut,
    /// The session was stopped mid-run; nothing further was sent
    Cancelled,
}

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wall-clock limit per run
    pub timeout: Option<Duration>,
    /// Program output forwarded per run
    pub max_output_bytes: usize,
    /// How long trailing output is awaited after exit
    pub drain_timeout: Duration,
    /// Well-known result files
    pub artifacts: Vec<String>,
    /// Stream the local diagnostic preamble before each run
    pub emit_preamble: bool,
}

impl From<&SandboxConfig> for EngineConfig {
    fn from(config: &SandboxConfig) -> Self {
        EngineConfig {
            timeout: config.run_timeout(),
            max_output_bytes: config.max_output_bytes,
            drain_timeout: config.drain_timeout(),
            artifacts: config.artifacts.clone(),
            emit_preamble: config.local.emit_preamble,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::from(&SandboxConfig::default())
    }
}

/// Forwards program output, enforcing the per-run cap
struct OutputForwarder<'a> {
    events: &'a EventSink,
    stdout: Utf8Decoder,
    stderr: Utf8Decoder,
    forwarded: usize,
    limit: usize,
    truncated: bool,
}

impl<'a> OutputForwarder<'a> {
    fn new(events: &'a EventSink, limit: usize) -> Self {
        OutputForwarder {
            events,
            stdout: Utf8Decoder::new(),
            stderr: Utf8Decoder::new(),
            forwarded: 0,
            limit,
            truncated: false,
        }
    }

    fn forward(&mut self, chunk: OutputChunk) {
        if self.truncated {
            return;
        }

        let remaining = self.limit.saturating_sub(self.forwarded);
        let take = chunk.data.len().min(remaining);
        self.forwarded += take;

        let decoder = match chunk.stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        };
        let text = decoder.push(&chunk.data[..take]);
        if !text.is_empty() {
            self.events.output(chunk.stream, text);
        }

        if take < chunk.data.len() {
            self.truncated = true;
            self.flush();
            self.events.output(
                StreamKind::Stderr,
                format!(
                    "\n[output truncated: more than {} bytes were produced]\n",
                    self.limit
                ),
            );
        }
    }

    /// Emit any bytes the decoders are holding back
    fn flush(&mut self) {
        for (stream, decoder) in [
            (StreamKind::Stdout, &mut self.stdout),
            (StreamKind::Stderr, &mut self.stderr),
        ] {
            let rest = decoder.finish();
            if !rest.is_empty() {
                self.events.output(stream, rest);
            }
        }
    }
}

enum Finished {
    Exited(i32),
    TimedOut,
}

/// Runs requests inside sandboxes
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    config: EngineConfig,
    extractor: OutputExtractor,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig) -> Self {
        let extractor = OutputExtractor::new(config.artifacts.clone());
        ExecutionEngine { config, extractor }
    }

    /// Run one request to completion, streaming events to `events`.
    ///
    /// When `cancel` fires the run stops where it is, emits nothing further and
    /// abandons the process; the caller is expected to destroy the sandbox.
    pub async fn run(
        &self,
        sandbox: &dyn Sandbox,
        request: &ExecutionRequest,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let result = self.run_inner(sandbox, request, events, cancel).await;
        let state = match &result {
            Ok(_) => EngineState::Completed,
            Err(_) => EngineState::Failed,
        };
        debug!(sandbox = sandbox.id(), ?state, "Run finished");
        result
    }

    async fn run_inner(
        &self,
        sandbox: &dyn Sandbox,
        request: &ExecutionRequest,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let mode = sandbox.kind();

        debug!(sandbox = sandbox.id(), state = ?EngineState::Writing, "Writing files");
        for file in &request.attached_files {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            let bytes = codec::decode(&file.content_base64).map_err(|e| Error::Write {
                mode,
                path: file.name.clone(),
                reason: e.to_string(),
            })?;
            sandbox.write_file(&file.name, &bytes).await?;
        }

        let source_name = command::source_file_name(&request.file_extension);
        let dependencies = match &request.install_command {
            Some(_) => command::detect_dependencies(&request.file_extension, &request.source_code),
            None => Vec::new(),
        };
        let source_path = format!("{}/{}", sandbox.workdir().trim_end_matches('/'), source_name);
        let plan = command::build(
            &request.entry_command,
            &dependencies,
            request.install_command.as_deref(),
            request.setup_code.as_deref(),
            &request.source_code,
            &source_path,
        );

        if cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        sandbox
            .write_file(&source_name, plan.source.as_bytes())
            .await?;

        if self.config.emit_preamble && mode == BackendKind::Local {
            if let Some(preamble) = sandbox.diagnostics(&plan.command) {
                events.output(StreamKind::Stderr, preamble);
            }
        }

        if cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }

        debug!(sandbox = sandbox.id(), state = ?EngineState::Running, command = %plan.command, "Starting command");
        let mut execution = sandbox.exec(&plan.command).await?;
        let mut forwarder = OutputForwarder::new(events, self.config.max_output_bytes);

        let finished = {
            let deadline = self.config.timeout.map(|t| Instant::now() + t);
            let timer = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(timer);

            let wait = execution.completion.wait();
            tokio::pin!(wait);

            let mut output_open = true;
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(sandbox = sandbox.id(), "Run cancelled");
                        return Ok(RunOutcome::Cancelled);
                    }
                    chunk = execution.output.recv(), if output_open => match chunk {
                        Some(chunk) => forwarder.forward(chunk),
                        None => output_open = false,
                    },
                    code = &mut wait => break Finished::Exited(code?),
                    _ = &mut timer => break Finished::TimedOut,
                }
            }
        };

        if let Finished::TimedOut = finished {
            info!(sandbox = sandbox.id(), "Run exceeded its time limit, interrupting");
            if let Err(e) = sandbox.interrupt().await {
                warn!("Failed to interrupt {}: {}", sandbox.id(), e);
            }
        }

        debug!(sandbox = sandbox.id(), state = ?EngineState::Draining, "Draining output");
        if self.drain(&mut execution.output, &mut forwarder, cancel).await {
            return Ok(RunOutcome::Cancelled);
        }
        forwarder.flush();

        let code = match finished {
            Finished::Exited(code) => {
                if let Some(guidance) = exit_guidance(code, sandbox, &plan.command) {
                    events.output(StreamKind::Stderr, guidance);
                }
                code
            }
            Finished::TimedOut => {
                let limit = self.config.timeout.map(|t| t.as_secs()).unwrap_or_default();
                events.output(
                    StreamKind::Stderr,
                    format!("\nExecution timed out after {} seconds and was stopped.\n", limit),
                );
                TIMEOUT_EXIT_CODE
            }
        };

        for artifact in self.extractor.collect(sandbox).await {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            events.emit(extract::to_event(&artifact).into());
        }

        if cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        events.exit(code);

        Ok(match finished {
            Finished::Exited(code) => RunOutcome::Exited(code),
            Finished::TimedOut => RunOutcome::TimedOut,
        })
    }

    /// Forward trailing output; returns true when cancelled
    async fn drain(
        &self,
        output: &mut mpsc::Receiver<OutputChunk>,
        forwarder: &mut OutputForwarder<'_>,
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = Instant::now() + self.config.drain_timeout;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return true,
                chunk = output.recv() => match chunk {
                    Some(chunk) => forwarder.forward(chunk),
                    None => return false,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Output still open after drain timeout, moving on");
                    return false;
                }
            }
        }
    }
}

/// Actionable text for exit codes that usually mean a broken environment
fn exit_guidance(code: i32, sandbox: &dyn Sandbox, command: &str) -> Option<String> {
    match code {
        NOT_FOUND_EXIT_CODE => {
            let mut text = format!(
                "\n[{}] Exit code 127: command not found. The program in `{}` is not installed in this sandbox; check the runtime image or the entry command.\n",
                sandbox.kind(),
                command
            );
            if let Some(report) = sandbox.diagnostics(command) {
                text.push_str(&report);
            }
            Some(text)
        }
        KILLED_EXIT_CODE => Some(format!(
            "\n[{}] Exit code 137: the process was killed, most likely because it exceeded the sandbox memory limit.\n",
            sandbox.kind()
        )),
        _ => None,
    }
}
