//! Local process sandboxes
//!
//! Fallback when no container runtime answers. Commands run through `sh -c`
//! as ordinary host processes inside a per-session scratch directory. There
//! is no isolation beyond the working directory.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{
    demux, sanitize_relative_path, Completion, Execution, Sandbox, SandboxBackend, SandboxSpec,
    OUTPUT_CHANNEL_CAPACITY,
};
use crate::config::{LocalConfig, SandboxConfig};
use crate::core::{BackendKind, StreamKind};
use crate::error::{Error, Result};

/// Runtime image substrings and the host interpreter they map to
const INTERPRETERS: &[(&str, &str)] = &[
    ("pypy", "pypy3"),
    ("python", "python3"),
    ("node", "node"),
    ("deno", "deno"),
    ("bun", "bun"),
    ("ruby", "ruby"),
    ("php", "php"),
    ("perl", "perl"),
    ("golang", "go"),
    ("openjdk", "java"),
    ("temurin", "java"),
    ("gcc", "gcc"),
    ("rust", "rustc"),
    ("bash", "bash"),
    ("alpine", "sh"),
    ("busybox", "sh"),
];

/// Program names that are another spelling of an interpreter
const ALIASES: &[(&str, &str)] = &[("nodejs", "node")];

/// Map a runtime image id to a host interpreter
pub fn resolve_interpreter(runtime_image: &str) -> Option<&'static str> {
    let image = runtime_image.to_lowercase();
    // ignore the registry host, which may contain anything
    let name = image.rsplit('/').next().unwrap_or(&image);
    INTERPRETERS
        .iter()
        .find(|(needle, _)| name.contains(needle))
        .map(|(_, interpreter)| *interpreter)
}

fn local_error(reason: impl Into<String>) -> Error {
    Error::Provisioning {
        mode: BackendKind::Local,
        reason: reason.into(),
    }
}

/// Factory for scratch-directory sandboxes
pub struct LocalBackend {
    config: LocalConfig,
}

impl LocalBackend {
    pub fn new(config: &SandboxConfig) -> Self {
        LocalBackend {
            config: config.local.clone(),
        }
    }
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<Arc<dyn Sandbox>> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("codeplay-");
        let dir = match &self.config.temp_root {
            Some(root) => {
                tokio::fs::create_dir_all(root).await.map_err(|e| {
                    local_error(format!("Failed to create {}: {}", root.display(), e))
                })?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| local_error(format!("Failed to create scratch directory: {}", e)))?;

        let path = dir.path().to_path_buf();
        let interpreter = resolve_interpreter(&spec.runtime_image);
        info!(
            "Created local sandbox {} for session {} (interpreter: {})",
            path.display(),
            spec.session_id,
            interpreter.unwrap_or("none")
        );

        Ok(Arc::new(LocalSandbox {
            id: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            workdir: path.to_string_lossy().into_owned(),
            path,
            dir: Mutex::new(Some(dir)),
            interpreter,
            env: self.config.env.clone(),
            running: Arc::new(Mutex::new(HashSet::new())),
            destroyed: AtomicBool::new(false),
        }))
    }
}

/// A per-session scratch directory on the host
pub struct LocalSandbox {
    id: String,
    workdir: String,
    path: PathBuf,
    dir: Mutex<Option<tempfile::TempDir>>,
    interpreter: Option<&'static str>,
    env: HashMap<String, String>,
    /// Process groups of commands still running here
    running: RunningGroups,
    destroyed: AtomicBool,
}

impl LocalSandbox {
    fn target_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.path.join(sanitize_relative_path(name)?))
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(Error::SandboxLost {
                mode: BackendKind::Local,
                reason: "scratch directory was removed".to_string(),
            })
        }
    }

    fn kill_running(&self) {
        let groups: Vec<u32> = lock_groups(&self.running).iter().copied().collect();
        for pgid in groups {
            kill_group(pgid);
        }
    }

    fn resolve_command(&self, command: &str) -> String {
        match self.interpreter {
            Some(interpreter) => {
                substitute_missing_programs(command, interpreter, |p| which::which(p).is_ok())
            }
            None => command.to_string(),
        }
    }
}

/// Whether `program` names the same interpreter, e.g. `python` for `python3`
fn is_alias(program: &str, interpreter: &str) -> bool {
    let family = |name: &str| {
        name.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.')
            .to_string()
    };
    let family_of_program = family(program);
    (!family_of_program.is_empty() && family_of_program == family(interpreter))
        || ALIASES
            .iter()
            .any(|(alias, target)| *alias == program && *target == interpreter)
}

/// Replace the program of each `&&` step with `interpreter` when the program
/// is a missing alias of it. Anything else is left for the shell to reject.
fn substitute_missing_programs(
    command: &str,
    interpreter: &str,
    exists: impl Fn(&str) -> bool,
) -> String {
    if !exists(interpreter) {
        return command.to_string();
    }

    command
        .split(" && ")
        .map(|step| {
            let trimmed = step.trim_start();
            let program = trimmed.split_whitespace().next().unwrap_or_default();
            if program.is_empty()
                || program == interpreter
                || !is_alias(program, interpreter)
                || exists(program)
            {
                step.to_string()
            } else {
                format!("{}{}", interpreter, &trimmed[program.len()..])
            }
        })
        .collect::<Vec<_>>()
        .join(" && ")
}

fn describe_lookup(program: &str) -> String {
    match which::which(program) {
        Ok(path) => format!("{}={}", program, path.display()),
        Err(_) => format!("{}=missing", program),
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn workdir(&self) -> &str {
        &self.workdir
    }

    async fn write_file(&self, name: &str, contents: &[u8]) -> Result<()> {
        self.ensure_alive()?;
        let target = self.target_path(name)?;
        let write_error = |e: std::io::Error| Error::Write {
            mode: BackendKind::Local,
            path: name.to_string(),
            reason: e.to_string(),
        };

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_error)?;
        }
        tokio::fs::write(&target, contents)
            .await
            .map_err(write_error)?;

        debug!("Wrote {} bytes to {}", contents.len(), target.display());
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<Execution> {
        self.ensure_alive()?;
        let resolved = self.resolve_command(command);
        if let Some(report) = self.diagnostics(command) {
            debug!("{}", report);
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&resolved)
            .current_dir(&self.path)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| Error::Start {
            mode: BackendKind::Local,
            reason: format!("Failed to spawn sh: {}", e),
        })?;

        let (tx, rx) = tokio::sync::mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(demux::forward_reader(stdout, StreamKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(demux::forward_reader(stderr, StreamKind::Stderr, tx));
        }

        // the child leads its own group, so its pid is the group id
        let pgid = child.id();
        if let Some(pgid) = pgid {
            lock_groups(&self.running).insert(pgid);
        }
        debug!("Spawned local process {:?} in {}", pgid, self.workdir);

        Ok(Execution {
            output: rx,
            completion: Box::new(ChildCompletion {
                child,
                pgid,
                running: self.running.clone(),
            }),
        })
    }

    async fn interrupt(&self) -> Result<()> {
        self.kill_running();
        Ok(())
    }

    async fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let target = self.target_path(name)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_file(&self, name: &str) -> Result<()> {
        let target = self.target_path(name)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.kill_running();

        let dir = match self.dir.lock() {
            Ok(mut dir) => dir.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(dir) = dir {
            let path = dir.path().to_path_buf();
            match tokio::task::spawn_blocking(move || dir.close()).await {
                Ok(Ok(())) => info!("Removed local sandbox {}", path.display()),
                Ok(Err(e)) => warn!("Failed to remove {}: {}", path.display(), e),
                Err(e) => warn!("Cleanup task for {} failed: {}", path.display(), e),
            }
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.destroyed.load(Ordering::SeqCst)
    }

    fn diagnostics(&self, command: &str) -> Option<String> {
        let resolved = self.resolve_command(command);
        let mut candidates: Vec<String> = Vec::new();
        if let Some(interpreter) = self.interpreter {
            candidates.push(describe_lookup(interpreter));
        }
        for step in command.split(" && ") {
            if let Some(program) = step.split_whitespace().next() {
                if Some(program) != self.interpreter {
                    candidates.push(describe_lookup(program));
                }
            }
        }

        Some(format!(
            "[Local] platform: {}/{}\n[Local] PATH: {}\n[Local] candidates: {}\n[Local] command: sh -c {}\n",
            std::env::consts::OS,
            std::env::consts::ARCH,
            std::env::var("PATH").unwrap_or_default(),
            candidates.join(", "),
            resolved
        ))
    }
}

/// Exit code of a finished process; signals map to 128 + signal
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

type RunningGroups = Arc<Mutex<HashSet<u32>>>;

fn lock_groups(groups: &Mutex<HashSet<u32>>) -> MutexGuard<'_, HashSet<u32>> {
    match groups.lock() {
        Ok(groups) => groups,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Kill the whole process group so grandchildren do not keep the pipes open
#[cfg(unix)]
fn kill_group(pgid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        Ok(()) => debug!("Killed process group {}", pgid),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Awaits a local child; dropping it kills the child's group
struct ChildCompletion {
    child: Child,
    pgid: Option<u32>,
    running: RunningGroups,
}

impl ChildCompletion {
    fn forget(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            lock_groups(&self.running).remove(&pgid);
        }
    }
}

#[async_trait]
impl Completion for ChildCompletion {
    async fn wait(&mut self) -> Result<i32> {
        let status = self.child.wait().await.map_err(|e| Error::Start {
            mode: BackendKind::Local,
            reason: e.to_string(),
        })?;
        self.forget();
        Ok(exit_code(status))
    }
}

impl Drop for ChildCompletion {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            match self.pgid {
                Some(pgid) => kill_group(pgid),
                None => {
                    if let Err(e) = self.child.start_kill() {
                        warn!("Failed to kill local process: {}", e);
                    }
                }
            }
        }
        self.forget();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn sandbox(image: &str) -> (tempfile::TempDir, Arc<dyn Sandbox>) {
        let root = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default();
        config.local.temp_root = Some(root.path().to_path_buf());
        let backend = LocalBackend::new(&config);
        let sandbox = backend
            .create(&SandboxSpec::new("s1", "shell", image))
            .await
            .unwrap();
        (root, sandbox)
    }

    async fn collect(mut execution: Execution) -> (String, String, i32) {
        let code = execution.completion.wait().await.unwrap();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = execution.output.recv().await {
            match chunk.stream {
                StreamKind::Stdout => stdout.extend(chunk.data),
                StreamKind::Stderr => stderr.extend(chunk.data),
            }
        }
        (
            String::from_utf8(stdout).unwrap(),
            String::from_utf8(stderr).unwrap(),
            code,
        )
    }

    #[test]
    fn test_resolve_interpreter() {
        assert_eq!(resolve_interpreter("python:3.12-slim"), Some("python3"));
        assert_eq!(resolve_interpreter("node:20-alpine"), Some("node"));
        assert_eq!(resolve_interpreter("docker.io/library/ruby:3"), Some("ruby"));
        assert_eq!(resolve_interpreter("golang:1.22"), Some("go"));
        assert_eq!(resolve_interpreter("pypy:3.10"), Some("pypy3"));
        assert_eq!(resolve_interpreter("scratch"), None);
    }

    #[test]
    fn test_substitute_missing_programs() {
        let installed = |p: &str| p == "python3" || p == "pip";
        assert_eq!(
            substitute_missing_programs("python main.py", "python3", installed),
            "python3 main.py"
        );
        assert_eq!(
            substitute_missing_programs("pip install x && python main.py", "python3", installed),
            "pip install x && python3 main.py"
        );
        assert_eq!(
            substitute_missing_programs("python main.py", "python3", |_| false),
            "python main.py"
        );
        assert_eq!(
            substitute_missing_programs("nodejs main.js", "node", |p| p == "node"),
            "node main.js"
        );
    }

    #[test]
    fn test_unrelated_missing_program_is_kept() {
        let installed = |p: &str| p == "python3";
        assert_eq!(
            substitute_missing_programs("nonexistent-binary /w/main.py", "python3", installed),
            "nonexistent-binary /w/main.py"
        );
        assert_eq!(
            substitute_missing_programs("pipp install numpy && python3 main.py", "python3", installed),
            "pipp install numpy && python3 main.py"
        );
        assert!(is_alias("python3.12", "python3"));
        assert!(!is_alias("pip", "python3"));
        assert!(!is_alias("bash", "sh"));
    }

    #[tokio::test]
    async fn test_missing_entry_fails_on_python_image() {
        let (_root, sandbox) = sandbox("python:3.12-slim").await;
        let execution = sandbox.exec("codeplay-nonexistent-binary main.py").await.unwrap();
        let (_, stderr, code) = collect(execution).await;
        assert_eq!(code, 127);
        assert!(stderr.contains("not found"));
    }

    #[tokio::test]
    async fn test_exec_streams_and_exit_code() {
        let (_root, sandbox) = sandbox("alpine").await;
        let execution = sandbox
            .exec("echo out; echo err >&2; exit 3")
            .await
            .unwrap();
        let (stdout, stderr, code) = collect(execution).await;
        assert_eq!(stdout, "out\n");
        assert_eq!(stderr, "err\n");
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_files_live_in_workdir() {
        let (_root, sandbox) = sandbox("alpine").await;
        sandbox.write_file("data/in.txt", b"hello").await.unwrap();
        let (stdout, _, code) = collect(sandbox.exec("cat data/in.txt").await.unwrap()).await;
        assert_eq!((stdout.as_str(), code), ("hello", 0));

        assert_eq!(
            sandbox.read_file("data/in.txt").await.unwrap(),
            Some(b"hello".to_vec())
        );
        sandbox.remove_file("data/in.txt").await.unwrap();
        sandbox.remove_file("data/in.txt").await.unwrap();
        assert_eq!(sandbox.read_file("data/in.txt").await.unwrap(), None);
        assert!(sandbox.write_file("../escape", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_interrupt_kills_running_process() {
        let (_root, sandbox) = sandbox("alpine").await;
        let mut execution = sandbox.exec("sleep 30").await.unwrap();

        let interrupter = sandbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            interrupter.interrupt().await.unwrap();
        });

        let code = tokio::time::timeout(Duration::from_secs(5), execution.completion.wait())
            .await
            .expect("interrupt should end the process")
            .unwrap();
        assert_eq!(code, 137);

        // the sandbox stays usable
        let (stdout, _, _) = collect(sandbox.exec("echo again").await.unwrap()).await;
        assert_eq!(stdout, "again\n");
    }

    #[tokio::test]
    async fn test_interrupt_without_waiting_closes_output() {
        let (_root, sandbox) = sandbox("alpine").await;
        let mut execution = sandbox
            .exec("echo early; (sleep 30; echo late) & sleep 30")
            .await
            .unwrap();

        let first = execution.output.recv().await.unwrap();
        assert_eq!(first.data, b"early\n");

        // nobody polls the completion here; the kill must still land
        sandbox.interrupt().await.unwrap();
        let rest = tokio::time::timeout(Duration::from_secs(5), async {
            let mut rest = Vec::new();
            while let Some(chunk) = execution.output.recv().await {
                rest.extend(chunk.data);
            }
            rest
        })
        .await
        .expect("killing the group closes both pipes");
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_directory_once() {
        let (root, sandbox) = sandbox("alpine").await;
        sandbox.write_file("main.sh", b"echo hi").await.unwrap();
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);

        sandbox.destroy().await.unwrap();
        sandbox.destroy().await.unwrap();
        assert!(!sandbox.is_alive());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
        assert!(matches!(
            sandbox.exec("true").await,
            Err(Error::SandboxLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_diagnostics_report_command() {
        let (_root, sandbox) = sandbox("python:3.12").await;
        let report = sandbox.diagnostics("python3 main.py").unwrap();
        assert!(report.contains("[Local] PATH:"));
        assert!(report.contains("python3="));
        assert!(report.contains("main.py"));
    }
}
