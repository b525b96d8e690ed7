//! Codeplay CLI
//!
//! One-shot runs through the same session machinery the gateway uses, plus
//! configuration helpers.

use clap::{Parser, Subcommand};
use console::style;
use codeplay::config::{
    config_path, load_config, save_config, validate_config, BackendPreference, Config,
};
use codeplay::core::{EventSink, ExecutionRequest, ServerEvent, StreamKind};
use codeplay::engine::ExecutionEngine;
use codeplay::sandbox::{detect_backend, resolve_interpreter};
use codeplay::{codec, Error, Result, SessionManager, VERSION};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

const CLI_CLIENT_ID: &str = "cli";

#[derive(Parser)]
#[command(
    name = "codeplay",
    version = VERSION,
    about = "Codeplay - sandboxed code execution",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a source file in a fresh sandbox
    Run {
        /// Source file; its extension picks the defaults below
        file: PathBuf,
        /// Runtime image
        #[arg(long)]
        image: Option<String>,
        /// Entry command template, e.g. `python3` or `node {file}`
        #[arg(long)]
        entry: Option<String>,
        /// Dependency install template, e.g. `pip install {deps}`
        #[arg(long)]
        install: Option<String>,
        /// Code prepended to the source
        #[arg(long)]
        setup: Option<String>,
        /// Extra file copied into the workspace (repeatable)
        #[arg(long = "attach", short = 'a')]
        attachments: Vec<PathBuf>,
        /// Sandbox backend: auto, container or local
        #[arg(long)]
        backend: Option<BackendPreference>,
    },

    /// Show which sandbox backend would serve sessions
    Doctor,

    /// Write a sample configuration file
    InitConfig {
        /// Destination (defaults to the user config path)
        #[arg(long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },

    /// Validate the loaded configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                "codeplay=warn"
                    .parse()
                    .map_err(|e| Error::Config(format!("Invalid log directive: {}", e)))?,
            ),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run {
            file,
            image,
            entry,
            install,
            setup,
            attachments,
            backend,
        }) => {
            let options = RunOptions {
                image,
                entry,
                install,
                setup,
                attachments,
                backend,
            };
            let code = run_file(&file, options).await?;
            std::process::exit(code);
        }
        Some(Commands::Doctor) => doctor().await,
        Some(Commands::InitConfig { path, force }) => init_config(path, force),
        Some(Commands::Validate) => validate(),
        None => {
            println!(
                "{} v{} - run {} for usage",
                style("codeplay").cyan().bold(),
                VERSION,
                style("codeplay --help").yellow()
            );
            Ok(())
        }
    }
}

// ============================================================================
// Run
// ============================================================================

struct RunOptions {
    image: Option<String>,
    entry: Option<String>,
    install: Option<String>,
    setup: Option<String>,
    attachments: Vec<PathBuf>,
    backend: Option<BackendPreference>,
}

/// Default (language, image, entry) for a file extension
fn language_defaults(extension: &str) -> Option<(&'static str, &'static str, &'static str)> {
    match extension {
        "py" => Some(("python", "python:3.12-slim", "python3")),
        "js" | "mjs" => Some(("javascript", "node:20-slim", "node")),
        "ts" => Some(("typescript", "denoland/deno:latest", "deno run -A {file}")),
        "rb" => Some(("ruby", "ruby:3.3-slim", "ruby")),
        "sh" => Some(("shell", "bash:5", "sh")),
        _ => None,
    }
}

async fn run_file(file: &Path, options: RunOptions) -> Result<i32> {
    let mut config = load_config()?;
    if let Some(backend) = options.backend {
        config.sandbox.backend = backend;
    }

    let source = std::fs::read_to_string(file).map_err(|e| {
        Error::InvalidInput(format!("Cannot read {}: {}", file.display(), e))
    })?;
    let extension = file
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let defaults = language_defaults(&extension);
    let language = defaults.map(|d| d.0).unwrap_or("plain");
    let image = options
        .image
        .or_else(|| defaults.map(|d| d.1.to_string()))
        .ok_or_else(|| {
            Error::InvalidInput(format!("No default image for .{} files, pass --image", extension))
        })?;
    let entry = options
        .entry
        .or_else(|| defaults.map(|d| d.2.to_string()))
        .ok_or_else(|| {
            Error::InvalidInput(format!("No default entry for .{} files, pass --entry", extension))
        })?;

    let mut request = ExecutionRequest::new(source, extension.clone(), entry);
    if let Some(install) = options.install {
        request = request.with_install_command(install);
    }
    if let Some(setup) = options.setup {
        request = request.with_setup_code(setup);
    }
    for path in &options.attachments {
        let bytes = std::fs::read(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::InvalidInput(format!("Not a file: {}", path.display())))?;
        request = request.with_file(name, codec::encode(&bytes));
    }

    let backend = detect_backend(&config.sandbox).await?;
    let engine = ExecutionEngine::new((&config.sandbox).into());
    let manager = Arc::new(SessionManager::new(backend, engine));

    let (events, mut rx) = EventSink::channel();
    manager.connect(CLI_CLIENT_ID).await;
    manager
        .init_session(CLI_CLIENT_ID, &events, language, &image)
        .await;

    match rx.recv().await {
        Some(ServerEvent::SessionReady { mode }) => {
            eprintln!(
                "{}",
                style(format!("Running {} in {} sandbox ({})", file.display(), mode, image)).dim()
            );
        }
        Some(ServerEvent::Error { message }) => {
            eprintln!("{} {}", style("✗").red(), message);
            manager.shutdown().await;
            return Ok(1);
        }
        other => {
            manager.shutdown().await;
            return Err(Error::Internal(format!(
                "Unexpected event during init: {:?}",
                other
            )));
        }
    }

    let printer = tokio::spawn(print_events(rx));

    let run = {
        let manager = manager.clone();
        let events = events.clone();
        tokio::spawn(async move { manager.run_code(CLI_CLIENT_ID, &events, request).await })
    };

    tokio::select! {
        result = run => {
            if let Err(e) = result {
                eprintln!("{} Run task failed: {}", style("✗").red(), e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n{}", style("Interrupted, stopping sandbox...").yellow());
        }
    }

    manager.shutdown().await;
    drop(events);

    let code = printer
        .await
        .map_err(|e| Error::Internal(format!("Output task failed: {}", e)))?;
    Ok(code.unwrap_or(130))
}

/// Print events until the sink closes; returns the program's exit code
async fn print_events(mut rx: mpsc::UnboundedReceiver<ServerEvent>) -> Option<i32> {
    let mut exit_code = None;
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();

    while let Some(event) = rx.recv().await {
        match event {
            ServerEvent::Output {
                stream: StreamKind::Stdout,
                data,
            } => {
                let _ = stdout.write_all(data.as_bytes());
                let _ = stdout.flush();
            }
            ServerEvent::Output {
                stream: StreamKind::Stderr,
                data,
            } => {
                let _ = stderr.write_all(data.as_bytes());
                let _ = stderr.flush();
            }
            ServerEvent::Exit { code } => {
                exit_code = Some(code);
                let marker = if code == 0 {
                    style(format!("exit {}", code)).green()
                } else {
                    style(format!("exit {}", code)).red()
                };
                eprintln!("{}", marker.dim());
            }
            ServerEvent::Error { message } => {
                eprintln!("{} {}", style("✗").red(), message);
                exit_code.get_or_insert(1);
            }
            ServerEvent::SessionReady { .. } => {}
        }
    }

    exit_code
}

// ============================================================================
// Doctor / config
// ============================================================================

async fn doctor() -> Result<()> {
    let config = load_config()?;
    println!("Preference: {}", style(config.sandbox.backend).cyan());

    match detect_backend(&config.sandbox).await {
        Ok(backend) => {
            println!("{} Backend: {}", style("✓").green(), style(backend.kind()).cyan());
        }
        Err(e) => {
            println!("{} {}", style("✗").red(), e);
            return Err(e);
        }
    }

    println!("Local interpreters:");
    for image in ["python:3.12-slim", "node:20-slim", "ruby:3.3-slim", "bash:5"] {
        match resolve_interpreter(image) {
            Some(interpreter) if which::which(interpreter).is_ok() => {
                println!("   {} {} -> {}", style("✓").green(), image, interpreter)
            }
            Some(interpreter) => {
                println!("   {} {} -> {} (not on PATH)", style("○").dim(), image, interpreter)
            }
            None => println!("   {} {} -> unknown", style("○").dim(), image),
        }
    }
    Ok(())
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(config_path);
    if path.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists, use --force to overwrite",
            path.display()
        )));
    }

    save_config(&Config::default(), &path)?;
    println!("{} Wrote {}", style("✓").green(), path.display());
    Ok(())
}

fn validate() -> Result<()> {
    let config = load_config()?;
    let result = validate_config(&config);

    for issue in &result.warnings {
        println!("{} {}", style("⚠").yellow(), issue);
    }
    for issue in &result.errors {
        println!("{} {}", style("✗").red(), issue);
    }

    if result.valid {
        println!("{} Configuration is valid", style("✓").green());
        Ok(())
    } else {
        Err(Error::Config(format!(
            "{} error(s) in configuration",
            result.errors.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_defaults() {
        assert_eq!(
            language_defaults("py"),
            Some(("python", "python:3.12-slim", "python3"))
        );
        assert_eq!(language_defaults("js").map(|d| d.2), Some("node"));
        assert!(language_defaults("xyz").is_none());
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "codeplay", "run", "main.py", "--attach", "data.csv", "--backend", "local",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Run {
                file,
                attachments,
                backend,
                ..
            }) => {
                assert_eq!(file, PathBuf::from("main.py"));
                assert_eq!(attachments, vec![PathBuf::from("data.csv")]);
                assert_eq!(backend, Some(BackendPreference::Local));
            }
            _ => panic!("expected run"),
        }
    }
}
