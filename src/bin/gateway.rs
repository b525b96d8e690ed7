//! Codeplay Gateway
//!
//! WebSocket server that runs browser-submitted code in per-client sandboxes.

use clap::Parser;
use codeplay::config::{
    apply_env_overrides, load_config, load_config_from_path, validate_config, BackendPreference,
    Config,
};
use codeplay::engine::ExecutionEngine;
use codeplay::sandbox::detect_backend;
use codeplay::{gateway, SessionManager};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "codeplay-gateway",
    version = codeplay::VERSION,
    about = "Codeplay sandboxed execution gateway"
)]
struct Args {
    /// Config file (defaults to the user config directory)
    #[arg(long, short, env = "CODEPLAY_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Port
    #[arg(long, short)]
    port: Option<u16>,

    /// Sandbox backend: auto, container or local
    #[arg(long)]
    backend: Option<BackendPreference>,
}

fn load(args: &Args) -> codeplay::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let mut config = load_config_from_path(path)?;
            apply_env_overrides(&mut config);
            config
        }
        None => load_config()?,
    };

    if let Some(bind) = &args.bind {
        config.gateway.bind = bind.clone();
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    if let Some(backend) = args.backend {
        config.sandbox.backend = backend;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("codeplay=info".parse()?)
                .add_directive("tower_http=info".parse()?),
        )
        .init();

    info!("Starting Codeplay Gateway v{}", codeplay::VERSION);

    let args = Args::parse();
    let config = load(&args)?;

    let validation = validate_config(&config);
    for issue in &validation.warnings {
        warn!("Config: {}", issue);
    }
    if !validation.valid {
        for issue in &validation.errors {
            error!("Config: {}", issue);
        }
        anyhow::bail!("Invalid configuration");
    }

    let backend = detect_backend(&config.sandbox).await?;
    info!("Sandbox backend: {}", backend.kind());

    let engine = ExecutionEngine::new((&config.sandbox).into());
    let manager = Arc::new(SessionManager::new(backend, engine));

    gateway::serve(&config.gateway, manager).await?;

    info!("Gateway stopped");
    Ok(())
}
