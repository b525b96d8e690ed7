//! Configuration I/O - Loading and saving configuration
//!
//! Handles reading configuration from files and environment variables.

use std::path::Path;

use super::types::Config;
use crate::error::{Error, Result};

/// Load configuration with layered precedence:
/// 1. Config file (config.json / config.toml) if it exists, otherwise defaults
/// 2. Environment variable overrides (including `.env`)
pub fn load_config() -> Result<Config> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    let config: Config = if path.extension().is_some_and(|ext| ext == "json") {
        // JSON5 is a superset of JSON and tolerates comments
        json5::from_str(&content).map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?
    } else if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?
    } else {
        json5::from_str(&content)
            .or_else(|_| toml::from_str(&content).map_err(|e| Error::Config(e.to_string())))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
    };

    Ok(config)
}

/// Apply environment variable overrides to an existing config.
///
/// Loads `.env` first, then overlays every recognised variable. Env vars sit
/// above the config file in precedence; CLI flags are applied by the binaries
/// afterwards.
pub fn apply_env_overrides(config: &mut Config) {
    dotenvy::dotenv().ok();
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

fn apply_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    // Sandbox overrides
    if let Some(backend) = lookup("CODEPLAY_BACKEND") {
        if let Ok(backend) = backend.parse() {
            config.sandbox.backend = backend;
        }
    }
    if let Some(network) = lookup("CODEPLAY_NETWORK") {
        if let Ok(network) = network.parse() {
            config.sandbox.container.network = network;
        }
    }
    if let Some(memory) = lookup("CODEPLAY_MEMORY_LIMIT") {
        config.sandbox.container.memory_limit = memory;
    }
    if let Some(cpu) = lookup("CODEPLAY_CPU_LIMIT") {
        if let Ok(v) = cpu.parse() {
            config.sandbox.container.cpu_limit = v;
        }
    }
    if let Some(timeout) = lookup("CODEPLAY_RUN_TIMEOUT") {
        if let Ok(v) = timeout.parse() {
            config.sandbox.default_timeout_secs = v;
        }
    }

    // Gateway overrides
    if let Some(bind) = lookup("CODEPLAY_BIND") {
        config.gateway.bind = bind;
    }
    if let Some(port) = lookup("CODEPLAY_PORT") {
        if let Ok(port) = port.parse() {
            config.gateway.port = port;
        }
    }
}

/// Save configuration to a file
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let content = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    } else {
        serde_json::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(path, content)?;
    Ok(())
}
