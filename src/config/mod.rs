//! Configuration module
//!
//! - types/mod.rs: top-level Config and GatewayConfig
//! - types/sandbox.rs: sandbox/execution configuration
//! - io.rs: configuration loading and saving
//! - validation.rs: configuration validation
//! - paths.rs: configuration file paths

mod io;
mod paths;
mod types;
mod validation;

pub use types::{Config, GatewayConfig};

pub use types::sandbox::{
    parse_memory_limit, BackendPreference, ContainerConfig, LocalConfig, NetworkPolicy,
    SandboxConfig,
};

pub use io::{apply_env_overrides, load_config, load_config_from_path, save_config};
pub use paths::{config_dir, config_path};
pub use validation::{validate_config, ConfigValidationResult, ValidationIssue};
