//! Configuration validation
//!
//! Validates configuration and reports issues.

use super::types::sandbox::{parse_memory_limit, NetworkPolicy};
use super::types::Config;

/// Result of configuration validation
#[derive(Debug, Clone)]
pub struct ConfigValidationResult {
    /// Whether the config is valid
    pub valid: bool,
    /// Validation errors (critical)
    pub errors: Vec<ValidationIssue>,
    /// Validation warnings (non-critical)
    pub warnings: Vec<ValidationIssue>,
}

impl ConfigValidationResult {
    /// Create a valid result
    pub fn valid() -> Self {
        ConfigValidationResult {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error
    pub fn with_error(mut self, issue: ValidationIssue) -> Self {
        self.valid = false;
        self.errors.push(issue);
        self
    }

    /// Add a warning
    pub fn with_warning(mut self, issue: ValidationIssue) -> Self {
        self.warnings.push(issue);
        self
    }
}

/// A validation issue
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Path to the config field
    pub path: String,
    /// Issue message
    pub message: String,
    /// Suggested fix
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    /// Create a new issue
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationIssue {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    /// Add a suggestion
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

/// Validate the configuration
pub fn validate_config(config: &Config) -> ConfigValidationResult {
    let mut result = ConfigValidationResult::valid();

    result = validate_sandbox_config(config, result);
    result = validate_gateway_config(config, result);

    result
}

fn validate_sandbox_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    let sandbox = &config.sandbox;
    let container = &sandbox.container;

    if parse_memory_limit(&container.memory_limit).is_none() {
        result = result.with_error(
            ValidationIssue::new(
                "sandbox.container.memory_limit",
                format!("Unparseable memory limit: {}", container.memory_limit),
            )
            .with_suggestion("Use a size such as 256m or 1g"),
        );
    }

    if !(container.cpu_limit > 0.0 && container.cpu_limit <= 64.0) {
        result = result.with_error(ValidationIssue::new(
            "sandbox.container.cpu_limit",
            format!("CPU limit must be in (0, 64], got {}", container.cpu_limit),
        ));
    }

    if container.cpu_period < 1_000 || container.cpu_period > 1_000_000 {
        result = result.with_error(ValidationIssue::new(
            "sandbox.container.cpu_period",
            "CFS period must be between 1000 and 1000000 microseconds",
        ));
    }

    if container.keepalive.is_empty() {
        result = result.with_error(
            ValidationIssue::new(
                "sandbox.container.keepalive",
                "A keep-alive command is required so containers survive between runs",
            )
            .with_suggestion("Use [\"tail\", \"-f\", \"/dev/null\"]"),
        );
    }

    if !container.workdir.starts_with('/') {
        result = result.with_error(ValidationIssue::new(
            "sandbox.container.workdir",
            "Container workspace must be an absolute path",
        ));
    }

    if sandbox.poll_interval_ms == 0 {
        result = result.with_error(ValidationIssue::new(
            "sandbox.poll_interval_ms",
            "Poll interval must be greater than zero",
        ));
    }

    if sandbox.default_timeout_secs == 0 {
        result = result.with_warning(
            ValidationIssue::new(
                "sandbox.default_timeout_secs",
                "Runs have no wall-clock limit; an endless loop holds its sandbox until stop",
            )
            .with_suggestion("Set a timeout such as 30"),
        );
    }

    if container.network == NetworkPolicy::Bridge {
        result = result.with_warning(ValidationIssue::new(
            "sandbox.container.network",
            "Containers get outbound network access",
        ));
    }

    result
}

fn validate_gateway_config(config: &Config, mut result: ConfigValidationResult) -> ConfigValidationResult {
    if config.gateway.port == 0 {
        result = result.with_error(ValidationIssue::new("gateway.port", "Port must not be 0"));
    }

    if config.gateway.bind.parse::<std::net::IpAddr>().is_err() {
        result = result.with_error(ValidationIssue::new(
            "gateway.bind",
            format!("Not an IP address: {}", config.gateway.bind),
        ));
    }

    result
}
