//! # Codeplay
//!
//! Sandboxed code-execution backend for a browser playground.
//!
//! ## Features
//!
//! - **Session isolation:** one sandbox per connected client, torn down on disconnect
//! - **Two strategies:** Docker containers with resource limits, or local processes as a fallback
//! - **Streaming output:** stdout/stderr forwarded as they are produced, in order
//! - **Result artifacts:** plots and other result files delivered after the run
//! - **WebSocket gateway:** JSON protocol plus a health endpoint

pub mod codec;
pub mod command;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod sandbox;
pub mod session;

pub use config::Config;
pub use engine::{EngineConfig, ExecutionEngine, RunOutcome};
pub use error::{Error, Result};
pub use session::SessionManager;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
