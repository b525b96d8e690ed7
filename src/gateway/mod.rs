//! Gateway module - WebSocket front door for browser clients
//!
//! Every WebSocket connection is one client with one session. Client messages
//! drive the session manager; server events are pushed back as JSON frames.
//!
//! - protocol.rs: client → server messages
//! - server.rs: axum router, per-connection tasks, graceful shutdown

pub mod protocol;
mod server;

pub use protocol::{ClientMessage, RunCode};
pub use server::{build_router, serve, AppState, HealthResponse};
