//! Sessions - one per connected client
//!
//! - registry.rs: the concurrency-safe client → session map
//! - manager.rs: lifecycle (init, run, stop, disconnect) on top of a backend

mod manager;
mod registry;

pub use manager::SessionManager;
pub use registry::{Session, SessionRegistry};
