//! Core module - Data model shared by every layer
//!
//! - types.rs: requests, output chunks, artifacts and the backend kind
//! - events.rs: events pushed to a connected client and the sink that carries them

pub mod events;
pub mod types;

pub use events::{EventSink, ServerEvent};
pub use types::*;
