//! Networking layer.
//!
//! - `listeners` - Raw TCP and WebSocket edge listeners feeding the broker engine

pub mod listeners;

pub use listeners::{EdgeListener, Transport};
