//! Minimal MQTT 3.1/3.1.1 engine that calls into the authorization bridge.
//!
//! - `protocol` - Control packet codec
//! - `topics` - Topic validation and wildcard matching
//! - `router` - Subscription table and fan-out
//! - `connection` - Per-connection session loop

pub mod connection;
pub mod protocol;
pub mod router;
pub mod topics;

pub use connection::{handle_connection, BrokerCtx, CONNECT_TIMEOUT};
pub use router::Router;
