//! Operations.
//!
//! - `lifecycle` - Connection lifecycle events
//! - `telemetry` - Logging setup

pub mod lifecycle;
pub mod telemetry;

pub use lifecycle::{LifecycleEvent, LifecycleLogger};
pub use telemetry::init_tracing;
