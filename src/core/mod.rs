//! Core runtime infrastructure.
//!
//! - `config` - Configuration parsing and validation
//! - `runtime` - Listener wiring and shutdown

pub mod config;
pub mod runtime;

pub use config::*;
pub use runtime::*;
