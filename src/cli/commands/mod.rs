//! CLI command implementations.

mod probe;
mod start;

pub use probe::run_probe;
pub use start::run_start;
