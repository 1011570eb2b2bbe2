//! Gatehouse CLI.
//!
//! - `gatehouse start` - Start the broker
//! - `gatehouse probe` - Check one resource against the permission service

mod args;
pub mod commands;

pub use args::{Cli, Commands, ProbeArgs, RemoteArgs, StartArgs};
