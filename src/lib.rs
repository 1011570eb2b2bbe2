#![warn(unused, dead_code)]
#![deny(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
// Control flow style
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::single_match_else)]
#![allow(clippy::manual_let_else)]
// Passing style
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
// Self usage
#![allow(clippy::unused_self)]
// Option/Result patterns
#![allow(clippy::option_if_let_else)]
#![allow(clippy::map_unwrap_or)]
// Explicit type bounds
#![allow(clippy::significant_drop_tightening)]
// Error handling style
#![allow(clippy::result_large_err)]
// Async functions that may not await yet
#![allow(clippy::unused_async)]

//! Gatehouse - MQTT broker whose connect, subscribe and publish checks are
//! delegated to a remote HTTP permission service.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::runtime` - Listener wiring and shutdown
//!
//! ## Authorization
//! - `authz::client` - Remote permission client
//! - `authz::cache` - Per-session topic decision cache
//! - `authz::session` - Identities and the session store
//! - `authz::bridge` - Connect/subscribe/publish hooks
//!
//! ## Broker
//! - `broker::protocol` - MQTT 3.1/3.1.1 codec
//! - `broker::router` - Subscription fan-out
//! - `broker::connection` - Per-connection session loop
//!
//! ## Networking
//! - `net::listeners` - TCP and WebSocket listeners
//!
//! ## Operations
//! - `ops::lifecycle` - Connection lifecycle events
//! - `ops::telemetry` - Logging setup

// Core infrastructure
pub mod core;

// Authorization
pub mod authz;

// Protocol engine
pub mod broker;

// Networking
pub mod net;

// Operations
pub mod ops;

// CLI
pub mod cli;

pub use self::core::{config, runtime};
pub use ops::{lifecycle, telemetry};
