//! CLI argument definitions using clap.

use crate::config::{Config, LogFormat, Scheme};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Gatehouse - MQTT broker with remote topic authorization.
#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(version)]
#[command(about = "MQTT broker that checks connect, subscribe and publish against a remote permission service")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the broker
    Start(StartArgs),

    /// Run a single permission check against the remote service
    Probe(ProbeArgs),
}

// -----------------------------------------------------------------------------
// Shared remote settings
// -----------------------------------------------------------------------------

#[derive(Args, Clone, Default)]
pub struct RemoteArgs {
    /// Optional TOML or JSON configuration file; flags override its values
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Permission service host
    #[arg(short = 'H', long = "remote-host")]
    pub host: Option<String>,

    /// Permission service port
    #[arg(long = "remote-port")]
    pub port: Option<u16>,

    /// Base path every resource is joined onto
    #[arg(short = 'u', long = "remote-path")]
    pub base_path: Option<String>,

    /// Scheme used to reach the permission service (http or https)
    #[arg(short = 'p', long = "protocol")]
    pub scheme: Option<Scheme>,

    /// Per-check timeout in milliseconds
    #[arg(long = "check-timeout-ms")]
    pub timeout_ms: Option<u64>,

    /// Maximum concurrent outbound checks
    #[arg(long = "max-inflight-checks")]
    pub max_inflight: Option<usize>,
}

impl RemoteArgs {
    /// Load the config file (or defaults) and apply remote overrides.
    pub fn load(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        let remote = &mut config.remote;
        if let Some(host) = &self.host {
            remote.host = host.clone();
        }
        if let Some(port) = self.port {
            remote.port = port;
        }
        if let Some(base_path) = &self.base_path {
            remote.base_path = base_path.clone();
        }
        if let Some(scheme) = self.scheme {
            remote.scheme = scheme;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            remote.timeout_ms = timeout_ms;
        }
        if let Some(max_inflight) = self.max_inflight {
            remote.max_inflight = max_inflight;
        }
        Ok(config)
    }
}

// -----------------------------------------------------------------------------
// Start command
// -----------------------------------------------------------------------------

#[derive(Args, Clone, Default)]
pub struct StartArgs {
    #[command(flatten)]
    pub remote: RemoteArgs,

    /// Enable the raw MQTT listener
    #[arg(short = 'm', long)]
    pub mqtt: bool,

    /// MQTT listener port
    #[arg(long)]
    pub mqtt_port: Option<u16>,

    /// Enable the MQTT-over-WebSocket listener
    #[arg(short = 'w', long)]
    pub websockets: bool,

    /// WebSocket listener port
    #[arg(long)]
    pub websocket_port: Option<u16>,

    /// Address the listeners bind to
    #[arg(long)]
    pub bind: Option<String>,

    /// Cached decisions kept per action per connection
    #[arg(long)]
    pub max_cached_topics: Option<usize>,

    /// Log at debug level
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Explicit log filter directive, e.g. "info,gatehouse=trace"
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
}

impl StartArgs {
    /// Resolve the effective configuration: defaults, then file, then flags.
    pub fn resolve(&self) -> Result<Config> {
        let mut config = self.remote.load()?;
        let listeners = &mut config.listeners;
        if self.mqtt {
            listeners.mqtt.enabled = true;
        }
        if let Some(port) = self.mqtt_port {
            listeners.mqtt.port = port;
        }
        if self.websockets {
            listeners.websocket.enabled = true;
        }
        if let Some(port) = self.websocket_port {
            listeners.websocket.port = port;
        }
        if let Some(bind) = &self.bind {
            listeners.bind_host = bind.clone();
        }
        if let Some(max) = self.max_cached_topics {
            config.authz.max_cached_topics = max;
        }
        let telemetry = &mut config.telemetry;
        if self.debug {
            telemetry.debug = true;
        }
        if let Some(level) = &self.log_level {
            telemetry.log_level = Some(level.clone());
        }
        if let Some(format) = self.log_format {
            telemetry.log_format = format;
        }
        Ok(config)
    }
}

// -----------------------------------------------------------------------------
// Probe command
// -----------------------------------------------------------------------------

#[derive(Args, Clone)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub remote: RemoteArgs,

    /// Identity principal, sent as the token header
    #[arg(long)]
    pub token: String,

    /// Identity secret, sent as the key header
    #[arg(long)]
    pub key: String,

    /// Resource to check
    #[arg(default_value = crate::authz::IDENTITY_RESOURCE)]
    pub resource: String,
}
