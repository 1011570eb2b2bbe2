use anyhow::{bail, Context, Result};
use reqwest::Url;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

const DEFAULT_REMOTE_HOST: &str = "localhost";
const DEFAULT_REMOTE_PORT: u16 = 80;
const DEFAULT_REMOTE_BASE_PATH: &str = "/weaviate/v1";
const DEFAULT_CHECK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_INFLIGHT_CHECKS: usize = 64;
const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_WEBSOCKET_PORT: u16 = 8888;
const DEFAULT_BIND_HOST: &str = "0.0.0.0";
const DEFAULT_MAX_CACHED_TOPICS: usize = 4_096;

/// Top-level configuration for the broker.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub listeners: ListenerConfig,
    pub authz: AuthzConfig,
    pub telemetry: TelemetryConfig,
}

/// Where and how to reach the remote permission service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub base_path: String,
    pub scheme: Scheme,
    /// Bound on a single check, including time spent waiting for an outbound slot.
    pub timeout_ms: u64,
    /// Cap on concurrent outbound checks.
    pub max_inflight: usize,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_REMOTE_HOST.into(),
            port: DEFAULT_REMOTE_PORT,
            base_path: DEFAULT_REMOTE_BASE_PATH.into(),
            scheme: Scheme::Https,
            timeout_ms: DEFAULT_CHECK_TIMEOUT_MS,
            max_inflight: DEFAULT_MAX_INFLIGHT_CHECKS,
        }
    }
}

impl RemoteConfig {
    /// Base URL every resource path is joined onto.
    pub fn base_url(&self) -> Result<Url> {
        let path = if self.base_path.starts_with('/') {
            self.base_path.clone()
        } else {
            format!("/{}", self.base_path)
        };
        let raw = format!("{}://{}:{}{}", self.scheme, self.host, self.port, path);
        Url::parse(&raw).with_context(|| format!("invalid remote url {raw}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl FromStr for Scheme {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => bail!("invalid protocol {other}; expected http or https"),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => f.write_str("http"),
            Scheme::Https => f.write_str("https"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind_host: String,
    pub mqtt: MqttListenerConfig,
    pub websocket: WebsocketListenerConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST.into(),
            mqtt: MqttListenerConfig::default(),
            websocket: WebsocketListenerConfig::default(),
        }
    }
}

impl ListenerConfig {
    pub fn any_enabled(&self) -> bool {
        self.mqtt.enabled || self.websocket.enabled
    }

    pub fn mqtt_bind(&self) -> String {
        format!("{}:{}", self.bind_host, self.mqtt.port)
    }

    pub fn websocket_bind(&self) -> String {
        format!("{}:{}", self.bind_host, self.websocket.port)
    }
}

/// Raw MQTT-over-TCP listener.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct MqttListenerConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MqttListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_MQTT_PORT,
        }
    }
}

/// MQTT framed over WebSocket on a plain HTTP listener.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WebsocketListenerConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for WebsocketListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: DEFAULT_WEBSOCKET_PORT,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthzConfig {
    /// Per-session bound on memoized topics, applied to each action separately.
    pub max_cached_topics: usize,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            max_cached_topics: DEFAULT_MAX_CACHED_TOPICS,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub debug: bool,
    /// Explicit filter directive; overrides `debug` when set.
    pub log_level: Option<String>,
    pub log_format: LogFormat,
}

impl TelemetryConfig {
    pub fn effective_level(&self) -> &str {
        match (&self.log_level, self.debug) {
            (Some(level), _) => level.as_str(),
            (None, true) => "debug",
            (None, false) => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// Configuration is unusable because no listener is enabled.
#[derive(Debug, thiserror::Error)]
#[error("at least one listener (mqtt or websockets) must be enabled")]
pub struct NoListenerEnabled;

impl Config {
    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.host.trim().is_empty() {
            bail!("remote.host must be non-empty");
        }
        if self.remote.timeout_ms == 0 {
            bail!("remote.timeout_ms must be > 0");
        }
        if self.remote.max_inflight == 0 {
            bail!("remote.max_inflight must be > 0");
        }
        if self.authz.max_cached_topics == 0 {
            bail!("authz.max_cached_topics must be > 0");
        }
        self.remote.base_url()?;
        let listeners = &self.listeners;
        if !listeners.any_enabled() {
            return Err(NoListenerEnabled.into());
        }
        if listeners.mqtt.enabled
            && listeners.websocket.enabled
            && listeners.mqtt.port == listeners.websocket.port
            && listeners.mqtt.port != 0
        {
            bail!(
                "mqtt and websocket listeners cannot share port {}",
                listeners.mqtt.port
            );
        }
        Ok(())
    }

    /// Emit the effective settings at debug level.
    pub fn log_effective(&self) {
        tracing::debug!("remote host set to: {}", self.remote.host);
        tracing::debug!("remote port set to: {}", self.remote.port);
        tracing::debug!("remote base path set to: {}", self.remote.base_path);
        tracing::debug!("protocol set to: {}", self.remote.scheme);
        tracing::debug!("check timeout set to: {}ms", self.remote.timeout_ms);
        tracing::debug!("max inflight checks set to: {}", self.remote.max_inflight);
        tracing::debug!("debugging set to: {}", self.telemetry.debug);
        tracing::debug!("mqtt set to: {}", self.listeners.mqtt.enabled);
        tracing::debug!("mqtt port set to: {}", self.listeners.mqtt.port);
        tracing::debug!("websockets set to: {}", self.listeners.websocket.enabled);
        tracing::debug!("websocket port set to: {}", self.listeners.websocket.port);
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn enabled() -> Config {
        let mut cfg = Config::default();
        cfg.listeners.mqtt.enabled = true;
        cfg
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.remote.host, "localhost");
        assert_eq!(cfg.remote.port, 80);
        assert_eq!(cfg.remote.base_path, "/weaviate/v1");
        assert_eq!(cfg.remote.scheme, Scheme::Https);
        assert_eq!(cfg.listeners.mqtt.port, 1883);
        assert_eq!(cfg.listeners.websocket.port, 8888);
        assert!(!cfg.telemetry.debug);
        assert_eq!(cfg.telemetry.effective_level(), "info");
    }

    #[test]
    fn no_listener_is_reported_distinctly() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.downcast_ref::<NoListenerEnabled>().is_some());
        assert!(enabled().validate().is_ok());
    }

    #[test]
    fn scheme_accepts_only_http_variants() {
        assert_eq!("HTTP".parse::<Scheme>().unwrap(), Scheme::Http);
        assert_eq!("https".parse::<Scheme>().unwrap(), Scheme::Https);
        let err = "ftp".parse::<Scheme>().unwrap_err();
        assert!(format!("{err}").contains("invalid protocol ftp"));
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut cfg = enabled();
        cfg.remote.timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn shared_listener_port_rejected() {
        let mut cfg = enabled();
        cfg.listeners.websocket.enabled = true;
        cfg.listeners.websocket.port = cfg.listeners.mqtt.port;
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err}").contains("cannot share port"));
    }

    #[test]
    fn base_url_normalizes_leading_slash() {
        let remote = RemoteConfig {
            base_path: "api/v1".into(),
            scheme: Scheme::Http,
            port: 8080,
            ..RemoteConfig::default()
        };
        assert_eq!(
            remote.base_url().unwrap().as_str(),
            "http://localhost:8080/api/v1"
        );
    }

    #[test]
    fn loads_partial_toml_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gatehouse.toml");
        fs::write(
            &path,
            r#"
[remote]
host = "permissions.internal"
scheme = "http"
timeout_ms = 250

[listeners.mqtt]
enabled = true

[telemetry]
debug = true
"#,
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.remote.host, "permissions.internal");
        assert_eq!(cfg.remote.scheme, Scheme::Http);
        assert_eq!(cfg.remote.timeout_ms, 250);
        assert_eq!(cfg.remote.port, 80);
        assert!(cfg.listeners.mqtt.enabled);
        assert_eq!(cfg.listeners.mqtt.port, 1883);
        assert!(!cfg.listeners.websocket.enabled);
        assert_eq!(cfg.telemetry.effective_level(), "debug");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn loads_json_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gatehouse.json");
        fs::write(
            &path,
            r#"{"listeners": {"websocket": {"enabled": true, "port": 9001}}}"#,
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert!(cfg.listeners.websocket.enabled);
        assert_eq!(cfg.listeners.websocket.port, 9001);
        assert_eq!(cfg.listeners.mqtt.port, 1883);
    }

    #[test]
    fn unknown_scheme_in_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[remote]\nscheme = \"ftp\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
