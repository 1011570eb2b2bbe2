//! Remote permission client.
//!
//! Every check is a single HTTP GET against `{scheme}://{host}:{port}{base_path}/{resource}`
//! carrying the identity as two headers. The response is reduced to an
//! [`AccessDecision`]: 2xx is allowed, any other status is denied, and a transport
//! failure or timeout is indeterminate. No retries happen here; the caller decides
//! what an indeterminate result means.

use super::decision::AccessDecision;
use super::session::Identity;
use crate::config::RemoteConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Resource checked at connect time to validate the identity itself.
pub const IDENTITY_RESOURCE: &str = "keys/me";
pub const TOKEN_HEADER: &str = "x-api-token";
pub const KEY_HEADER: &str = "x-api-key";

/// "May identity I access resource R" against the remote source of truth.
#[async_trait]
pub trait PermissionService: Send + Sync + 'static {
    async fn check(&self, identity: &Identity, resource: &str) -> AccessDecision;
}

/// reqwest-backed [`PermissionService`] with a per-check timeout and an outbound concurrency cap.
#[derive(Clone)]
pub struct HttpPermissionClient {
    base: Url,
    timeout: Duration,
    permits: Arc<Semaphore>,
    http: reqwest::Client,
}

impl HttpPermissionClient {
    pub fn from_config(cfg: &RemoteConfig) -> Result<Self> {
        let base = cfg.base_url()?;
        if base.cannot_be_a_base() {
            anyhow::bail!("remote base url {base} cannot carry a resource path");
        }
        let timeout = Duration::from_millis(cfg.timeout_ms);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build permission client")?;
        Ok(Self {
            base,
            timeout,
            permits: Arc::new(Semaphore::new(cfg.max_inflight)),
            http,
        })
    }

    /// Join `resource` onto the base path, percent-encoding each level so topic
    /// characters such as `#` or `?` stay part of the path.
    pub fn resource_url(&self, resource: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            segments.extend(resource.split('/'));
        }
        url
    }

    async fn send(&self, identity: &Identity, url: Url) -> AccessDecision {
        let Ok(_permit) = self.permits.acquire().await else {
            return AccessDecision::indeterminate("permission client shut down");
        };
        let response = self
            .http
            .get(url)
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .header(TOKEN_HEADER, identity.principal())
            .header(KEY_HEADER, identity.secret())
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => AccessDecision::Allowed,
            Ok(resp) => AccessDecision::Denied {
                status: resp.status().as_u16(),
            },
            Err(err) => AccessDecision::indeterminate(format!("request failed: {err}")),
        }
    }
}

#[async_trait]
impl PermissionService for HttpPermissionClient {
    async fn check(&self, identity: &Identity, resource: &str) -> AccessDecision {
        let url = self.resource_url(resource);
        tracing::debug!(
            principal = identity.principal(),
            %url,
            "checking remote permission"
        );
        // Waiting for a permit counts against the timeout too.
        match tokio::time::timeout(self.timeout, self.send(identity, url)).await {
            Ok(decision) => decision,
            Err(_) => AccessDecision::indeterminate(format!(
                "check timed out after {}ms",
                self.timeout.as_millis()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RemoteConfig, Scheme};

    fn client(base_path: &str) -> HttpPermissionClient {
        HttpPermissionClient::from_config(&RemoteConfig {
            host: "permissions.local".into(),
            port: 8080,
            base_path: base_path.into(),
            scheme: Scheme::Http,
            ..RemoteConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn identity_resource_joins_base_path() {
        let url = client("/weaviate/v1").resource_url(IDENTITY_RESOURCE);
        assert_eq!(url.as_str(), "http://permissions.local:8080/weaviate/v1/keys/me");
    }

    #[test]
    fn trailing_slash_on_base_is_not_doubled() {
        let url = client("/weaviate/v1/").resource_url("sensors/temp");
        assert_eq!(
            url.as_str(),
            "http://permissions.local:8080/weaviate/v1/sensors/temp"
        );
    }

    #[test]
    fn wildcard_topics_are_escaped() {
        let url = client("/api").resource_url("alerts/#");
        assert_eq!(url.as_str(), "http://permissions.local:8080/api/alerts/%23");
        let url = client("/api").resource_url("a/+/b?x");
        assert_eq!(url.path(), "/api/a/+/b%3Fx");
    }
}
