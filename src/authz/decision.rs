//! Decision values exchanged between the remote client, the topic cache and the hooks.

use std::fmt;
use thiserror::Error;

/// Which hook a topic check belongs to. The two action spaces never share cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Subscribe,
    Publish,
}

impl Action {
    pub fn label(self) -> &'static str {
        match self {
            Action::Subscribe => "subscribe",
            Action::Publish => "publish",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Ternary outcome of a single remote permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    /// Remote service answered with a 2xx status.
    Allowed,
    /// Remote service answered with any other status.
    Denied { status: u16 },
    /// Transport failure, timeout or a check that never completed.
    Indeterminate { reason: String },
}

impl AccessDecision {
    pub fn indeterminate(reason: impl Into<String>) -> Self {
        Self::Indeterminate {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }

    /// The memoizable projection of this decision; `None` for indeterminate outcomes.
    pub fn cacheable(&self) -> Option<CachedDecision> {
        match self {
            AccessDecision::Allowed => Some(CachedDecision::Allowed),
            AccessDecision::Denied { status } => Some(CachedDecision::Denied { status: *status }),
            AccessDecision::Indeterminate { .. } => None,
        }
    }

    /// Resolve into the hook contract for `resource`.
    pub fn into_result(self, resource: &str) -> Result<(), AuthzError> {
        match self {
            AccessDecision::Allowed => Ok(()),
            AccessDecision::Denied { status } => Err(AuthzError::RemoteRejection {
                resource: resource.to_string(),
                status,
            }),
            AccessDecision::Indeterminate { reason } => Err(AuthzError::RemoteUnreachable {
                resource: resource.to_string(),
                reason,
            }),
        }
    }
}

/// A definitive decision held in a session's topic cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedDecision {
    Allowed,
    Denied { status: u16 },
}

impl CachedDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, CachedDecision::Allowed)
    }
}

impl From<CachedDecision> for AccessDecision {
    fn from(cached: CachedDecision) -> Self {
        match cached {
            CachedDecision::Allowed => AccessDecision::Allowed,
            CachedDecision::Denied { status } => AccessDecision::Denied { status },
        }
    }
}

/// Reasons a hook refuses an action. Every variant is a denial; none escapes the bridge as a panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthzError {
    #[error("malformed credentials: {0}")]
    MalformedCredentials(&'static str),
    #[error("remote service rejected {resource} with status {status}")]
    RemoteRejection { resource: String, status: u16 },
    #[error("remote service unreachable while checking {resource}: {reason}")]
    RemoteUnreachable { resource: String, reason: String },
    #[error("hook invoked for connection {connection} without an established identity")]
    ProtocolMisuse { connection: String },
}

impl AuthzError {
    /// A later attempt may succeed once the remote service recovers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthzError::RemoteUnreachable { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            AuthzError::MalformedCredentials(_) => "malformed_credentials",
            AuthzError::RemoteRejection { .. } => "remote_rejection",
            AuthzError::RemoteUnreachable { .. } => "remote_unreachable",
            AuthzError::ProtocolMisuse { .. } => "protocol_misuse",
        }
    }
}
