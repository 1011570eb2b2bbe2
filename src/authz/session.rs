use super::cache::{RecordOutcome, TopicAccessCache};
use super::decision::{AccessDecision, Action, AuthzError};
use parking_lot::{Mutex, RwLock};
use reqwest::header::HeaderValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Opaque identifier assigned by the protocol engine, unique for a connection's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw credential fields as presented in CONNECT.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }
}

/// Validated (principal, secret) pair forwarded to the permission service as headers.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    principal: String,
    secret: String,
}

impl Identity {
    pub fn new(principal: impl Into<String>, secret: impl Into<String>) -> Result<Self, AuthzError> {
        let principal = principal.into();
        let secret = secret.into();
        if principal.is_empty() {
            return Err(AuthzError::MalformedCredentials("empty username"));
        }
        if secret.is_empty() {
            return Err(AuthzError::MalformedCredentials("empty password"));
        }
        if !header_safe(&principal) || !header_safe(&secret) {
            return Err(AuthzError::MalformedCredentials(
                "credentials contain characters not allowed in headers",
            ));
        }
        Ok(Self { principal, secret })
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("principal", &self.principal)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl TryFrom<Credentials> for Identity {
    type Error = AuthzError;

    fn try_from(creds: Credentials) -> Result<Self, Self::Error> {
        let Some(username) = creds.username else {
            return Err(AuthzError::MalformedCredentials("no username set"));
        };
        let Some(password) = creds.password else {
            return Err(AuthzError::MalformedCredentials("no password set"));
        };
        let password = String::from_utf8(password)
            .map_err(|_| AuthzError::MalformedCredentials("password is not valid UTF-8"))?;
        Identity::new(username, password)
    }
}

fn header_safe(value: &str) -> bool {
    HeaderValue::from_str(value).is_ok()
}

/// Receiver side of a remote check that is still running.
pub type PendingCheck = watch::Receiver<Option<AccessDecision>>;

/// Authorization state for one live connection.
#[derive(Debug)]
pub struct ClientSession {
    connection_id: ConnectionId,
    generation: u64,
    identity: Option<Identity>,
    cache: TopicAccessCache,
    pending: HashMap<(Action, String), PendingCheck>,
}

impl ClientSession {
    fn new(connection_id: ConnectionId, generation: u64, max_cached_topics: usize) -> Self {
        Self {
            connection_id,
            generation,
            identity: None,
            cache: TopicAccessCache::new(max_cached_topics),
            pending: HashMap::new(),
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Distinguishes this session from any later one created under the same id.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Bind the identity once; a second bind is refused and leaves the first in place.
    pub fn bind_identity(&mut self, identity: Identity) -> bool {
        if self.identity.is_some() {
            return false;
        }
        self.identity = Some(identity);
        true
    }

    pub fn cache(&self) -> &TopicAccessCache {
        &self.cache
    }

    /// Join a check already in flight for (action, topic), if its worker is still alive.
    pub fn join_pending(&mut self, action: Action, topic: &str) -> Option<PendingCheck> {
        let key = (action, topic.to_string());
        match self.pending.get(&key) {
            Some(rx) if rx.has_changed().is_ok() => Some(rx.clone()),
            Some(_) => {
                self.pending.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn register_pending(&mut self, action: Action, topic: &str, rx: PendingCheck) {
        self.pending.insert((action, topic.to_string()), rx);
    }

    /// Record the outcome of a finished check and retire its in-flight entry.
    pub fn complete_pending(
        &mut self,
        action: Action,
        topic: &str,
        decision: &AccessDecision,
    ) -> RecordOutcome {
        let outcome = self.cache.record(action, topic, decision);
        self.pending.remove(&(action, topic.to_string()));
        outcome
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

pub type SharedSession = Arc<Mutex<ClientSession>>;

/// Process-wide connection id -> session map.
///
/// The map lock is only held to find, insert or remove an entry; mutations of a
/// session's decision maps are serialized by that session's own mutex, so hooks
/// for different connections never contend beyond the map lookup.
pub struct SessionStore {
    sessions: RwLock<HashMap<ConnectionId, SharedSession>>,
    next_generation: AtomicU64,
    max_cached_topics: usize,
}

impl SessionStore {
    pub fn new(max_cached_topics: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            max_cached_topics,
        }
    }

    pub fn get_or_create(&self, connection_id: &ConnectionId) -> SharedSession {
        if let Some(existing) = self.get(connection_id) {
            return existing;
        }
        let mut guard = self.sessions.write();
        guard
            .entry(connection_id.clone())
            .or_insert_with(|| {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                Arc::new(Mutex::new(ClientSession::new(
                    connection_id.clone(),
                    generation,
                    self.max_cached_topics,
                )))
            })
            .clone()
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<SharedSession> {
        self.sessions.read().get(connection_id).cloned()
    }

    pub fn remove(&self, connection_id: &ConnectionId) -> Option<SharedSession> {
        self.sessions.write().remove(connection_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(4_096)
    }
}
