//! Authorization bridge between the protocol engine's hooks and the remote permission service.
//!
//! Connect checks always go to the remote service. Subscribe and publish checks
//! consult the session's topic cache first; on a miss, concurrent identical checks
//! for the same session share a single remote call whose result is recorded in the
//! cache (unless indeterminate) before any waiter observes it.

use super::client::{PermissionService, IDENTITY_RESOURCE};
use super::decision::{AccessDecision, Action, AuthzError};
use super::session::{ConnectionId, Credentials, Identity, PendingCheck, SessionStore};
use crate::lifecycle::{LifecycleEvent, LifecycleLogger};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct AuthorizationBridge {
    sessions: Arc<SessionStore>,
    service: Arc<dyn PermissionService>,
    lifecycle: LifecycleLogger,
}

impl AuthorizationBridge {
    pub fn new(
        sessions: Arc<SessionStore>,
        service: Arc<dyn PermissionService>,
        lifecycle: LifecycleLogger,
    ) -> Self {
        Self {
            sessions,
            service,
            lifecycle,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn lifecycle(&self) -> &LifecycleLogger {
        &self.lifecycle
    }

    /// Connect hook. Validates the identity against `keys/me` and binds it to the session.
    pub async fn authenticate(
        &self,
        connection: &ConnectionId,
        credentials: Credentials,
    ) -> Result<(), AuthzError> {
        let identity = match Identity::try_from(credentials) {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(connection = %connection, reason = %err, "rejecting connect");
                return Err(err);
            }
        };
        let session = self.sessions.get_or_create(connection);
        if session.lock().identity().is_some() {
            return Err(self.misuse(connection, "authenticate", IDENTITY_RESOURCE));
        }
        drop(session);

        let decision = self.service.check(&identity, IDENTITY_RESOURCE).await;
        match decision {
            AccessDecision::Allowed => {
                // The connection may have gone away while the check was running.
                let Some(session) = self.sessions.get(connection) else {
                    tracing::debug!(
                        connection = %connection,
                        "connection closed during authentication; discarding result"
                    );
                    return Err(AuthzError::RemoteUnreachable {
                        resource: IDENTITY_RESOURCE.to_string(),
                        reason: "connection closed during authentication".into(),
                    });
                };
                if !session.lock().bind_identity(identity.clone()) {
                    return Err(self.misuse(connection, "authenticate", IDENTITY_RESOURCE));
                }
                tracing::info!(
                    connection = %connection,
                    principal = identity.principal(),
                    "User ({}) connected with id: {}",
                    identity.principal(),
                    connection
                );
                Ok(())
            }
            AccessDecision::Denied { status } => {
                tracing::info!(
                    connection = %connection,
                    principal = identity.principal(),
                    status,
                    "User ({}) fails to connect",
                    identity.principal()
                );
                Err(AuthzError::RemoteRejection {
                    resource: IDENTITY_RESOURCE.to_string(),
                    status,
                })
            }
            AccessDecision::Indeterminate { reason } => {
                tracing::error!(
                    connection = %connection,
                    principal = identity.principal(),
                    %reason,
                    "cannot reach permission service to authenticate"
                );
                Err(AuthzError::RemoteUnreachable {
                    resource: IDENTITY_RESOURCE.to_string(),
                    reason,
                })
            }
        }
    }

    /// Subscribe hook.
    pub async fn authorize_subscribe(
        &self,
        connection: &ConnectionId,
        topic: &str,
    ) -> Result<(), AuthzError> {
        self.authorize(Action::Subscribe, connection, topic).await
    }

    /// Publish hook.
    pub async fn authorize_publish(
        &self,
        connection: &ConnectionId,
        topic: &str,
    ) -> Result<(), AuthzError> {
        self.authorize(Action::Publish, connection, topic).await
    }

    async fn authorize(
        &self,
        action: Action,
        connection: &ConnectionId,
        topic: &str,
    ) -> Result<(), AuthzError> {
        let Some(session) = self.sessions.get(connection) else {
            return Err(self.misuse(connection, action.label(), topic));
        };
        let waiter = {
            let mut guard = session.lock();
            let Some(identity) = guard.identity().cloned() else {
                drop(guard);
                return Err(self.misuse(connection, action.label(), topic));
            };
            if let Some(cached) = guard.cache().lookup(action, topic) {
                tracing::trace!(
                    connection = %connection,
                    action = action.label(),
                    topic,
                    allowed = cached.is_allowed(),
                    "topic decision served from cache"
                );
                return AccessDecision::from(cached).into_result(topic);
            }
            match guard.join_pending(action, topic) {
                Some(rx) => rx,
                None => {
                    let (tx, rx) = watch::channel(None);
                    guard.register_pending(action, topic, rx.clone());
                    self.spawn_check(
                        action,
                        connection.clone(),
                        guard.generation(),
                        identity,
                        topic.to_string(),
                        tx,
                    );
                    rx
                }
            }
        };
        let decision = await_decision(waiter).await;
        self.log_outcome(action, connection, topic, &decision);
        decision.into_result(topic)
    }

    /// Run the remote check detached from the calling hook so that every waiter,
    /// and the cache, see the outcome even if the first caller goes away.
    fn spawn_check(
        &self,
        action: Action,
        connection: ConnectionId,
        generation: u64,
        identity: Identity,
        topic: String,
        tx: watch::Sender<Option<AccessDecision>>,
    ) {
        let service = self.service.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let decision = service.check(&identity, &topic).await;
            match sessions.get(&connection) {
                Some(session) => {
                    let mut guard = session.lock();
                    if guard.generation() == generation {
                        let outcome = guard.complete_pending(action, &topic, &decision);
                        tracing::trace!(
                            connection = %connection,
                            action = action.label(),
                            topic,
                            ?outcome,
                            "recorded topic decision"
                        );
                    }
                }
                None => tracing::debug!(
                    connection = %connection,
                    action = action.label(),
                    topic,
                    "session gone before check completed; discarding result"
                ),
            }
            tx.send_replace(Some(decision));
        });
    }

    fn log_outcome(
        &self,
        action: Action,
        connection: &ConnectionId,
        topic: &str,
        decision: &AccessDecision,
    ) {
        match (action, decision) {
            (Action::Subscribe, AccessDecision::Allowed) => tracing::info!(
                connection = %connection,
                topic,
                "Subscribe ({}) to: {}",
                connection,
                topic
            ),
            (Action::Publish, AccessDecision::Allowed) => tracing::debug!(
                connection = %connection,
                topic,
                "publish allowed"
            ),
            (Action::Subscribe, AccessDecision::Denied { status }) => tracing::info!(
                connection = %connection,
                topic,
                status,
                "Can not subscribe ({}) to: {}",
                connection,
                topic
            ),
            (Action::Publish, AccessDecision::Denied { status }) => tracing::info!(
                connection = %connection,
                topic,
                status,
                "not allowed to publish to: {}",
                topic
            ),
            (_, AccessDecision::Indeterminate { reason }) => tracing::error!(
                connection = %connection,
                action = action.label(),
                topic,
                %reason,
                "permission check failed; denying without caching"
            ),
        }
    }

    fn misuse(&self, connection: &ConnectionId, hook: &str, resource: &str) -> AuthzError {
        tracing::error!(
            connection = %connection,
            hook,
            resource,
            "hook fired for a connection without an established identity"
        );
        AuthzError::ProtocolMisuse {
            connection: connection.to_string(),
        }
    }

    pub fn on_connected(&self, connection: &ConnectionId) {
        let principal = self
            .sessions
            .get(connection)
            .and_then(|session| {
                let guard = session.lock();
                guard.identity().map(|i| i.principal().to_string())
            })
            .unwrap_or_default();
        self.lifecycle.emit(LifecycleEvent::Connected {
            connection_id: connection.to_string(),
            principal,
        });
    }

    /// Drop the session of a connection refused at CONNECT without emitting a lifecycle event.
    pub fn discard(&self, connection: &ConnectionId) {
        self.sessions.remove(connection);
    }

    /// Drops the session; checks still running for it complete and are discarded.
    pub fn on_disconnected(&self, connection: &ConnectionId) {
        self.sessions.remove(connection);
        self.lifecycle.emit(LifecycleEvent::Disconnected {
            connection_id: connection.to_string(),
        });
    }

    pub fn on_client_error(&self, connection: &ConnectionId, error: &str) {
        self.lifecycle.emit(LifecycleEvent::ClientError {
            connection_id: connection.to_string(),
            error: error.to_string(),
        });
    }

    pub fn on_connection_error(&self, connection: Option<&ConnectionId>, error: &str) {
        self.lifecycle.emit(LifecycleEvent::ConnectionError {
            connection_id: connection.map(ToString::to_string),
            error: error.to_string(),
        });
    }

    pub fn on_published(&self, connection: &ConnectionId, topic: &str) {
        self.lifecycle.emit(LifecycleEvent::Published {
            connection_id: connection.to_string(),
            topic: topic.to_string(),
        });
    }

    pub fn on_subscribed(&self, connection: &ConnectionId, topics: Vec<String>) {
        self.lifecycle.emit(LifecycleEvent::Subscribed {
            connection_id: connection.to_string(),
            topics,
        });
    }
}

async fn await_decision(mut rx: PendingCheck) -> AccessDecision {
    match rx.wait_for(Option::is_some).await {
        Ok(value) => {
            let decision: Option<AccessDecision> = (*value).clone();
            decision.unwrap_or_else(|| AccessDecision::indeterminate("check produced no decision"))
        }
        Err(_) => AccessDecision::indeterminate("permission check abandoned"),
    }
}
