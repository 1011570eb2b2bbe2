//! Lifecycle event sink.
//!
//! Connection, subscription and publish notifications are emitted as structured
//! `tracing` events under the `lifecycle` target. Emission never fails and never
//! feeds back into authorization outcomes. An optional in-memory recorder keeps a
//! copy of every event for inspection.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::event;
use tracing::Level;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected {
        connection_id: String,
        principal: String,
    },
    Disconnected {
        connection_id: String,
    },
    ClientError {
        connection_id: String,
        error: String,
    },
    ConnectionError {
        connection_id: Option<String>,
        error: String,
    },
    Published {
        connection_id: String,
        topic: String,
    },
    Subscribed {
        connection_id: String,
        topics: Vec<String>,
    },
}

impl LifecycleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::Connected { .. } => "client_connected",
            LifecycleEvent::Disconnected { .. } => "client_disconnected",
            LifecycleEvent::ClientError { .. } => "client_error",
            LifecycleEvent::ConnectionError { .. } => "connection_error",
            LifecycleEvent::Published { .. } => "message_published",
            LifecycleEvent::Subscribed { .. } => "subscription_made",
        }
    }
}

#[derive(Clone, Default)]
pub struct LifecycleLogger {
    recorder: Option<Arc<Mutex<Vec<LifecycleEvent>>>>,
}

impl LifecycleLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logger that also keeps every emitted event in memory.
    pub fn recording() -> Self {
        Self {
            recorder: Some(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.recorder
            .as_ref()
            .map(|r| r.lock().clone())
            .unwrap_or_default()
    }

    pub fn emit(&self, lifecycle: LifecycleEvent) {
        let kind = lifecycle.kind();
        match &lifecycle {
            LifecycleEvent::Connected {
                connection_id,
                principal,
            } => event!(
                target: "lifecycle",
                Level::DEBUG,
                event = kind,
                %connection_id,
                %principal,
                "new client connected with id: {connection_id}"
            ),
            LifecycleEvent::Disconnected { connection_id } => event!(
                target: "lifecycle",
                Level::DEBUG,
                event = kind,
                %connection_id,
                "client disconnected"
            ),
            LifecycleEvent::ClientError {
                connection_id,
                error,
            } => event!(
                target: "lifecycle",
                Level::ERROR,
                event = kind,
                %connection_id,
                %error,
                "client error {error}"
            ),
            LifecycleEvent::ConnectionError {
                connection_id,
                error,
            } => event!(
                target: "lifecycle",
                Level::ERROR,
                event = kind,
                connection_id = connection_id.as_deref().unwrap_or("-"),
                %error,
                "connection error {error}"
            ),
            LifecycleEvent::Published {
                connection_id,
                topic,
            } => event!(
                target: "lifecycle",
                Level::DEBUG,
                event = kind,
                %connection_id,
                %topic,
                "message from client {connection_id}"
            ),
            LifecycleEvent::Subscribed {
                connection_id,
                topics,
            } => event!(
                target: "lifecycle",
                Level::DEBUG,
                event = kind,
                %connection_id,
                topics = ?topics,
                "subscribe from client {connection_id}"
            ),
        }
        if let Some(recorder) = &self.recorder {
            recorder.lock().push(lifecycle);
        }
    }
}
