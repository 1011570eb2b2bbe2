//! Subscription table and QoS 0 fan-out.

use super::protocol::encode_publish;
use super::topics::topic_matches;
use crate::authz::ConnectionId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Encoded frames queued for a connection's writer task.
pub type Outbound = mpsc::Sender<Vec<u8>>;

struct Subscriber {
    outbound: Outbound,
    filters: HashSet<String>,
}

#[derive(Default)]
pub struct Router {
    subscribers: RwLock<HashMap<ConnectionId, Subscriber>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: &ConnectionId, outbound: Outbound) {
        self.subscribers.write().insert(
            connection.clone(),
            Subscriber {
                outbound,
                filters: HashSet::new(),
            },
        );
    }

    /// Returns false when the connection is not registered.
    pub fn subscribe(&self, connection: &ConnectionId, filter: &str) -> bool {
        match self.subscribers.write().get_mut(connection) {
            Some(sub) => {
                sub.filters.insert(filter.to_string());
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self, connection: &ConnectionId, filter: &str) -> bool {
        self.subscribers
            .write()
            .get_mut(connection)
            .is_some_and(|sub| sub.filters.remove(filter))
    }

    pub fn remove(&self, connection: &ConnectionId) {
        self.subscribers.write().remove(connection);
    }

    pub fn filters(&self, connection: &ConnectionId) -> Vec<String> {
        let mut filters: Vec<_> = self
            .subscribers
            .read()
            .get(connection)
            .map(|sub| sub.filters.iter().cloned().collect())
            .unwrap_or_default();
        filters.sort();
        filters
    }

    /// Deliver to every connection with at least one matching filter; a connection
    /// matching several filters still receives a single copy. Returns the number of
    /// connections the frame was queued for.
    pub fn publish(&self, topic: &str, payload: &[u8]) -> usize {
        let frame = encode_publish(topic, payload);
        let guard = self.subscribers.read();
        let mut delivered = 0;
        for (connection, sub) in guard.iter() {
            if !sub.filters.iter().any(|f| topic_matches(f, topic)) {
                continue;
            }
            match sub.outbound.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(connection = %connection, topic, "outbound queue full; dropping message");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(connection = %connection, topic, "outbound queue closed");
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
