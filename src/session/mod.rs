//! Per-identity session state and its store collaborator.
//!
//! Session state carries the ordered subscription list and survives
//! reconnects for non-transient sessions. The adapter mutates a copy during
//! subscription changes and swaps it in only after the store accepts the
//! write, so a failed persist never leaves half-applied state behind.

pub mod topics;

use crate::auth::Identity;
use crate::protocol::Qos;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// A single subscription: topic filter, granted QoS, creation stamp.
///
/// The creation stamp orders the subscription against upstream messages: a
/// subscription only applies to messages created after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic_filter: String,
    pub qos: Qos,
    pub created_at: SystemTime,
}

impl Subscription {
    pub fn new(topic_filter: impl Into<String>, qos: Qos, created_at: SystemTime) -> Self {
        Self {
            topic_filter: topic_filter.into(),
            qos,
            created_at,
        }
    }
}

/// Session state for one authenticated identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionState {
    transient: bool,
    subscriptions: Vec<Subscription>,
}

impl SessionState {
    pub fn new(transient: bool) -> Self {
        Self {
            transient,
            subscriptions: Vec::new(),
        }
    }

    /// Transient sessions are never persisted and are discarded on close.
    pub fn is_transient(&self) -> bool {
        self.transient
    }

    /// Ordered, read-only view of the subscriptions.
    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Independent editable copy for a copy-on-write mutation pass.
    pub fn copy(&self) -> SessionState {
        self.clone()
    }

    /// Add or replace the subscription for `topic_filter`. Replacement keeps
    /// queue position but refreshes QoS and the creation stamp.
    pub fn upsert_subscription(&mut self, topic_filter: &str, qos: Qos, created_at: SystemTime) {
        match self
            .subscriptions
            .iter_mut()
            .find(|s| s.topic_filter == topic_filter)
        {
            Some(existing) => {
                existing.qos = qos;
                existing.created_at = created_at;
            }
            None => self
                .subscriptions
                .push(Subscription::new(topic_filter, qos, created_at)),
        }
    }

    /// Remove the subscription for `topic_filter`; true if one was present.
    pub fn remove_subscription(&mut self, topic_filter: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.topic_filter != topic_filter);
        self.subscriptions.len() != before
    }
}

/// Store collaborator for session state, shared across connections.
#[async_trait]
pub trait SessionStateStore: Send + Sync {
    async fn get(&self, identity: &Identity) -> anyhow::Result<Option<SessionState>>;

    async fn set(&self, identity: &Identity, state: &SessionState) -> anyhow::Result<()>;

    async fn delete(&self, identity: &Identity) -> anyhow::Result<()>;

    fn create(&self, transient: bool) -> SessionState;
}

/// Map-backed store for embedded deployments and tests.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: parking_lot::Mutex<HashMap<String, SessionState>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[async_trait]
impl SessionStateStore for InMemorySessionStore {
    async fn get(&self, identity: &Identity) -> anyhow::Result<Option<SessionState>> {
        Ok(self.sessions.lock().get(&identity.id).cloned())
    }

    async fn set(&self, identity: &Identity, state: &SessionState) -> anyhow::Result<()> {
        self.sessions
            .lock()
            .insert(identity.id.clone(), state.clone());
        Ok(())
    }

    async fn delete(&self, identity: &Identity) -> anyhow::Result<()> {
        self.sessions.lock().remove(&identity.id);
        Ok(())
    }

    fn create(&self, transient: bool) -> SessionState {
        SessionState::new(transient)
    }
}
