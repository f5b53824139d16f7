//! QoS 2 delivery-state persistence.
//!
//! The only delivery state the adapter persists durably is the second phase
//! of an outbound QoS 2 exchange: once the client answers PUBREC, a record
//! keyed by `(identity, packet id)` survives until PUBCOMP arrives, so a
//! reconnecting session resumes at PUBREL instead of re-publishing.

use crate::auth::Identity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Persisted state for one outbound QoS 2 delivery past PUBREC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryState {
    sequence_number: u64,
}

impl DeliveryState {
    /// Upstream sequence number of the message this record tracks; used to
    /// detect a stale record when a packet id is reassigned.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}

/// Store collaborator for QoS 2 delivery state, shared across connections.
#[async_trait]
pub trait Qos2StateStore: Send + Sync {
    async fn get(&self, identity: &Identity, packet_id: u16)
        -> anyhow::Result<Option<DeliveryState>>;

    async fn set(
        &self,
        identity: &Identity,
        packet_id: u16,
        state: &DeliveryState,
    ) -> anyhow::Result<()>;

    async fn delete(&self, identity: &Identity, packet_id: u16) -> anyhow::Result<()>;

    fn create(&self, sequence_number: u64) -> DeliveryState {
        DeliveryState { sequence_number }
    }
}

/// Map-backed store for embedded deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryQos2Store {
    records: parking_lot::Mutex<HashMap<(String, u16), DeliveryState>>,
}

impl InMemoryQos2Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl Qos2StateStore for InMemoryQos2Store {
    async fn get(
        &self,
        identity: &Identity,
        packet_id: u16,
    ) -> anyhow::Result<Option<DeliveryState>> {
        Ok(self
            .records
            .lock()
            .get(&(identity.id.clone(), packet_id))
            .cloned())
    }

    async fn set(
        &self,
        identity: &Identity,
        packet_id: u16,
        state: &DeliveryState,
    ) -> anyhow::Result<()> {
        self.records
            .lock()
            .insert((identity.id.clone(), packet_id), state.clone());
        Ok(())
    }

    async fn delete(&self, identity: &Identity, packet_id: u16) -> anyhow::Result<()> {
        self.records.lock().remove(&(identity.id.clone(), packet_id));
        Ok(())
    }
}
