//! Inbound PUBLISH processors.
//!
//! Device-to-service publishes are routed to the sending client the bridge
//! resolves for the topic, one FIFO worker per client so per-client send
//! order is preserved while distinct clients proceed independently. The
//! worker posts a settle event back to the connection task after each
//! upstream send; the QoS response (PUBACK for QoS 1) is written there, so
//! it never races the send it acknowledges.

use crate::bridge::{SendingClient, UpstreamMessage};
use crate::protocol::{PublishPacket, Qos};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::Event;

pub(crate) struct InboundJob {
    pub packet: PublishPacket,
}

/// Connection-task view of one per-client worker. The backlog counter lives
/// here, on the connection task, and feeds read throttling.
pub(crate) struct InboundProcessor {
    tx: mpsc::UnboundedSender<InboundJob>,
    backlog: usize,
    max_pending: usize,
}

impl InboundProcessor {
    /// Spawn the worker for `client` and return its processor handle.
    pub fn spawn(
        key: String,
        client: Arc<dyn SendingClient>,
        property_prefix: String,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let max_pending = client.max_pending_messages();
        let (tx, mut rx) = mpsc::unbounded_channel::<InboundJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let message = build_upstream_message(
                    client.as_ref(),
                    &job.packet.topic,
                    job.packet.payload.clone(),
                    job.packet.qos,
                    job.packet.retain,
                    &property_prefix,
                    false,
                );
                let result = client.send(message).await;
                let settled = Event::InboundSettled {
                    key: key.clone(),
                    qos: job.packet.qos,
                    packet_id: job.packet.packet_id,
                    result,
                };
                if events.send(settled).is_err() {
                    break;
                }
            }
        });
        Self {
            tx,
            backlog: 0,
            max_pending,
        }
    }

    pub fn post(&mut self, packet: PublishPacket) {
        self.backlog += 1;
        let _ = self.tx.send(InboundJob { packet });
    }

    pub fn settle(&mut self) {
        self.backlog = self.backlog.saturating_sub(1);
    }

    pub fn backlog(&self) -> usize {
        self.backlog
    }

    pub fn has_capacity(&self) -> bool {
        self.backlog < self.max_pending
    }
}

/// Build the upstream rendering of a device publish (or its will). Packet
/// metadata rides along as service properties under the configured prefix.
pub(crate) fn build_upstream_message(
    client: &dyn SendingClient,
    topic: &str,
    payload: Bytes,
    qos: Qos,
    retain: bool,
    property_prefix: &str,
    is_will: bool,
) -> UpstreamMessage {
    let mut message = client.create_message(topic, payload);
    message
        .properties
        .insert(format!("{property_prefix}qos"), qos.level().to_string());
    if retain {
        message
            .properties
            .insert(format!("{property_prefix}retain"), "true".to_string());
    }
    if is_will {
        message
            .properties
            .insert(format!("{property_prefix}messageType"), "Will".to_string());
    }
    message
}
